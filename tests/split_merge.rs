use aerokv::error::TreeError;
use aerokv::storage::{
    btree::BTree,
    page::{Node, NodeType, PagePtr, MAX_KEY_SIZE, MAX_VAL_SIZE, MERGE_THRESHOLD, PAGE_SIZE},
    pager::{MemPager, PageStore},
    split::node_append_kv,
};

fn big_key(c: u8) -> Vec<u8> {
    vec![c; MAX_KEY_SIZE]
}

fn leaf(store: &mut MemPager, records: &[(Vec<u8>, Vec<u8>)]) -> (PagePtr, Vec<u8>) {
    let mut node = Node::new(NodeType::Leaf, records.len() as u16);
    for (i, (k, v)) in records.iter().enumerate() {
        node_append_kv(&mut node, i as u16, 0, k, v).unwrap();
    }
    (store.allocate(&node).unwrap(), records[0].0.clone())
}

fn internal(store: &mut MemPager, kids: &[(PagePtr, Vec<u8>)]) -> PagePtr {
    let mut node = Node::new(NodeType::Internal, kids.len() as u16);
    for (i, (ptr, key)) in kids.iter().enumerate() {
        node_append_kv(&mut node, i as u16, *ptr, key, &[]).unwrap();
    }
    store.allocate(&node).unwrap()
}

/// `n` records named `{prefix}00`, `{prefix}01`, ... with `vlen`-byte values.
fn run(prefix: &str, n: usize, vlen: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| (format!("{}{:02}", prefix, i).into_bytes(), vec![b'v'; vlen]))
        .collect()
}

fn root_node(tree: &mut BTree<MemPager>) -> Node {
    let root = tree.root();
    tree.store_mut().fetch(root).unwrap()
}

#[test]
fn second_maximum_record_splits_the_root() {
    let mut tree = BTree::new(MemPager::new());
    tree.insert(&big_key(b'a'), &vec![1; MAX_VAL_SIZE]).unwrap();
    tree.insert(&big_key(b'b'), &vec![2; MAX_VAL_SIZE]).unwrap();

    let root = root_node(&mut tree);
    assert_eq!(root.node_type().unwrap(), NodeType::Internal);
    assert_eq!(root.nkeys(), 2);
    for i in 0..2 {
        let kid = tree.store_mut().fetch(root.ptr(i).unwrap()).unwrap();
        assert_eq!(kid.node_type().unwrap(), NodeType::Leaf);
        assert_eq!(kid.nkeys(), 1);
        assert!(kid.nbytes().unwrap() <= PAGE_SIZE);
    }
    let stats = tree.verify().unwrap();
    assert_eq!(stats.height, 2);
    assert_eq!(stats.leaf_pages, 2);
}

#[test]
fn emptied_leaf_is_merged_away_and_root_collapses() {
    let mut tree = BTree::new(MemPager::new());
    for c in [b'a', b'b', b'c'] {
        tree.insert(&big_key(c), &vec![c; MAX_VAL_SIZE]).unwrap();
    }
    assert_eq!(root_node(&mut tree).nkeys(), 3);

    assert!(tree.delete(&big_key(b'b')).unwrap());
    assert_eq!(root_node(&mut tree).nkeys(), 2);
    assert_eq!(tree.verify().unwrap().height, 2);

    assert!(tree.delete(&big_key(b'c')).unwrap());
    let root = root_node(&mut tree);
    assert_eq!(root.node_type().unwrap(), NodeType::Leaf);
    assert_eq!(tree.verify().unwrap().height, 1);
    assert_eq!(tree.store().len(), 1);

    assert!(tree.delete(&big_key(b'a')).unwrap());
    assert_eq!(tree.root(), 0);
    assert!(tree.store().is_empty());
}

#[test]
fn underfull_leaf_borrows_from_a_full_left_sibling() {
    let mut store = MemPager::new();
    let left = leaf(&mut store, &run("a", 28, 126));
    let right = leaf(&mut store, &run("z", 2, 100));
    let root = internal(&mut store, &[left, right]);
    let mut tree = BTree::open(store, root);
    tree.verify().unwrap();

    assert!(tree.delete(b"z00").unwrap());

    let root = root_node(&mut tree);
    assert_eq!(root.nkeys(), 2);
    let l = tree.store_mut().fetch(root.ptr(0).unwrap()).unwrap();
    let r = tree.store_mut().fetch(root.ptr(1).unwrap()).unwrap();
    assert!(l.nkeys() < 28);
    assert!(r.nkeys() > 1);
    assert!(l.nbytes().unwrap() >= MERGE_THRESHOLD);
    assert!(r.nbytes().unwrap() >= MERGE_THRESHOLD);
    assert_eq!(root.key(1).unwrap(), r.key(0).unwrap());

    assert_eq!(tree.verify().unwrap().keys, 29);
    assert_eq!(tree.get(b"z01").unwrap(), Some(vec![b'v'; 100]));
    assert_eq!(tree.store().len(), 3);
}

#[test]
fn underfull_first_leaf_borrows_from_its_right_sibling() {
    let mut store = MemPager::new();
    let left = leaf(&mut store, &run("a", 2, 100));
    let right = leaf(&mut store, &run("b", 28, 126));
    let root = internal(&mut store, &[left, right]);
    let mut tree = BTree::open(store, root);

    assert!(tree.delete(b"a00").unwrap());

    let root = root_node(&mut tree);
    assert_eq!(root.nkeys(), 2);
    assert_eq!(root.key(0).unwrap(), b"a01");
    let r = tree.store_mut().fetch(root.ptr(1).unwrap()).unwrap();
    assert!(r.nkeys() < 28);
    assert_eq!(tree.verify().unwrap().keys, 29);
}

#[test]
fn underfull_leaf_merges_into_roomy_sibling() {
    let mut store = MemPager::new();
    let left = leaf(&mut store, &run("a", 10, 100));
    let right = leaf(&mut store, &run("b", 3, 100));
    let root = internal(&mut store, &[left, right]);
    let mut tree = BTree::open(store, root);

    assert!(tree.delete(b"b01").unwrap());

    let root = root_node(&mut tree);
    assert_eq!(root.node_type().unwrap(), NodeType::Leaf);
    assert_eq!(root.nkeys(), 12);
    assert_eq!(tree.store().len(), 1);
}

#[test]
fn deleting_the_first_key_updates_the_separator() {
    let mut store = MemPager::new();
    let left = leaf(&mut store, &run("a", 10, 300));
    let right = leaf(&mut store, &run("b", 10, 300));
    let root = internal(&mut store, &[left, right]);
    let mut tree = BTree::open(store, root);

    assert!(tree.delete(b"b00").unwrap());
    assert_eq!(root_node(&mut tree).key(1).unwrap(), b"b01");
    tree.verify().unwrap();

    // Smaller than every key: lands at the front of the first leaf.
    tree.insert(b"0", b"front").unwrap();
    assert_eq!(root_node(&mut tree).key(0).unwrap(), b"0");
    tree.verify().unwrap();
}

#[test]
fn three_level_tree_shrinks_back_to_nothing() {
    let mut tree = BTree::new(MemPager::new());
    let keys: Vec<Vec<u8>> = (0..300u32).map(|i| format!("{:0>200}", i).into_bytes()).collect();
    for key in &keys {
        tree.insert(key, &[b'x'; 200]).unwrap();
    }
    let stats = tree.verify().unwrap();
    assert!(stats.height >= 3, "height {}", stats.height);
    assert_eq!(stats.keys, 300);

    let mut height = stats.height;
    for step in 0..keys.len() {
        let key = &keys[(step * 113) % keys.len()];
        assert!(tree.delete(key).unwrap());
        let stats = tree.verify().unwrap();
        assert!(stats.height <= height);
        height = stats.height;
        assert_eq!(stats.keys, keys.len() - step - 1);
        assert_eq!(tree.store().len(), stats.pages());
    }
    assert_eq!(tree.root(), 0);
}

#[test]
fn longer_separator_after_delete_splits_the_parent() {
    let mut store = MemPager::new();
    let mut kids = vec![leaf(&mut store, &[(b"a".to_vec(), vec![1; 100]), (big_key(b'b'), vec![2; 100])])];
    for c in [b'c', b'd', b'e', b'f'] {
        kids.push(leaf(&mut store, &[(big_key(c), vec![c; 100])]));
    }
    let root = internal(&mut store, &kids);
    let mut tree = BTree::open(store, root);
    assert_eq!(tree.verify().unwrap().height, 2);

    // The first separator goes from "a" to a maximum-size key.
    assert!(tree.delete(b"a").unwrap());

    let stats = tree.verify().unwrap();
    assert_eq!(stats.height, 3);
    assert_eq!(stats.keys, 5);
    assert_eq!(tree.store().len(), stats.pages());
    for c in [b'b', b'c', b'd', b'e', b'f'] {
        assert!(tree.get(&big_key(c)).unwrap().is_some());
    }
}

#[test]
fn verify_reports_broken_trees() {
    let mut store = MemPager::new();
    let (left, _) = leaf(&mut store, &run("a", 3, 10));
    let right = leaf(&mut store, &run("b", 3, 10));
    let root = internal(&mut store, &[(left, b"a01".to_vec()), right]);
    let mut tree = BTree::open(store, root);
    assert!(matches!(tree.verify(), Err(TreeError::Corrupt(_))));

    let mut store = MemPager::new();
    let shallow = leaf(&mut store, &run("a", 3, 10));
    let (deep_leaf, key) = leaf(&mut store, &run("b", 3, 10));
    let deep = internal(&mut store, &[(deep_leaf, key.clone())]);
    let root = internal(&mut store, &[shallow, (deep, key)]);
    let mut tree = BTree::open(store, root);
    assert!(matches!(tree.verify(), Err(TreeError::Corrupt(_))));
}
