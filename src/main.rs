// src/main.rs

use std::env;
use std::io::{self, Write};
use log::{info, warn};

use aerokv::shell::{parse_command, Reply, Shell};

const DATABASE_FILE: &str = "data.aerokv";

/// First argument, then `AEROKV_FILE`, then the default file name.
fn database_path() -> String {
    env::args()
        .nth(1)
        .or_else(|| env::var("AEROKV_FILE").ok())
        .unwrap_or_else(|| DATABASE_FILE.to_string())
}

fn main() -> io::Result<()> {
    env_logger::init();
    let path = database_path();
    info!("AeroKV on '{}'. Commands: get, set, del, .stats, .exit", path);

    let mut shell = Shell::open(&path).map_err(io::Error::other)?;

    loop {
        print!("aerokv> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break; // EOF
        }
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_command(trimmed) {
            Ok(cmd) => match shell.execute(cmd) {
                Ok(Reply::Exit) => break,
                Ok(reply) => println!("{}", reply),
                Err(e) => warn!("{}", e),
            },
            Err(e) => warn!("{}", e),
        }
    }

    shell.sync().map_err(io::Error::other)
}
