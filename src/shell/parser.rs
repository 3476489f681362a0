use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag_no_case, take_while1},
    character::complete::{char, multispace0, multispace1, one_of},
    combinator::{all_consuming, map, value},
    multi::fold_many0,
    sequence::{delimited, preceded},
};

use crate::shell::Command;

/// `"..."` with `\"` and `\\` escapes.
fn quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((
                map(is_not("\"\\"), |s: &str| s.to_string()),
                map(preceded(char('\\'), one_of("\"\\")), |c: char| c.to_string()),
            )),
            String::new,
            |mut acc, piece| {
                acc.push_str(&piece);
                acc
            },
        ),
        char('"'),
    )
    .parse(input)
}

fn bare(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| !c.is_whitespace() && c != '"'), |s: &str| {
        s.to_string()
    })
    .parse(input)
}

fn argument(input: &str) -> IResult<&str, Vec<u8>> {
    map(alt((quoted, bare)), String::into_bytes).parse(input)
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        map(
            preceded((tag_no_case("get"), multispace1), argument),
            Command::Get,
        ),
        map(
            (
                alt((tag_no_case("set"), tag_no_case("put"))),
                multispace1,
                argument,
                multispace1,
                argument,
            ),
            |(_, _, key, _, val)| Command::Set(key, val),
        ),
        map(
            preceded(
                (alt((tag_no_case("delete"), tag_no_case("del"))), multispace1),
                argument,
            ),
            Command::Del,
        ),
        value(Command::Stats, tag_no_case(".stats")),
        value(Command::Exit, alt((tag_no_case(".exit"), tag_no_case("exit")))),
    ))
    .parse(input)
}

/// Parse one shell line such as `set "two words" value`.
pub fn parse_command(input: &str) -> Result<Command, String> {
    all_consuming(delimited(multispace0, command, multispace0))
        .parse(input)
        .map(|(_, cmd)| cmd)
        .map_err(|e| format!("Unrecognized command '{}': {}", input.trim(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_quoted_arguments() {
        assert_eq!(parse_command("get apple").unwrap(), Command::Get(b"apple".to_vec()));
        assert_eq!(
            parse_command("  SET \"two words\" \"say \\\"hi\\\"\"  ").unwrap(),
            Command::Set(b"two words".to_vec(), b"say \"hi\"".to_vec())
        );
        assert_eq!(parse_command("put k \"\"").unwrap(), Command::Set(b"k".to_vec(), Vec::new()));
        assert_eq!(parse_command("delete k").unwrap(), Command::Del(b"k".to_vec()));
        assert_eq!(parse_command("del k").unwrap(), Command::Del(b"k".to_vec()));
        assert_eq!(parse_command(".stats").unwrap(), Command::Stats);
        assert_eq!(parse_command(".EXIT").unwrap(), Command::Exit);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_command("get").is_err());
        assert!(parse_command("set onlykey").is_err());
        assert!(parse_command("get a b").is_err());
        assert!(parse_command("set k \"unterminated").is_err());
        assert!(parse_command("drop table").is_err());
    }
}
