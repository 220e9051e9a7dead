//! Line-protocol codec: request tokenization and `key=value` option
//! parsing.
//!
//! Requests are single lines of space-separated tokens. A token ending in
//! a backslash is glued to the following token with one space, which is
//! how clients smuggle spaces into a single argument.

use std::collections::BTreeMap;

/// Written after every reply.
pub const PROMPT: &str = "> ";
/// The first thing a client sees.
pub const GREETING: &str = "Papa is home. Type \"help\" for commands.\n> ";

/// Splits a request line into arguments, honoring the backslash-space
/// escape. Runs of spaces are collapsed; `foo\ bar` comes out as the one
/// argument `foo bar`.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut acc = String::new();
    for word in line.split(' ') {
        if word.is_empty() {
            continue;
        }
        if let Some(stem) = word.strip_suffix('\\') {
            acc.push_str(stem);
            acc.push(' ');
        } else {
            acc.push_str(word);
            args.push(acc.trim().to_owned());
            acc.clear();
        }
    }
    if !acc.is_empty() {
        // A trailing escape keeps its space.
        args.push(acc);
    }
    args
}

/// Peels `key=value` options off the front of the argument list, up to
/// the first token without a `=`. A `"…"`-quoted value is unquoted, which
/// lets a value end in a backslash without triggering the join escape.
pub fn take_options(args: &mut Vec<String>) -> BTreeMap<String, String> {
    let mut opts = BTreeMap::new();
    while args.first().is_some_and(|arg| arg.contains('=')) {
        let arg = args.remove(0);
        let Some((name, value)) = arg.split_once('=') else {
            continue;
        };
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            &value[1..value.len() - 1]
        } else {
            value
        };
        opts.insert(name.to_owned(), value.to_owned());
    }
    opts
}
