//! Test harness: an in-process kernel on an ephemeral port plus a
//! minimal protocol client to talk to it.
#![allow(dead_code, unused_macros)]

#[macro_use]
mod eyre;
mod client;

pub use {client::*, eyre::*};

use std::collections::BTreeMap;

/// Protocol escape: spaces inside one argument become backslash-space.
pub fn esc(s: &str) -> String {
    s.replace(' ', "\\ ")
}

/// Splits an entry line (`name key=value key=value …`) into its name and
/// options. Not for process lines, whose `args=` value contains spaces.
pub fn parse_entry(line: &str) -> (String, BTreeMap<String, String>) {
    let mut parts = line.split(' ');
    let name = parts.next().unwrap_or_default().to_owned();
    let opts = parts
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    (name, opts)
}
