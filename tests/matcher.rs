use std::collections::BTreeMap;

use crate::matcher::select;

fn sample() -> BTreeMap<String, u32> {
    [("inet.0", 0), ("inet.1", 1), ("other", 2)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

fn names<'a>(selection: Vec<(&'a str, &u32)>) -> Vec<&'a str> {
    selection.into_iter().map(|(name, _)| name).collect()
}

fn pats(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| (*p).to_owned()).collect()
}

#[test]
fn no_patterns_selects_everything() {
    let map = sample();
    assert_eq!(names(select(&map, &[], false).unwrap()), vec!["inet.0", "inet.1", "other"]);
    assert_eq!(names(select(&map, &pats(&["*"]), false).unwrap()), vec!["inet.0", "inet.1", "other"]);
}

#[test]
fn trailing_star_selects_by_prefix() {
    let map = sample();
    assert_eq!(names(select(&map, &pats(&["inet.*"]), false).unwrap()), vec!["inet.0", "inet.1"]);
    assert_eq!(names(select(&map, &pats(&["inet*"]), false).unwrap()), vec!["inet.0", "inet.1"]);
    assert!(select(&map, &pats(&["nope.*"]), true).unwrap().is_empty());
}

#[test]
fn literals_and_wildcards_mix() {
    let map = sample();
    assert_eq!(
        names(select(&map, &pats(&["other", "inet.1"]), false).unwrap()),
        vec!["inet.1", "other"]
    );
    assert_eq!(
        names(select(&map, &pats(&["other", "inet*"]), false).unwrap()),
        vec!["inet.0", "inet.1", "other"]
    );
}

#[test]
fn missing_literal_is_an_error_only_when_required() {
    let map = sample();
    assert!(select(&map, &pats(&["missing"]), false).unwrap().is_empty());
    let err = select(&map, &pats(&["missing"]), true).unwrap_err();
    assert_eq!(err.to_string(), "missing not found");
}
