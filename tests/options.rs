//! Direct parsing tests for socket and process specs.

use std::collections::BTreeMap;

use crate::{
    process::{ProcessSpec, StderrMode},
    socket::{Family, SocketSpec, SocketType},
};

fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
}

fn socket_spec(pairs: &[(&str, &str)]) -> SocketSpec {
    SocketSpec::from_options("sock".into(), &opts(pairs)).unwrap()
}

#[test]
fn a_path_implies_the_unix_family() {
    let spec = socket_spec(&[("path", "/tmp/x.sock")]);
    assert_eq!(spec.family, Family::Unix);
    assert_eq!(spec.socket_type, SocketType::Stream);
    assert_eq!(spec.backlog, 5);
}

#[test]
fn inet_defaults_to_loopback_unless_an_interface_is_given() {
    let spec = socket_spec(&[]);
    assert_eq!(spec.family, Family::Inet);
    assert_eq!(spec.host.unwrap().to_string(), "127.0.0.1");

    let spec = socket_spec(&[("interface", "eth0")]);
    assert_eq!(spec.host.unwrap().to_string(), "0.0.0.0");

    let spec = socket_spec(&[("family", "inet6")]);
    assert_eq!(spec.host.unwrap().to_string(), "::1");

    let spec = socket_spec(&[("family", "inet6"), ("interface", "eth0")]);
    assert_eq!(spec.host.unwrap().to_string(), "::");
}

#[test]
fn host_must_match_the_family() {
    let err = SocketSpec::from_options(
        "sock".into(),
        &opts(&[("family", "inet6"), ("host", "127.0.0.1")]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("does not match"), "got {err}");
}

#[test]
fn spec_matching_ignores_reuseport_and_a_zero_port() {
    let mut bound = socket_spec(&[("port", "8080")]);
    let requested = socket_spec(&[("reuseport", "1")]);
    assert!(requested.matches(&bound), "port 0 must match any bound port");
    assert!(bound.matches(&requested));

    let other = socket_spec(&[("port", "8081")]);
    assert!(!other.matches(&bound), "different concrete ports must not match");

    bound.socket_type = SocketType::Dgram;
    assert!(!requested.matches(&bound), "type is part of the identity");
}

#[test]
fn umask_is_octal() {
    let spec = socket_spec(&[("path", "/tmp/x.sock"), ("umask", "027")]);
    assert_eq!(spec.umask, Some(0o27));
    let err = SocketSpec::from_options(
        "sock".into(),
        &opts(&[("path", "/tmp/x.sock"), ("umask", "99")]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("not a valid umask"), "got {err}");
}

fn process_spec(pairs: &[(&str, &str)], args: &[&str]) -> ProcessSpec {
    ProcessSpec::from_options(
        "proc".into(),
        opts(pairs),
        args.iter().map(|a| (*a).to_owned()).collect(),
    )
    .unwrap()
}

#[test]
fn env_and_rlimit_prefixes_sort_themselves_out() {
    let spec = process_spec(
        &[("env.FOO", "bar"), ("rlimit.nofile", "64"), ("working_dir", "/tmp")],
        &["/bin/true"],
    );
    assert_eq!(spec.env.get("FOO").map(String::as_str), Some("bar"));
    assert_eq!(spec.rlimits.get("nofile").copied(), Some(64));
    assert_eq!(spec.working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
}

#[test]
fn capture_defaults_and_bufsize_zero() {
    let spec = process_spec(&[], &["/bin/true"]);
    assert!(spec.stdout_capture);
    assert_eq!(spec.stderr, StderrMode::Capture);
    assert_eq!(spec.bufsize, 1024 * 1024);

    let spec = process_spec(&[("stderr", "stdout"), ("bufsize", "2k")], &["/bin/true"]);
    assert_eq!(spec.stderr, StderrMode::Stdout);
    assert_eq!(spec.bufsize, 2048);

    let spec = process_spec(&[("bufsize", "0")], &["/bin/true"]);
    assert!(!spec.stdout_capture, "bufsize 0 disables stdout capture");
    assert_eq!(spec.stderr, StderrMode::Discard, "bufsize 0 disables stderr capture");
}

#[test]
fn a_uid_brings_its_primary_group_along() {
    // Root exists everywhere the daemon runs.
    let spec = process_spec(&[("uid", "0")], &["/bin/true"]);
    assert_eq!(spec.uid, Some(0));
    assert!(spec.gid.is_some(), "the user's primary group must fill in");
    assert!(spec.username.is_some(), "the name is kept for initgroups");
}

#[test]
fn specs_compare_by_content() {
    let a = process_spec(&[("env.A", "1")], &["/bin/true"]);
    let b = process_spec(&[("env.A", "1")], &["/bin/true"]);
    let c = process_spec(&[("env.A", "2")], &["/bin/true"]);
    assert_eq!(a, b);
    assert_ne!(a, c);
}
