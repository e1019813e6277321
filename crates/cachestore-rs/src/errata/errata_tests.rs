use crate::errata::{Code, Errata, Severity};

#[test]
fn empty_chain_is_clean_success() {
    let zret = Errata::new();
    assert!(zret.is_ok());
    assert!(zret.is_empty());
    assert_eq!(zret.to_string(), "");
}

#[test]
fn push_prepends_most_recent_first() {
    let mut zret = Errata::new();
    zret.push(Severity::Error, Code::IoRead, "read failed");
    zret.push(Severity::Error, Code::HeaderANotFound, "header A not found");

    assert_eq!(zret.len(), 2);
    assert_eq!(zret.top().unwrap().code, Code::HeaderANotFound);
}

#[test]
fn info_and_warn_notes_do_not_fail_the_chain() {
    let mut zret = Errata::new();
    zret.info("writing not enabled, no updates performed");
    zret.warn(Code::ConfigParse, "size was rounded up");

    assert!(zret.is_ok());
    assert!(!zret.is_empty());
}

#[test]
fn any_error_note_fails_the_chain() {
    let mut zret = Errata::new();
    zret.info("still loading");
    zret.push(Severity::Error, Code::NoSpace, "no free block large enough");
    assert!(!zret.is_ok());
    assert!(zret.has_code(Code::NoSpace));
}

#[test]
fn absorb_keeps_the_newer_chain_in_front() {
    let mut outer = Errata::new();
    outer.push(Severity::Error, Code::Open, "open failed");

    let mut inner = Errata::new();
    inner.push(Severity::Error, Code::DeviceGeometry, "geometry query failed");

    outer.absorb(inner);
    assert_eq!(outer.len(), 2);
    assert_eq!(outer.top().unwrap().code, Code::DeviceGeometry);
}

#[test]
fn display_renders_one_note_per_line() {
    let mut zret = Errata::new();
    zret.push(Severity::Error, Code::IoWrite, "short write");
    zret.info("span /dev/sdb");

    let text = zret.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "info [0]: span /dev/sdb");
    assert_eq!(lines[1], "error [4]: short write");
}
