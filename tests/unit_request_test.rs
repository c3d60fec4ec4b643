use opald::core::protocol::request::{
    avail_frame, load_frame, mode_frame, mv_frame, path_frame, prep_add_frame, select_frame,
    try_frame, RRData,
};
use opald::core::protocol::ReqCode;

#[test]
fn test_decode_chmod_mode_and_path() {
    let frame = mode_frame(ReqCode::Chmod, 5, "644", "/a/x");
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.mode, "644");
    assert_eq!(arg.path, "/a/x");
    assert_eq!(arg.streamid, 5);
}

#[test]
fn test_decode_mv_paths() {
    let frame = mv_frame(2, "/a/old", "/a/new");
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.path, "/a/old");
    assert_eq!(arg.path2, "/a/new");
}

#[test]
fn test_decode_select_with_avoid_host() {
    let frame = select_frame(3, 0, "/a/x", "cgi=1", Some("badhost"));
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.path, "/a/x");
    assert_eq!(arg.opaque, "cgi=1");
    assert_eq!(arg.avoid.as_deref(), Some("badhost"));
}

#[test]
fn test_decode_select_without_avoid() {
    let frame = select_frame(3, 0, "/a/x", "", None);
    let arg = RRData::decode(&frame).unwrap();
    assert!(arg.avoid.is_none());
}

#[test]
fn test_decode_prep_add_fields() {
    let frame = prep_add_frame(1, 0, "req-9", "udp://n:123", "2", "644", "/a/x");
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.reqid, "req-9");
    assert_eq!(arg.notify, "udp://n:123");
    assert_eq!(arg.prty, "2");
    assert_eq!(arg.mode, "644");
    assert_eq!(arg.path, "/a/x");
}

#[test]
fn test_decode_try_host_list() {
    let frame = try_frame(0, &["m1:3121".to_string(), "m2:3121".to_string()]);
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.hosts, vec!["m1:3121", "m2:3121"]);
}

#[test]
fn test_decode_load_sample_and_free_space() {
    let frame = load_frame(0, [10, 20, 30, 40, 50, 60], 4096);
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.loads, [10, 20, 30, 40, 50, 60]);
    assert_eq!(arg.dsk_free, 4096);
}

#[test]
fn test_decode_avail_figures() {
    let frame = avail_frame(0, 2048, 37);
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.dsk_free, 2048);
    assert_eq!(arg.dsk_util, 37);
}

#[test]
fn test_decode_have_path() {
    let frame = path_frame(ReqCode::Have, 7, 1, "/a/deep/file");
    let arg = RRData::decode(&frame).unwrap();
    assert_eq!(arg.path, "/a/deep/file");
    assert_eq!(arg.modifier, 1);
}

#[test]
fn test_truncated_payload_rejected() {
    let mut frame = mode_frame(ReqCode::Chmod, 5, "644", "/a/x");
    frame.data = frame.data.slice(0..3);
    assert!(RRData::decode(&frame).is_err());
}
