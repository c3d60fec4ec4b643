use opald::core::cache::paths::PathIndex;
use opald::core::mask::SMask;

#[test]
fn test_longest_prefix_lookup() {
    let idx = PathIndex::new();
    idx.add("/data", 1, false, false);
    idx.add("/data/hot", 2, true, false);

    assert_eq!(idx.find("/data/hot/f1").unwrap().rovec, SMask::node(2));
    assert_eq!(idx.find("/data/cold/f1").unwrap().rovec, SMask::node(1));
    assert!(idx.find("/other/f1").is_none());
}

#[test]
fn test_prefix_respects_component_boundaries() {
    let idx = PathIndex::new();
    idx.add("/a", 1, false, false);
    assert!(idx.find("/ab").is_none());
    assert!(idx.find("/a").is_some());
    assert!(idx.find("/a/x").is_some());
}

#[test]
fn test_rwvec_always_subset_of_rovec() {
    let idx = PathIndex::new();
    idx.add("/a", 1, true, false);
    idx.add("/a", 2, false, true);
    idx.add("/a", 3, false, false);

    let info = idx.find("/a/x").unwrap();
    assert_eq!(info.rwvec & info.rovec, info.rwvec);
    assert_eq!(info.ssvec & info.rovec, info.ssvec);
    assert_eq!(info.rovec.count(), 3);
    assert_eq!(info.rwvec, SMask::node(1));
    assert_eq!(info.ssvec, SMask::node(2));
}

#[test]
fn test_multiple_exporters_accumulate() {
    let idx = PathIndex::new();
    idx.add("/a", 3, false, false);
    idx.add("/a", 4, false, false);
    let info = idx.find("/a/file").unwrap();
    assert_eq!(info.rovec, SMask::node(3) | SMask::node(4));
}

#[test]
fn test_remove_mask_clears_every_entry() {
    let idx = PathIndex::new();
    idx.add("/a", 1, true, true);
    idx.add("/b", 1, false, false);
    idx.add("/b", 2, false, false);

    idx.remove_mask(SMask::node(1));

    // /a had only subscriber 1; the entry is gone entirely.
    assert!(idx.find("/a/x").is_none());
    let info = idx.find("/b/x").unwrap();
    assert!(!info.rovec.contains(1));
    assert!(info.rovec.contains(2));
}

#[test]
fn test_all_servers_union() {
    let idx = PathIndex::new();
    idx.add("/a", 1, false, false);
    idx.add("/b", 5, false, false);
    assert_eq!(idx.all_servers(), SMask::node(1) | SMask::node(5));
}
