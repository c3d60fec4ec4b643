use opald::config::CacheConfig;
use opald::core::cache::LocationCache;
use opald::core::mask::SMask;

fn cache() -> LocationCache {
    LocationCache::new(&CacheConfig::default())
}

#[test]
fn test_add_file_reports_change_once() {
    let c = cache();
    let m = SMask::node(3);
    assert!(c.add_file("/a/x", m, false));
    // Idempotent: the second identical advisory changes nothing.
    assert!(!c.add_file("/a/x", m, false));
}

#[test]
fn test_del_file_reports_empty_once() {
    let c = cache();
    let m = SMask::node(3);
    c.add_file("/a/x", m, false);
    assert!(c.del_file("/a/x", m));
    assert!(!c.del_file("/a/x", m));
}

#[test]
fn test_have_and_pending_are_exclusive() {
    let c = cache();
    let m = SMask::node(7);
    c.add_file("/a/x", m, true);
    let loc = c.peek("/a/x").unwrap();
    assert_eq!(loc.pf, m);
    assert!((loc.hf & loc.pf).is_empty());

    // The stage completed: pending flips to have.
    c.add_file("/a/x", m, false);
    let loc = c.peek("/a/x").unwrap();
    assert_eq!(loc.hf, m);
    assert!((loc.hf & loc.pf).is_empty());
}

#[test]
fn test_get_file_miss_initializes_broadcast_mask() {
    let c = cache();
    let candidates = SMask::node(1) | SMask::node(2);
    let loc = c.get_file("/a/y", candidates);
    assert!(!loc.hit);
    assert_eq!(loc.bf, candidates);

    // The entry now exists; a repeat lookup is a hit with bf intact.
    let loc = c.get_file("/a/y", candidates);
    assert!(loc.hit);
    assert_eq!(loc.bf, candidates);
}

#[test]
fn test_mark_broadcast_clears_pending_queries() {
    let c = cache();
    let candidates = SMask::node(1) | SMask::node(2);
    c.get_file("/a/y", candidates);
    c.mark_broadcast("/a/y", candidates);
    let loc = c.get_file("/a/y", candidates);
    assert!(loc.hit);
    assert!(loc.bf.is_empty());
}

#[test]
fn test_lookup_restricted_to_candidates() {
    let c = cache();
    c.add_file("/a/x", SMask::node(1) | SMask::node(9), false);
    let loc = c.get_file("/a/x", SMask::node(9));
    assert_eq!(loc.hf, SMask::node(9));
}

#[test]
fn test_bounce_clears_bits_and_drops_empty_entries() {
    let c = cache();
    c.add_file("/a/x", SMask::node(1), false);
    c.add_file("/a/y", SMask::node(1) | SMask::node(2), false);

    c.bounce(SMask::node(1));

    // /a/x only knew subscriber 1; the whole entry is invalidated.
    assert!(c.peek("/a/x").is_none());
    let loc = c.peek("/a/y").unwrap();
    assert_eq!(loc.hf, SMask::node(2));
}

#[test]
fn test_del_file_unknown_path_is_a_noop() {
    let c = cache();
    assert!(!c.del_file("/nope", SMask::node(1)));
    assert!(c.is_empty());
}
