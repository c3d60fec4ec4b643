use opald::core::cluster::NodeTable;
use opald::core::errors::CmsError;
use opald::core::mask::{SMask, STMAX};
use opald::core::node::{CmsNode, StateFlags};
use opald::core::protocol::codes::LoginMod;
use opald::core::protocol::{Frame, ReqCode};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

fn make_node(id: usize, instance: u64, host: &str, port: u16) -> Arc<CmsNode> {
    Arc::new(CmsNode::new(
        id,
        instance,
        LoginMod::SERVER,
        host.to_string(),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        port,
        host.to_string(),
        0,
    ))
}

fn admit_host(table: &NodeTable, host: &str, port: u16) -> Arc<CmsNode> {
    let node = table
        .admit(|id, instance| make_node(id, instance, host, port))
        .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    node.bind(tx);
    node
}

#[test]
fn test_ids_are_dense_and_reusable() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    let b = admit_host(&table, "b", 1);
    assert_eq!(a.id, 0);
    assert_eq!(b.id, 1);

    table.remove(a.id, a.instance).unwrap();
    let c = admit_host(&table, "c", 1);
    // The freed slot is reassigned with a fresh instance.
    assert_eq!(c.id, 0);
    assert_ne!(c.instance, a.instance);
}

#[test]
fn test_table_overflow_rejects_login() {
    let table = NodeTable::new();
    for i in 0..STMAX {
        admit_host(&table, &format!("h{i}"), 1);
    }
    let err = table
        .admit(|id, instance| make_node(id, instance, "extra", 1))
        .unwrap_err();
    assert!(matches!(err, CmsError::Overflow));
}

#[test]
fn test_instance_guard_rejects_stale_references() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    let (id, inst) = (a.id, a.instance);
    assert!(table.get(id, inst).is_some());

    table.remove(id, inst);
    let b = admit_host(&table, "b", 1);
    assert_eq!(b.id, id);
    // The old (id, instance) pair must not resolve to the new occupant.
    assert!(table.get(id, inst).is_none());
    assert!(table.get(id, b.instance).is_some());
}

#[test]
fn test_remove_with_stale_instance_is_a_noop() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    assert!(table.remove(a.id, a.instance + 1).is_none());
    assert_eq!(table.count(), 1);
}

#[test]
fn test_mask_of_host_collects_all_ports() {
    let table = NodeTable::new();
    let a = admit_host(&table, "alpha", 1094);
    let b = admit_host(&table, "alpha", 1095);
    let _c = admit_host(&table, "beta", 1094);
    assert_eq!(table.mask_of_host("alpha"), a.mask | b.mask);
    assert_eq!(table.mask_of_host("nosuch"), SMask::EMPTY);
}

#[test]
fn test_broadcast_reports_dead_links() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    let b = table
        .admit(|id, instance| make_node(id, instance, "b", 1))
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    b.bind(tx);
    drop(rx); // b's writer is gone

    let dead = table.broadcast(a.mask | b.mask, &Frame::bare(ReqCode::Ping, 0, 0));
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, b.id);
}

#[test]
fn test_space_aggregates_sum_and_average() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    let b = admit_host(&table, "b", 1);
    // 10 GB at 30% and 5 GB at 70%.
    a.with_state(|st| {
        st.disk_free = 10240;
        st.disk_util = 30;
        st.flags |= StateFlags::RW;
    });
    b.with_state(|st| {
        st.disk_free = 5120;
        st.disk_util = 70;
        st.flags |= StateFlags::RW | StateFlags::NOSTAGE;
    });
    a.with_state(|st| st.flags |= StateFlags::NOSTAGE);

    let rovec = a.mask | b.mask;
    let space = table.space(rovec, rovec, SMask::EMPTY);
    assert_eq!(space.to_line(), "2 15728640 50 0 0 0");
}

#[test]
fn test_format_locate_flags() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1094);
    let b = admit_host(&table, "b", 1095);

    // a holds the file online and writable, b only pending read access.
    let listing = table.format_locate(a.mask | b.mask, b.mask, a.mask);
    let entries: Vec<&str> = listing.split(' ').collect();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].starts_with("Sw[::10.0.0.1]:1094"));
    assert!(entries[1].starts_with("sr[::10.0.0.1]:1095"));
}

#[test]
fn test_census_counts_active_and_staging() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    let b = admit_host(&table, "b", 1);
    b.with_state(|st| st.flags |= StateFlags::NOSTAGE);
    let c = admit_host(&table, "c", 1);
    c.with_state(|st| st.flags |= StateFlags::SUSPEND);

    let (active, staging) = table.census();
    assert_eq!(active, 2);
    assert_eq!(staging, 1);
    let _ = a;
}

#[test]
fn test_stats_lists_every_subscriber() {
    let table = NodeTable::new();
    let a = admit_host(&table, "alpha", 1094);
    a.add_ref(false);
    let text = table.stats();
    assert!(text.contains("server alpha:1094"));
    assert!(text.contains("refA=1"));
}

#[test]
fn test_reset_refs_clears_window() {
    let table = NodeTable::new();
    let a = admit_host(&table, "a", 1);
    a.add_ref(false);
    a.add_ref(true);
    table.reset_refs(SMask::FULL);
    assert_eq!(a.ref_a(), 0);
    assert_eq!(a.ref_r(), 0);
    // Running totals survive the window reset.
    assert_eq!(a.ref_totals(), (1, 1));
}
