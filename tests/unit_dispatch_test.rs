use opald::config::{Config, ExportConfig, N2nConfig, Role};
use opald::core::mask::STMAX;
use opald::core::node::dispatch::Dispatcher;
use opald::core::node::{CmsNode, StateFlags};
use opald::core::protocol::codes::{HaveMod, LoginMod, SelectMod, StatusMod};
use opald::core::protocol::request::{mode_frame, path_frame, select_frame};
use opald::core::protocol::{Frame, ReqCode};
use opald::core::state::FederationState;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

fn manager_fed() -> Arc<FederationState> {
    let config = Config {
        role: Role::Manager,
        ..Config::default()
    };
    FederationState::new(config).0
}

fn admit(
    fed: &FederationState,
    host: &str,
    port: u16,
    exports: &[(&str, bool, bool)],
    free_mb: u64,
) -> (Arc<CmsNode>, mpsc::UnboundedReceiver<Frame>) {
    let node = fed
        .table
        .admit(|id, instance| {
            Arc::new(CmsNode::new(
                id,
                instance,
                LoginMod::SERVER,
                host.to_string(),
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port,
                host.to_string(),
                0,
            ))
        })
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    node.bind(tx);
    let mut rw = false;
    for (path, write, stage) in exports {
        fed.paths.add(path, node.id, *write, *stage);
        rw |= *write;
    }
    node.with_state(|st| {
        st.disk_free = free_mb;
        st.disk_util = 20;
        if rw {
            st.flags |= StateFlags::RW;
        }
    });
    (node, rx)
}

fn upstream(fed: &FederationState) -> mpsc::UnboundedReceiver<Frame> {
    let node = Arc::new(CmsNode::new(
        STMAX,
        fed.managers.next_instance(),
        LoginMod::MANAGER,
        "upmgr".to_string(),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
        3121,
        "upmgr".to_string(),
        0,
    ));
    let (tx, rx) = mpsc::unbounded_channel();
    node.bind(tx);
    fed.managers.add(node).unwrap();
    rx
}

#[tokio::test]
async fn test_have_updates_cache_and_back_propagates_once() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", false, false)], 8192);
    let mut up = upstream(&fed);
    let dispatcher = Dispatcher::new(fed.clone());

    let have = path_frame(ReqCode::Have, 1, HaveMod::ONLINE.bits(), "/a/x");
    dispatcher.route(&a, have.clone()).await.unwrap();

    let loc = fed.cache.peek("/a/x").unwrap();
    assert_eq!(loc.hf, a.mask);
    assert_eq!(up.try_recv().unwrap().code, ReqCode::Have);

    // The identical advisory changes nothing and is not re-propagated.
    dispatcher.route(&a, have).await.unwrap();
    assert!(up.try_recv().is_err());
}

#[tokio::test]
async fn test_gone_clears_cache_and_back_propagates() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", false, false)], 8192);
    let mut up = upstream(&fed);
    let dispatcher = Dispatcher::new(fed.clone());

    fed.cache.add_file("/a/x", a.mask, false);
    dispatcher
        .route(&a, path_frame(ReqCode::Gone, 1, 0, "/a/x"))
        .await
        .unwrap();

    let loc = fed.cache.peek("/a/x").unwrap();
    assert!(loc.hf.is_empty());
    assert_eq!(up.try_recv().unwrap().code, ReqCode::Gone);
}

#[tokio::test]
async fn test_select_request_round_trip() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", false, false)], 8192);
    let (client, mut rx_client) = admit(&fed, "client", 0, &[], 0);
    fed.cache.add_file("/a/x", a.mask, false);
    let dispatcher = Dispatcher::new(fed.clone());

    let frame = select_frame(21, SelectMod::empty().bits(), "/a/x", "", None);
    dispatcher.route(&client, frame).await.unwrap();

    let reply = rx_client.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Redirect);
    assert_eq!(reply.streamid, 21);
    assert_eq!(&reply.data[4..], b"alpha");
}

#[tokio::test]
async fn test_select_avoid_host_excludes_it() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1, &[("/a", false, false)], 8192);
    let (b, _rb) = admit(&fed, "beta", 2, &[("/a", false, false)], 8192);
    let (client, mut rx_client) = admit(&fed, "client", 0, &[], 0);
    fed.cache.add_file("/a/x", a.mask | b.mask, false);
    let dispatcher = Dispatcher::new(fed.clone());

    let frame = select_frame(3, 0, "/a/x", "", Some("alpha"));
    dispatcher.route(&client, frame).await.unwrap();

    let reply = rx_client.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Redirect);
    assert_eq!(&reply.data[4..], b"beta");
}

#[tokio::test]
async fn test_locate_lists_candidates() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", true, false)], 8192);
    let (client, mut rx_client) = admit(&fed, "client", 0, &[], 0);
    fed.cache.add_file("/a/x", a.mask, false);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&client, path_frame(ReqCode::Locate, 9, 0, "/a/x"))
        .await
        .unwrap();

    let reply = rx_client.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Data);
    let text = std::str::from_utf8(&reply.data[4..reply.data.len() - 1]).unwrap();
    assert_eq!(text, "Sw[::127.0.0.1]:1094");
}

#[tokio::test]
async fn test_statfs_aggregates_and_reports_unknown() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1, &[("/a", true, false)], 10240);
    let (b, _rb) = admit(&fed, "beta", 2, &[("/a", true, false)], 5120);
    a.with_state(|st| st.disk_util = 30);
    b.with_state(|st| st.disk_util = 70);
    let (client, mut rx_client) = admit(&fed, "client", 0, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&client, path_frame(ReqCode::StatFs, 2, 0, "/a/x"))
        .await
        .unwrap();
    let reply = rx_client.try_recv().unwrap();
    let text = std::str::from_utf8(&reply.data[4..reply.data.len() - 1]).unwrap();
    assert_eq!(text, "2 15728640 50 0 0 0");

    dispatcher
        .route(&client, path_frame(ReqCode::StatFs, 3, 0, "/unknown/x"))
        .await
        .unwrap();
    let reply = rx_client.try_recv().unwrap();
    let text = std::str::from_utf8(&reply.data[4..reply.data.len() - 1]).unwrap();
    assert_eq!(text, "-1 -1 -1 -1 -1 -1");
}

#[tokio::test]
async fn test_manager_forwards_mutations_to_exporters() {
    let fed = manager_fed();
    let (_a, mut rx_a) = admit(&fed, "alpha", 1, &[("/a", true, false)], 8192);
    let (client, _rc) = admit(&fed, "client", 0, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    let chmod = mode_frame(ReqCode::Chmod, 4, "644", "/a/x");
    dispatcher.route(&client, chmod.clone()).await.unwrap();

    let forwarded = rx_a.try_recv().unwrap();
    assert_eq!(forwarded.code, ReqCode::Chmod);
    assert_eq!(forwarded.data, chmod.data);
}

#[tokio::test]
async fn test_server_executes_mutation_locally() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        role: Role::Server,
        exports: vec![ExportConfig {
            path: "/a".to_string(),
            write: true,
            stage: false,
        }],
        ..Config::default()
    };
    let mut config = config;
    config.fs.n2n = Some(N2nConfig {
        lfn_prefix: "/a".to_string(),
        pfn_prefix: dir.path().to_str().unwrap().to_string(),
    });
    let fed = FederationState::new(config).0;
    let (peer, _rx) = admit(&fed, "mgr-side", 0, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&peer, mode_frame(ReqCode::Mkdir, 1, "755", "/a/newdir"))
        .await
        .unwrap();
    assert!(dir.path().join("newdir").is_dir());
}

#[tokio::test]
async fn test_invalid_mode_returns_wire_error() {
    let fed = manager_fed();
    let (client, mut rx_client) = admit(&fed, "client", 0, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&client, mode_frame(ReqCode::Chmod, 6, "999", "/a/x"))
        .await
        .unwrap();
    let reply = rx_client.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Error);
    assert_eq!(reply.streamid, 6);
}

#[tokio::test]
async fn test_state_query_answers_from_cache_without_rebroadcast() {
    let fed = manager_fed();
    let (a, mut rx_a) = admit(&fed, "alpha", 1094, &[("/a", false, false)], 8192);
    let (asker, mut rx_asker) = admit(&fed, "asker", 0, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    fed.cache.add_file("/a/x", a.mask, false);
    dispatcher
        .route(&asker, path_frame(ReqCode::State, 5, 0, "/a/x"))
        .await
        .unwrap();

    let reply = rx_asker.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Have);
    assert!(HaveMod::from_bits_truncate(reply.modifier).contains(HaveMod::ONLINE));
    // The holder is known; nothing needed rebroadcasting.
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_status_suspend_and_resume_edges() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", false, false)], 8192);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&a, Frame::bare(ReqCode::Status, 1, StatusMod::SUSPEND.bits()))
        .await
        .unwrap();
    assert!(a.flags().contains(StateFlags::SUSPEND));

    dispatcher
        .route(&a, Frame::bare(ReqCode::Status, 2, StatusMod::RESUME.bits()))
        .await
        .unwrap();
    assert!(!a.flags().contains(StateFlags::SUSPEND));
}

#[tokio::test]
async fn test_ping_answers_pong() {
    let fed = manager_fed();
    let (a, mut rx_a) = admit(&fed, "alpha", 1094, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&a, Frame::bare(ReqCode::Ping, 17, 0))
        .await
        .unwrap();
    let reply = rx_a.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Pong);
    assert_eq!(reply.streamid, 17);
}

#[tokio::test]
async fn test_update_reports_service_state() {
    let fed = manager_fed();
    let (a, mut rx_a) = admit(&fed, "alpha", 1094, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&a, Frame::bare(ReqCode::Update, 8, 0))
        .await
        .unwrap();
    let reply = rx_a.try_recv().unwrap();
    assert_eq!(reply.code, ReqCode::Status);
    let mods = StatusMod::from_bits_truncate(reply.modifier);
    assert!(mods.contains(StatusMod::RESUME));
    assert!(mods.contains(StatusMod::STAGE));
}

#[tokio::test]
async fn test_avail_records_peer_space() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[], 0);
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(
            &a,
            opald::core::protocol::request::avail_frame(1, 4096, 42),
        )
        .await
        .unwrap();
    let (_, _, free, util) = a.scores();
    assert_eq!(free, 4096);
    assert_eq!(util, 42);
}

#[tokio::test]
async fn test_load_updates_scores_and_space_watermark() {
    let fed = manager_fed();
    let (a, _ra) = admit(&fed, "alpha", 1094, &[("/a", true, false)], 0);
    let mut up = upstream(&fed);
    let dispatcher = Dispatcher::new(fed.clone());

    let load = opald::core::protocol::request::load_frame(1, [50, 0, 0, 20, 0, 10], 4096);
    dispatcher.route(&a, load).await.unwrap();

    let (load_score, mass, free, _) = a.scores();
    // Default weights: cpu 50% of 50 plus mem 10% of 20 = 27.
    assert_eq!(load_score, 27);
    assert_eq!(mass, 28);
    assert_eq!(free, 4096);

    // First rw free-space report crossing the threshold announces
    // space upstream exactly once.
    assert_eq!(fed.meter.last_free(), 4096);
    assert_eq!(up.try_recv().unwrap().code, ReqCode::Avail);
    dispatcher
        .route(
            &a,
            opald::core::protocol::request::load_frame(2, [50, 0, 0, 20, 0, 10], 4096),
        )
        .await
        .unwrap();
    assert!(up.try_recv().is_err());
}
