use async_trait::async_trait;
use opald::config::{Config, Role};
use opald::core::node::dispatch::Dispatcher;
use opald::core::node::CmsNode;
use opald::core::policy::{PolicyCaps, PolicyHook, PolicyRequest, PolicyVerdict};
use opald::core::protocol::codes::LoginMod;
use opald::core::protocol::request::mode_frame;
use opald::core::protocol::{Frame, ReqCode};
use opald::core::state::FederationState;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Claims every chmod it sees and counts the offers.
struct ChmodOwner {
    offered: AtomicUsize,
}

#[async_trait]
impl PolicyHook for ChmodOwner {
    fn caps(&self) -> PolicyCaps {
        PolicyCaps::CHMOD
    }

    async fn claim(&self, req: PolicyRequest<'_>) -> PolicyVerdict {
        assert_eq!(req.cap, PolicyCaps::CHMOD);
        self.offered.fetch_add(1, Ordering::Relaxed);
        PolicyVerdict::Claimed
    }
}

fn fed_with_hook(hook: Arc<dyn PolicyHook>) -> Arc<FederationState> {
    let config = Config {
        role: Role::Manager,
        ..Config::default()
    };
    FederationState::with_policy(config, Some(hook)).0
}

fn admit(fed: &FederationState, host: &str) -> (Arc<CmsNode>, mpsc::UnboundedReceiver<Frame>) {
    let node = fed
        .table
        .admit(|id, instance| {
            Arc::new(CmsNode::new(
                id,
                instance,
                LoginMod::SERVER,
                host.to_string(),
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                1094,
                host.to_string(),
                0,
            ))
        })
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    node.bind(tx);
    (node, rx)
}

#[tokio::test]
async fn test_claimed_request_skips_builtin_handling() {
    let hook = Arc::new(ChmodOwner {
        offered: AtomicUsize::new(0),
    });
    let fed = fed_with_hook(hook.clone());
    let (exporter, mut rx_exporter) = admit(&fed, "alpha");
    fed.paths.add("/a", exporter.id, true, false);
    let (client, mut rx_client) = admit(&fed, "client");
    let dispatcher = Dispatcher::new(fed.clone());

    dispatcher
        .route(&client, mode_frame(ReqCode::Chmod, 1, "644", "/a/x"))
        .await
        .unwrap();

    assert_eq!(hook.offered.load(Ordering::Relaxed), 1);
    // Claimed: no fan-out to exporters, no reply from the built-in path.
    assert!(rx_exporter.try_recv().is_err());
    assert!(rx_client.try_recv().is_err());
}

#[tokio::test]
async fn test_uncovered_caps_fall_through() {
    let hook = Arc::new(ChmodOwner {
        offered: AtomicUsize::new(0),
    });
    let fed = fed_with_hook(hook.clone());
    let (exporter, mut rx_exporter) = admit(&fed, "alpha");
    fed.paths.add("/a", exporter.id, true, false);
    let (client, _rc) = admit(&fed, "client");
    let dispatcher = Dispatcher::new(fed.clone());

    // Mkdir is not in the hook's capability set; the built-in fan-out runs.
    dispatcher
        .route(&client, mode_frame(ReqCode::Mkdir, 2, "755", "/a/sub"))
        .await
        .unwrap();

    assert_eq!(hook.offered.load(Ordering::Relaxed), 0);
    assert_eq!(rx_exporter.try_recv().unwrap().code, ReqCode::Mkdir);
}
