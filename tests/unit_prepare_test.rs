use opald::core::prepare::{PrepArgs, PrepQueue, DEFAULT_ROUNDS};

fn args(reqid: &str, path: &str) -> PrepArgs {
    PrepArgs {
        reqid: reqid.to_string(),
        notify: String::new(),
        prty: "0".to_string(),
        mode: String::new(),
        path: path.to_string(),
        write: false,
        rounds: DEFAULT_ROUNDS,
    }
}

#[tokio::test]
async fn test_add_queues_and_tracks_pending() {
    let (q, mut rx) = PrepQueue::new();
    q.add(args("r1", "/a/x"));

    assert!(q.exists("/a/x"));
    assert!(q.live("r1"));
    let job = rx.recv().await.unwrap();
    assert_eq!(job.reqid, "r1");
    // Still pending until the worker marks it done.
    assert!(q.exists("/a/x"));
}

#[tokio::test]
async fn test_del_cancels_pending_job() {
    let (q, _rx) = PrepQueue::new();
    q.add(args("r1", "/a/x"));
    assert!(q.del("r1"));
    assert!(!q.del("r1"));
    assert!(!q.exists("/a/x"));
    assert!(!q.live("r1"));
}

#[tokio::test]
async fn test_requeue_skips_cancelled_jobs() {
    let (q, mut rx) = PrepQueue::new();
    q.add(args("r1", "/a/x"));
    let job = rx.recv().await.unwrap();

    q.del("r1");
    q.requeue(job);
    assert!(rx.try_recv().is_err(), "cancelled job must not requeue");
}

#[tokio::test]
async fn test_gone_purges_by_path() {
    let (q, _rx) = PrepQueue::new();
    q.add(args("r1", "/a/x"));
    q.add(args("r2", "/a/x"));
    q.add(args("r3", "/a/y"));

    q.gone("/a/x");
    assert!(!q.exists("/a/x"));
    assert!(q.exists("/a/y"));
    assert_eq!(q.len(), 1);
}

#[tokio::test]
async fn test_done_clears_pending() {
    let (q, _rx) = PrepQueue::new();
    q.add(args("r1", "/a/x"));
    q.done("r1");
    assert!(q.is_empty());
}
