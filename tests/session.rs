//! Session-layer behavior, exercised against the in-memory ensemble.
//!
//! Every test connects to an ensemble named after itself so the trees stay
//! isolated. `InMemoryCluster` doubles as the control surface for the
//! conditions a real ensemble does not produce on demand: transient
//! transport faults and session expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_zkutil::error;
use tokio_zkutil::metrics::Metrics;
use tokio_zkutil::testing::{InMemoryCluster, InMemoryDriver};
use tokio_zkutil::{
    CreateMode, EphemeralNode, Error, Op, WatchedEventType, ZkError, ZooKeeper,
    ZooKeeperBuilder, DEFAULT_RETRY_COUNT,
};

fn logger() -> slog::Logger {
    use slog::Drain;
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

async fn client(ensemble: &str) -> ZooKeeper<InMemoryDriver> {
    ZooKeeperBuilder::new(ensemble)
        .logger(logger())
        .connect::<InMemoryDriver>()
        .await
        .expect("in-memory connect never fails")
}

/// Lets the driver's worker task (and any spawned observers) run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn create_then_get_round_trips_at_version_zero() {
    let zk = client("create-get").await;
    zk.create("/node", &b"payload"[..], CreateMode::Persistent)
        .await
        .unwrap();
    let (data, stat) = zk.get("/node").await.unwrap();
    assert_eq!(data, b"payload");
    assert_eq!(stat.version, 0);
    assert_eq!(stat.ephemeral_owner, 0);
}

#[tokio::test]
async fn try_remove_reports_an_absent_node_as_an_outcome() {
    let zk = client("try-remove-absent").await;
    let outcome = zk.try_remove("/never-created", -1).await.unwrap();
    assert_eq!(outcome, Err(error::Delete::NoNode));
}

#[tokio::test]
async fn remove_honors_the_version_guard() {
    let zk = client("remove-version").await;
    zk.create("/guarded", &b"v0"[..], CreateMode::Persistent)
        .await
        .unwrap();
    zk.set("/guarded", &b"v1"[..], 0).await.unwrap();

    let err = zk.remove("/guarded", 0).await.unwrap_err();
    assert_eq!(err.code(), Some(ZkError::BadVersion));
    assert!(zk.exists("/guarded").await.unwrap().is_some());

    // -1 matches any version
    zk.remove("/guarded", -1).await.unwrap();
    assert!(zk.exists("/guarded").await.unwrap().is_none());
}

#[tokio::test]
async fn create_ancestors_builds_the_chain_but_not_the_leaf() {
    let zk = client("ancestors").await;
    zk.create_ancestors("/a/b/c").await.unwrap();

    for ancestor in ["/a", "/a/b"] {
        let (data, stat) = zk.get(ancestor).await.unwrap();
        assert_eq!(data, b"");
        assert_eq!(stat.version, 0);
        assert_eq!(stat.ephemeral_owner, 0);
    }
    assert!(zk.exists("/a/b/c").await.unwrap().is_none());

    // idempotent, and existing ancestors keep their contents
    zk.set("/a", &b"kept"[..], -1).await.unwrap();
    zk.create_ancestors("/a/b/c").await.unwrap();
    assert_eq!(zk.get("/a").await.unwrap().0, b"kept");
}

#[tokio::test]
async fn sequential_create_returns_the_suffixed_path() {
    let zk = client("sequential").await;
    zk.create("/queue", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let created = zk
        .create("/queue/item-", &b"job"[..], CreateMode::PersistentSequential)
        .await
        .unwrap();
    assert!(created.starts_with("/queue/item-"));
    let suffix = &created["/queue/item-".len()..];
    assert_eq!(suffix.len(), 10);
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    assert!(zk.exists(&created).await.unwrap().is_some());

    let next = zk
        .create("/queue/item-", &b"job"[..], CreateMode::PersistentSequential)
        .await
        .unwrap();
    assert!(next > created);
}

#[tokio::test]
async fn create_if_not_exists_swallows_node_exists_only() {
    let zk = client("cine").await;
    zk.create_if_not_exists("/present", &b"first"[..])
        .await
        .unwrap();
    zk.create_if_not_exists("/present", &b"second"[..])
        .await
        .unwrap();
    assert_eq!(zk.get("/present").await.unwrap().0, b"first");

    // a missing parent is still a failure
    let err = zk
        .create_if_not_exists("/missing/child", &b""[..])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ZkError::NoNode));
}

#[tokio::test]
async fn create_or_update_covers_both_branches() {
    let zk = client("cou").await;
    zk.create_or_update("/doc", &b"v0"[..], CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(zk.get("/doc").await.unwrap().0, b"v0");

    zk.create_or_update("/doc", &b"v1"[..], CreateMode::Persistent)
        .await
        .unwrap();
    let (data, stat) = zk.get("/doc").await.unwrap();
    assert_eq!(data, b"v1");
    assert_eq!(stat.version, 1);
}

#[tokio::test]
async fn failed_multi_leaves_no_partial_state() {
    let zk = client("multi-atomic").await;
    let cluster = InMemoryCluster::ensemble("multi-atomic");

    let err = zk
        .multi(&[
            Op::create("/x", &b""[..], CreateMode::Persistent),
            Op::remove("/y", -1),
        ])
        .await
        .unwrap_err();
    match err {
        Error::Multi { index, path, code } => {
            assert_eq!(index, 1);
            assert_eq!(path, "/y");
            assert_eq!(code, ZkError::NoNode);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!cluster.node_exists("/x"));
}

#[tokio::test]
async fn try_multi_reports_rollbacks_positionally() {
    let zk = client("try-multi").await;
    let outcome = zk
        .try_multi(&[
            Op::create("/x", &b""[..], CreateMode::Persistent),
            Op::remove("/y", -1),
            Op::create("/z", &b""[..], CreateMode::Persistent),
        ])
        .await
        .unwrap();
    assert!(!outcome.ok());
    assert_eq!(outcome.code, ZkError::NoNode);
    assert_eq!(outcome.failed_index, Some(1));
    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.results[0], Err(error::Multi::RolledBack));
    assert_eq!(
        outcome.results[1],
        Err(error::Multi::Delete(error::Delete::NoNode))
    );
    assert_eq!(outcome.results[2], Err(error::Multi::Skipped));
    assert!(zk.exists("/x").await.unwrap().is_none());
    assert!(zk.exists("/z").await.unwrap().is_none());
}

#[tokio::test]
async fn applied_multi_returns_positional_responses() {
    let zk = client("multi-applied").await;
    let responses = zk
        .multi(&[
            Op::create("/a", &b"one"[..], CreateMode::Persistent),
            Op::set("/a", &b"two"[..], 0),
            Op::get("/a"),
            Op::exists("/a"),
            Op::get_children("/"),
        ])
        .await
        .unwrap();
    assert_eq!(responses.len(), 5);
    match &responses[2] {
        tokio_zkutil::MultiResponse::Get(data, stat) => {
            assert_eq!(data, b"two");
            assert_eq!(stat.version, 1);
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn try_multi_no_throw_is_total_even_for_malformed_input() {
    let zk = client("multi-total").await;
    let outcome = zk
        .try_multi_no_throw(&[Op::create("not-absolute", &b""[..], CreateMode::Persistent)])
        .await;
    assert_eq!(outcome.code, ZkError::BadArguments);
    assert!(outcome.results.is_empty());

    // an empty batch is a successful no-op
    let outcome = zk.try_multi_no_throw(&[]).await;
    assert!(outcome.ok());
}

#[tokio::test]
async fn reads_inside_a_batch_act_as_assertions() {
    let zk = client("multi-assert").await;
    zk.create("/present", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let outcome = zk
        .try_multi(&[
            Op::exists("/absent"),
            Op::create("/child", &b""[..], CreateMode::Persistent),
        ])
        .await
        .unwrap();
    assert_eq!(outcome.code, ZkError::NoNode);
    assert_eq!(outcome.failed_index, Some(0));
    assert!(zk.exists("/child").await.unwrap().is_none());
}

#[tokio::test]
async fn reads_retry_recoverable_faults_within_the_budget() {
    let zk = client("read-retry").await;
    let cluster = InMemoryCluster::ensemble("read-retry");
    zk.create("/node", &b"data"[..], CreateMode::Persistent)
        .await
        .unwrap();

    cluster.inject_faults(ZkError::ConnectionLoss, DEFAULT_RETRY_COUNT - 1);
    let (data, _) = zk.get("/node").await.unwrap();
    assert_eq!(data, b"data");
}

#[tokio::test]
async fn reads_raise_the_last_code_past_the_budget() {
    let zk = client("read-budget").await;
    let cluster = InMemoryCluster::ensemble("read-budget");
    zk.create("/node", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();

    cluster.inject_faults(ZkError::OperationTimeout, DEFAULT_RETRY_COUNT);
    let err = zk.get("/node").await.unwrap_err();
    assert_eq!(err.code(), Some(ZkError::OperationTimeout));

    // the budget was exhausted exactly: no fault left over
    assert!(zk.get("/node").await.is_ok());
}

#[tokio::test]
async fn mutations_never_resubmit_on_recoverable_faults() {
    let zk = client("mutation-no-retry").await;
    let cluster = InMemoryCluster::ensemble("mutation-no-retry");

    // one queued fault; a retrying create would consume it and then
    // succeed on the second attempt
    cluster.inject_faults(ZkError::ConnectionLoss, 1);
    let err = zk
        .create("/once", &b""[..], CreateMode::Persistent)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ZkError::ConnectionLoss));
    assert!(!cluster.node_exists("/once"));

    zk.create("/target", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    cluster.inject_faults(ZkError::OperationTimeout, 1);
    let err = zk.set("/target", &b"new"[..], -1).await.unwrap_err();
    assert_eq!(err.code(), Some(ZkError::OperationTimeout));
    assert_eq!(cluster.node_data("/target"), Some(b"".to_vec()));
}

#[tokio::test]
async fn chroot_is_invisible_to_the_caller() {
    let plain = client("chroot").await;
    plain
        .create("/app", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let zk = ZooKeeperBuilder::new("chroot")
        .chroot("/app")
        .connect::<InMemoryDriver>()
        .await
        .unwrap();
    let cluster = InMemoryCluster::ensemble("chroot");

    zk.create("/app-root-child", &b"here"[..], CreateMode::Persistent)
        .await
        .unwrap();
    assert!(cluster.node_exists("/app/app-root-child"));
    assert!(!cluster.node_exists("/app-root-child"));
    assert_eq!(zk.get("/app-root-child").await.unwrap().0, b"here");

    // created paths come back in client form, sequence suffix included
    let created = zk
        .create("/seq-", &b""[..], CreateMode::PersistentSequential)
        .await
        .unwrap();
    assert!(created.starts_with("/seq-"));
    assert!(!created.starts_with("/app"));

    // watch events are translated too
    let (stat, signal) = zk.exists_watch("/watched").await.unwrap();
    assert!(stat.is_none());
    zk.create("/watched", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let event = signal.await.expect("watch must fire");
    assert_eq!(event.event_type, WatchedEventType::NodeCreated);
    assert_eq!(event.path, "/watched");
}

#[tokio::test]
async fn batched_creates_return_client_side_paths() {
    let plain = client("chroot-multi").await;
    plain
        .create("/app", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let zk = ZooKeeperBuilder::new("chroot-multi")
        .chroot("/app")
        .connect::<InMemoryDriver>()
        .await
        .unwrap();
    let cluster = InMemoryCluster::ensemble("chroot-multi");

    let responses = zk
        .multi(&[
            Op::create("/x", &b""[..], CreateMode::Persistent),
            Op::create("/x/seq-", &b""[..], CreateMode::PersistentSequential),
        ])
        .await
        .unwrap();
    assert!(cluster.node_exists("/app/x"));
    assert_eq!(
        responses[0],
        tokio_zkutil::MultiResponse::Create("/x".to_string())
    );
    match &responses[1] {
        tokio_zkutil::MultiResponse::Create(path) => {
            assert!(path.starts_with("/x/seq-"), "leaked path {:?}", path);
            assert!(zk.exists(path).await.unwrap().is_some());
        }
        other => panic!("unexpected response {:?}", other),
    }

    let outcome = zk
        .try_multi(&[Op::create("/y", &b""[..], CreateMode::Persistent)])
        .await
        .unwrap();
    assert_eq!(
        outcome.results[0],
        Ok(tokio_zkutil::MultiResponse::Create("/y".to_string()))
    );

    let responses = zk
        .async_multi(&[Op::create("/z", &b""[..], CreateMode::Persistent)])
        .await
        .unwrap();
    assert_eq!(
        responses[0],
        tokio_zkutil::MultiResponse::Create("/z".to_string())
    );

    let outcome = zk
        .try_multi_no_throw(&[Op::create("/w", &b""[..], CreateMode::Persistent)])
        .await;
    assert_eq!(
        outcome.results[0],
        Ok(tokio_zkutil::MultiResponse::Create("/w".to_string()))
    );
}

#[tokio::test]
async fn the_chroot_node_itself_is_the_client_root() {
    let zk = ZooKeeperBuilder::new("chroot-root")
        .chroot("/scope")
        .connect::<InMemoryDriver>()
        .await
        .unwrap();
    let plain = client("chroot-root").await;
    plain
        .create("/scope", &b"scope"[..], CreateMode::Persistent)
        .await
        .unwrap();

    let (data, _) = zk.get("/").await.unwrap();
    assert_eq!(data, b"scope");
}

#[tokio::test]
async fn exists_watch_fires_for_creation_of_an_absent_node() {
    let zk = client("exists-watch").await;
    let (stat, signal) = zk.exists_watch("/pending").await.unwrap();
    assert!(stat.is_none());

    zk.create("/pending", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let event = signal.await.expect("watch must fire");
    assert_eq!(event.event_type, WatchedEventType::NodeCreated);
    assert_eq!(event.path, "/pending");
}

#[tokio::test]
async fn a_watch_fires_at_most_once() {
    let zk = client("one-shot").await;
    zk.create("/node", &b"v0"[..], CreateMode::Persistent)
        .await
        .unwrap();

    let (_, _, signal) = zk.get_watch("/node").await.unwrap();
    zk.set("/node", &b"v1"[..], -1).await.unwrap();
    let event = signal.await.expect("watch must fire");
    assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);

    // the second change goes unobserved until a fresh watch is armed
    let (_, _, mut rearmed) = zk.get_watch("/node").await.unwrap();
    assert!(rearmed.try_fired().is_none());
    zk.set("/node", &b"v2"[..], -1).await.unwrap();
    settle().await;
    let event = rearmed.try_fired().expect("rearmed watch must fire");
    assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);
}

#[tokio::test]
async fn watch_callbacks_run_when_the_watch_fires() {
    let zk = client("watch-callback").await;
    zk.create("/node", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let (_, signal) = zk.exists_watch("/node").await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    signal.callback(move |event| {
        assert_eq!(event.event_type, WatchedEventType::NodeDeleted);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    zk.remove("/node", -1).await.unwrap();
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wait_for_disappear_returns_immediately_when_absent() {
    let zk = client("wait-absent").await;
    tokio::time::timeout(Duration::from_millis(100), zk.wait_for_disappear("/ghost"))
        .await
        .expect("must not block")
        .unwrap();
}

#[tokio::test]
async fn wait_for_disappear_observes_the_deletion() {
    let zk = client("wait-deleted").await;
    zk.create("/doomed", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();

    let remover = zk.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        remover.remove("/doomed", -1).await.unwrap();
    });

    tokio::time::timeout(Duration::from_secs(5), zk.wait_for_disappear("/doomed"))
        .await
        .expect("deletion must be observed")
        .unwrap();
}

#[tokio::test]
async fn remove_recursive_takes_the_whole_subtree() {
    let zk = client("rm-r").await;
    zk.create_ancestors("/tree/a/leaf").await.unwrap();
    zk.create("/tree/a/leaf", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    zk.create("/tree/b", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();

    zk.remove_recursive("/tree").await.unwrap();
    assert!(zk.exists("/tree").await.unwrap().is_none());

    // the throwing form requires the node to exist
    let err = zk.remove_recursive("/tree").await.unwrap_err();
    assert_eq!(err.code(), Some(ZkError::NoNode));
}

#[tokio::test]
async fn try_remove_recursive_is_idempotent() {
    let zk = client("try-rm-r").await;
    zk.create_ancestors("/tree/deep/leaf").await.unwrap();
    zk.create("/tree/deep/leaf", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();

    zk.try_remove_recursive("/tree").await.unwrap();
    assert!(zk.exists("/tree").await.unwrap().is_none());
    // already gone is fine
    zk.try_remove_recursive("/tree").await.unwrap();
}

#[derive(Default)]
struct CountingMetrics {
    registered: AtomicUsize,
    released: AtomicUsize,
    failed_removals: AtomicUsize,
}

impl Metrics for CountingMetrics {
    fn ephemeral_node_registered(&self, _path: &str) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }
    fn ephemeral_node_released(&self, _path: &str) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
    fn cannot_remove_ephemeral_node(&self, _path: &str) {
        self.failed_removals.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn ephemeral_holder_creates_and_removes_its_node() {
    let zk = client("holder").await;
    let cluster = InMemoryCluster::ensemble("holder");

    let holder = EphemeralNode::create(&zk, "/member", &b"me"[..])
        .await
        .unwrap();
    assert_eq!(holder.path(), "/member");
    assert_eq!(cluster.node_owner("/member"), Some(zk.session_id()));

    holder.release().await;
    assert!(!cluster.node_exists("/member"));
}

#[tokio::test]
async fn ephemeral_holder_drop_removes_the_node() {
    let zk = client("holder-drop").await;
    let cluster = InMemoryCluster::ensemble("holder-drop");

    let holder = EphemeralNode::create_sequential(&zk, "/member-", &b""[..])
        .await
        .unwrap();
    let path = holder.path().to_string();
    assert!(cluster.node_exists(&path));

    drop(holder);
    settle().await;
    assert!(!cluster.node_exists(&path));
}

#[tokio::test]
async fn holder_release_after_external_removal_is_silent() {
    let metrics = Arc::new(CountingMetrics::default());
    let zk = ZooKeeperBuilder::new("holder-gone")
        .metrics(Arc::clone(&metrics) as Arc<dyn Metrics>)
        .connect::<InMemoryDriver>()
        .await
        .unwrap();

    let holder = EphemeralNode::create(&zk, "/member", &b""[..])
        .await
        .unwrap();
    zk.remove("/member", -1).await.unwrap();
    holder.release().await;

    assert_eq!(metrics.registered.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.released.load(Ordering::SeqCst), 1);
    // already gone is a benign outcome, not a failed removal
    assert_eq!(metrics.failed_removals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn holder_drop_on_an_expired_session_counts_once() {
    let metrics = Arc::new(CountingMetrics::default());
    let zk = ZooKeeperBuilder::new("holder-expired")
        .metrics(Arc::clone(&metrics) as Arc<dyn Metrics>)
        .connect::<InMemoryDriver>()
        .await
        .unwrap();
    let cluster = InMemoryCluster::ensemble("holder-expired");

    let holder = EphemeralNode::create(&zk, "/member", &b""[..])
        .await
        .unwrap();
    cluster.expire_session(zk.session_id());

    // destruction must not raise, only count
    drop(holder);
    settle().await;
    assert_eq!(metrics.failed_removals.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tracking_an_existing_node_takes_over_removal_only() {
    let zk = client("holder-existing").await;
    let cluster = InMemoryCluster::ensemble("holder-existing");
    zk.create("/adopted", &b""[..], CreateMode::Ephemeral)
        .await
        .unwrap();

    let holder = EphemeralNode::existing(&zk, "/adopted");
    assert!(cluster.node_exists("/adopted"));
    holder.release().await;
    assert!(!cluster.node_exists("/adopted"));
}

#[tokio::test]
async fn expiry_latches_and_fails_everything() {
    let zk = client("expiry").await;
    let cluster = InMemoryCluster::ensemble("expiry");
    zk.create("/survivor", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    zk.create("/gone-with-me", &b""[..], CreateMode::Ephemeral)
        .await
        .unwrap();
    assert!(!zk.expired());

    cluster.expire_session(zk.session_id());
    assert!(zk.expired());
    assert!(!cluster.node_exists("/gone-with-me"));
    assert!(cluster.node_exists("/survivor"));

    let err = zk.get("/survivor").await.unwrap_err();
    assert!(err.is_session_expired());
    let err = zk
        .create("/new", &b""[..], CreateMode::Persistent)
        .await
        .unwrap_err();
    assert!(err.is_session_expired());

    // even the total batch form reports the expiry, without raising
    let outcome = zk.try_multi_no_throw(&[Op::exists("/survivor")]).await;
    assert_eq!(outcome.code, ZkError::SessionExpired);
}

#[tokio::test]
async fn empty_batches_still_observe_expiry() {
    let zk = client("empty-batch-expired").await;
    let cluster = InMemoryCluster::ensemble("empty-batch-expired");
    cluster.expire_session(zk.session_id());

    assert!(zk.multi(&[]).await.unwrap_err().is_session_expired());
    assert!(zk.try_multi(&[]).await.unwrap_err().is_session_expired());
    assert!(zk.async_multi(&[]).await.unwrap_err().is_session_expired());
    let outcome = zk.try_multi_no_throw(&[]).await;
    assert_eq!(outcome.code, ZkError::SessionExpired);
}

#[tokio::test]
async fn expiry_drops_armed_watches_unfired() {
    let zk = client("expiry-watch").await;
    let cluster = InMemoryCluster::ensemble("expiry-watch");
    zk.create("/node", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let (_, _, signal) = zk.get_watch("/node").await.unwrap();

    cluster.expire_session(zk.session_id());
    // no event is delivered for the implicit deregistration
    assert_eq!(signal.await, None);
}

#[tokio::test]
async fn start_new_session_reuses_the_configuration() {
    let plain = client("fresh-session").await;
    plain
        .create("/app", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    let zk = ZooKeeperBuilder::new("fresh-session")
        .chroot("/app")
        .connect::<InMemoryDriver>()
        .await
        .unwrap();
    let cluster = InMemoryCluster::ensemble("fresh-session");

    zk.create("/state", &b"kept"[..], CreateMode::Persistent)
        .await
        .unwrap();
    cluster.expire_session(zk.session_id());
    assert!(zk.expired());

    let replacement = zk.start_new_session().await.unwrap();
    assert_ne!(replacement.session_id(), zk.session_id());
    assert_eq!(replacement.config().chroot(), Some("/app"));
    assert!(!replacement.expired());
    assert_eq!(replacement.get("/state").await.unwrap().0, b"kept");

    // the original handle stays latched
    assert!(zk.get("/state").await.unwrap_err().is_session_expired());
}

#[tokio::test]
async fn async_operations_are_submitted_eagerly() {
    let zk = client("eager").await;
    let cluster = InMemoryCluster::ensemble("eager");
    zk.create("/doomed", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();

    // dropping the future abandons the answer, not the request
    drop(zk.async_remove("/doomed", -1));
    settle().await;
    assert!(!cluster.node_exists("/doomed"));
}

#[tokio::test]
async fn async_facade_resolves_to_the_same_outcomes() {
    let zk = client("facade").await;
    zk.create("/node", &b"data"[..], CreateMode::Persistent)
        .await
        .unwrap();

    // issued back to back, resolved in order by the driver
    let get = zk.async_get("/node");
    let stat = zk.async_exists("/node");
    let children = zk.async_get_children("/");
    let absent = zk.async_try_get("/nope");

    assert_eq!(get.await.unwrap().0, b"data");
    assert_eq!(stat.await.unwrap().unwrap().version, 0);
    assert_eq!(children.await.unwrap(), vec!["node".to_string()]);
    assert_eq!(absent.await.unwrap(), None);

    let removed = zk.async_try_remove("/nope", -1).await.unwrap();
    assert_eq!(removed, Err(error::Delete::NoNode));

    let outcome = zk
        .async_try_multi(&[Op::set("/node", &b"new"[..], 41)])
        .await;
    assert_eq!(outcome.code, ZkError::BadVersion);

    let responses = zk
        .async_multi(&[Op::set("/node", &b"new"[..], 0)])
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
}

#[tokio::test]
async fn async_facade_on_an_expired_session_is_doomed_but_defined() {
    let zk = client("facade-expired").await;
    let cluster = InMemoryCluster::ensemble("facade-expired");
    cluster.expire_session(zk.session_id());

    let err = zk.async_get("/x").await.unwrap_err();
    assert!(err.is_session_expired());

    let outcome = zk.async_try_multi(&[Op::exists("/x")]).await;
    assert_eq!(outcome.code, ZkError::SessionExpired);
}

#[tokio::test]
async fn malformed_paths_are_rejected_client_side() {
    let zk = client("bad-paths").await;
    for path in ["", "relative", "/trailing/", "/double//slash"] {
        let err = zk.get(path).await.unwrap_err();
        assert!(matches!(err, Error::BadPath { .. }), "{:?}", path);
    }
    // nothing was submitted, so nothing to answer
    let outcome = zk.try_remove("/fine", -1).await.unwrap();
    assert_eq!(outcome, Err(error::Delete::NoNode));
}

#[tokio::test]
async fn ephemeral_nodes_cannot_have_children() {
    let zk = client("ephemeral-parent").await;
    zk.create("/owner", &b""[..], CreateMode::Ephemeral)
        .await
        .unwrap();
    let outcome = zk
        .try_create("/owner/child", &b""[..], CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(outcome, Err(error::Create::NoChildrenForEphemerals));
}
