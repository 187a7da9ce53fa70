#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use corral_core::{Kind, Resource, ResourceKey, ResourceMetadata, StateError, Version, WatchEvent};
use corral_store::{finalizers_empty, watch_for, MemoryConfig, MemoryState, State, UpdateOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn cluster(id: &str) -> Resource { Resource::new(ResourceMetadata::new("default", "Cluster", id), serde_json::json!({})) }

fn kind() -> Kind { Kind::new("default", "Cluster") }

async fn next(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
    timeout(Duration::from_secs(2), rx.recv()).await.expect("watch event timed out").expect("watch closed")
}

#[tokio::test]
async fn bootstrap_then_live_events() {
    let st = MemoryState::default();
    st.create(cluster("c1")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    st.watch(&kind(), WatchOptions::default(), tx, cancel.clone()).await.unwrap();

    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "c1"));
    assert_eq!(next(&mut rx).await, WatchEvent::Bootstrapped);

    let c2 = st.create(cluster("c2")).await.unwrap();
    assert_eq!(next(&mut rx).await, WatchEvent::Created(c2.clone()));
    st.update(c2, UpdateOptions::default()).await.unwrap();
    match next(&mut rx).await {
        WatchEvent::Updated { old, new } => {
            assert_eq!(old.metadata.version, Version::Value(1));
            assert_eq!(new.metadata.version, Version::Value(2));
        }
        other => panic!("unexpected {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test]
async fn tail_replays_last_events_instead_of_bootstrap() {
    let st = MemoryState::default();
    for id in ["a", "b", "c", "d"] { st.create(cluster(id)).await.unwrap(); }
    let (tx, mut rx) = mpsc::channel(16);
    let opts = WatchOptions { tail_events: 2, ..Default::default() };
    st.watch(&kind(), opts, tx, CancellationToken::new()).await.unwrap();

    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "c"));
    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "d"));
    st.create(cluster("e")).await.unwrap();
    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "e"));
}

#[tokio::test]
async fn label_filtered_watch_emits_only_matching() {
    let st = MemoryState::default();
    let (tx, mut rx) = mpsc::channel(16);
    let opts = WatchOptions { label_queries: vec![corral_search::parse_selector("env=prod").unwrap()], ..Default::default() };
    st.watch(&kind(), opts, tx, CancellationToken::new()).await.unwrap();
    assert_eq!(next(&mut rx).await, WatchEvent::Bootstrapped);

    st.create(cluster("dev").with_label("env", "dev")).await.unwrap();
    st.create(cluster("prod").with_label("env", "prod")).await.unwrap();
    st.create(cluster("none")).await.unwrap();
    st.create(cluster("prod2").with_label("env", "prod")).await.unwrap();

    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "prod"));
    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "prod2"));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn single_identity_watch_is_version_ordered() {
    let st = MemoryState::default();
    let mut cur = st.create(cluster("c1")).await.unwrap();
    st.create(cluster("c2")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let opts = WatchOptions { id: Some("c1".into()), ..Default::default() };
    st.watch(&kind(), opts, tx, CancellationToken::new()).await.unwrap();
    assert!(matches!(next(&mut rx).await, WatchEvent::Created(_)));

    for _ in 0..10 { cur = st.update(cur, UpdateOptions::default()).await.unwrap(); }
    let mut last = 1;
    for _ in 0..10 {
        let v = next(&mut rx).await.version().and_then(|v| v.value()).unwrap();
        assert_eq!(v, last + 1);
        last = v;
    }
}

#[tokio::test]
async fn missing_identity_starts_with_destroyed() {
    let st = MemoryState::default();
    let (tx, mut rx) = mpsc::channel(4);
    let opts = WatchOptions { id: Some("ghost".into()), ..Default::default() };
    st.watch(&kind(), opts, tx, CancellationToken::new()).await.unwrap();
    assert!(matches!(next(&mut rx).await, WatchEvent::Destroyed(r) if r.metadata.id == "ghost"));
}

#[tokio::test]
async fn cancellation_closes_the_stream() {
    let st = MemoryState::default();
    let (tx, mut rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    st.watch(&kind(), WatchOptions::default(), tx, cancel.clone()).await.unwrap();
    assert_eq!(next(&mut rx).await, WatchEvent::Bootstrapped);
    cancel.cancel();
    let closed = timeout(Duration::from_secs(2), rx.recv()).await.expect("stream did not close");
    assert!(closed.is_none());
}

#[tokio::test]
async fn slow_watcher_gets_errored() {
    let st = MemoryState::new(MemoryConfig { history: 16, buffer: 2 });
    let (tx, mut rx) = mpsc::channel(1);
    st.watch(&kind(), WatchOptions::default(), tx, CancellationToken::new()).await.unwrap();
    for i in 0..32 { st.create(cluster(&format!("c{i}"))).await.unwrap(); }
    let mut errored = false;
    while let Ok(Some(ev)) = timeout(Duration::from_secs(2), rx.recv()).await {
        if let WatchEvent::Errored(_) = ev { errored = true; }
    }
    assert!(errored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_for_resolves_when_finalizers_drain() {
    let st = Arc::new(MemoryState::default());
    let key = ResourceKey::new("default", "Cluster", "c1");
    st.create(cluster("c1")).await.unwrap();
    st.add_finalizers(&key, &["ctrl".to_string()]).await.unwrap();

    let waiter = {
        let st = Arc::clone(&st);
        let key = key.clone();
        tokio::spawn(async move { watch_for(&*st, &key, &CancellationToken::new(), finalizers_empty).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    st.remove_finalizers(&key, &["ctrl".to_string()]).await.unwrap();
    let ev = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap().unwrap();
    assert!(ev.resource().unwrap().metadata.finalizers.is_empty());
}

#[tokio::test]
async fn watch_for_is_cancellable() {
    let st = MemoryState::default();
    let key = ResourceKey::new("default", "Cluster", "c1");
    st.create(cluster("c1")).await.unwrap();
    st.add_finalizers(&key, &["ctrl".to_string()]).await.unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = timeout(Duration::from_secs(2), watch_for(&st, &key, &cancel, finalizers_empty)).await.unwrap().unwrap_err();
    assert_eq!(err, StateError::Cancelled);
}

#[tokio::test]
async fn relabelling_moves_resources_in_and_out_of_a_filtered_watch() {
    let st = MemoryState::default();
    let (tx, mut rx) = mpsc::channel(16);
    let opts = WatchOptions { label_queries: corral_search::parse_selectors(&["env=prod"]).unwrap(), ..Default::default() };
    st.watch(&kind(), opts, tx, CancellationToken::new()).await.unwrap();
    assert_eq!(next(&mut rx).await, WatchEvent::Bootstrapped);

    let a = st.create(cluster("a").with_label("env", "prod")).await.unwrap();
    assert!(matches!(next(&mut rx).await, WatchEvent::Created(r) if r.metadata.id == "a"));

    // Leaving the selection reads as a removal of the last matching state.
    let mut leaving = a.clone();
    leaving.metadata.labels.set("env", "dev");
    st.update(leaving, UpdateOptions::default()).await.unwrap();
    match next(&mut rx).await {
        WatchEvent::Destroyed(r) => {
            assert_eq!(r.metadata.id, "a");
            assert_eq!(r.metadata.labels.get("env"), Some("prod"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Entering the selection reads as a creation.
    let mut b = st.create(cluster("b").with_label("env", "dev")).await.unwrap();
    b.metadata.labels.set("env", "prod");
    st.update(b, UpdateOptions::default()).await.unwrap();
    match next(&mut rx).await {
        WatchEvent::Created(r) => {
            assert_eq!(r.metadata.id, "b");
            assert_eq!(r.metadata.labels.get("env"), Some("prod"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Changes entirely outside the selection stay invisible.
    let mut c = st.create(cluster("c").with_label("env", "dev")).await.unwrap();
    c.spec = serde_json::json!({ "replicas": 2 });
    st.update(c, UpdateOptions::default()).await.unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}
