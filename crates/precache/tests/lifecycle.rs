use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use precache_engine::partition::MatchOptions;
use precache_engine::test_utils::{MockNetwork, RecordingClient, StaticRegistry};
use precache_engine::{
    CacheError, CacheProxy, FileStore, LifecycleState, Manifest, MemoryStore, NoopHost, Partition,
    PartitionStore, ProxyConfig, ProxyHost, Request, ResourceEntry, init_test_tracing,
};
use url::Url;

fn manifest(entries: &[(&str, &str)]) -> Manifest {
    Manifest::new(
        entries
            .iter()
            .map(|(key, hash)| (key.to_string(), ResourceEntry::new(*key, None, *hash))),
    )
}

fn proxy(
    store: Arc<dyn PartitionStore>,
    network: Arc<MockNetwork>,
    version: &str,
    manifest: Manifest,
) -> CacheProxy {
    let config = ProxyConfig::builder()
        .with_prefix("app")
        .with_version(version)
        .with_origin(Url::parse("https://app.test/").unwrap())
        .with_max_attempts(1)
        .with_retry_delay(Duration::from_millis(1))
        .build();
    CacheProxy::new(
        config,
        manifest,
        ProxyHost {
            store,
            network,
            clients: StaticRegistry::new(vec![RecordingClient::new("tab")]),
            controller: Arc::new(NoopHost),
        },
    )
}

async fn cached_body(store: &MemoryStore, key: &str) -> Option<Bytes> {
    let content = store.open("app-content").await.unwrap();
    body_of(content.as_ref(), key).await
}

async fn body_of(partition: &dyn Partition, key: &str) -> Option<Bytes> {
    partition
        .get(key, MatchOptions::default())
        .await
        .unwrap()
        .map(|stored| stored.body)
}

#[tokio::test]
async fn manifest_diff_keeps_unchanged_and_replaces_changed() {
    init_test_tracing!();
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    network.serve("/a", b"a-v1");
    network.serve("/b", b"b-v1");

    let v1 = proxy(store.clone(), network.clone(), "1", manifest(&[("a", "h1"), ("b", "h2")]));
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    let content = store.open("app-content").await.unwrap();
    let a_before = content.get("a", MatchOptions::default()).await.unwrap().unwrap();

    network.serve("/a", b"a-v2-should-not-be-fetched");
    network.serve("/b", b"b-v2");
    network.serve("/c", b"c-v2");
    let v2 = proxy(
        store.clone(),
        network.clone(),
        "2",
        manifest(&[("a", "h1"), ("b", "h3"), ("c", "h4")]),
    );
    let installed = v2.install().await.unwrap();
    assert_eq!((installed.staged, installed.reused), (2, 1));

    let report = v2.activate().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.promoted, 2);
    assert_eq!(v2.state(), LifecycleState::Active);

    let a_after = content.get("a", MatchOptions::default()).await.unwrap().unwrap();
    assert_eq!(a_after.body, a_before.body);
    assert_eq!(a_after.fetched_at, a_before.fetched_at);
    assert_eq!(network.calls("/a"), 1);

    assert_eq!(cached_body(&store, "b").await, Some(Bytes::from_static(b"b-v2")));
    assert_eq!(cached_body(&store, "c").await, Some(Bytes::from_static(b"c-v2")));

    let previous = v2.lifecycle().previous_manifest().await.unwrap();
    assert_eq!(previous.hash("b"), Some("h3"));
}

#[tokio::test]
async fn reactivation_with_unchanged_manifest_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    network.serve("/", b"<shell>");
    network.serve("/main.js", b"main");
    let resources = [("/", "h0"), ("main.js", "h1")];

    let v1 = proxy(store.clone(), network.clone(), "1", manifest(&resources));
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    let calls = network.total_calls();

    let v2 = proxy(store.clone(), network.clone(), "2", manifest(&resources));
    let installed = v2.install().await.unwrap();
    assert_eq!(installed.staged, 0);
    assert_eq!(installed.reused, 2);

    let report = v2.activate().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.promoted, 0);
    assert_eq!(network.total_calls(), calls);
    assert_eq!(cached_body(&store, "/").await, Some(Bytes::from_static(b"<shell>")));
}

#[tokio::test]
async fn failed_install_leaves_live_version_untouched() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    network.serve("/a", b"a-v1");

    let v1 = proxy(store.clone(), network.clone(), "1", manifest(&[("a", "h1")]));
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    network.set_offline(true);
    let v2 = proxy(store.clone(), network.clone(), "2", manifest(&[("a", "h2")]));
    let err = v2.install().await.unwrap_err();
    assert!(matches!(err, CacheError::Staging { .. }));
    assert_eq!(v2.state(), LifecycleState::Failed);

    assert!(!store.has("app-staging-2").await.unwrap());
    assert_eq!(cached_body(&store, "a").await, Some(Bytes::from_static(b"a-v1")));

    // A later install attempt succeeds once the network is back
    network.set_offline(false);
    network.serve("/a", b"a-v2");
    v2.install().await.unwrap();
    v2.activate().await.unwrap();
    assert_eq!(cached_body(&store, "a").await, Some(Bytes::from_static(b"a-v2")));
}

#[tokio::test]
async fn failed_activation_rolls_back_to_empty_cache() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    network.serve("/a", b"a");

    let v1 = proxy(store.clone(), network.clone(), "1", manifest(&[("a", "h1")]));
    v1.install().await.unwrap();

    // Corrupt the persisted manifest so the diff step fails
    let manifest_store = store.open("app-manifest").await.unwrap();
    manifest_store
        .put(
            "__manifest__",
            precache_engine::partition::StoredResponse::new(
                precache_engine::partition::ResponseHead::ok(),
                Bytes::from_static(b"not json"),
            ),
        )
        .await
        .unwrap();

    let err = v1.activate().await.unwrap_err();
    assert!(matches!(err, CacheError::Activation(_)));
    assert_eq!(v1.state(), LifecycleState::Failed);
    for name in ["app-content", "app-staging-1", "app-manifest"] {
        assert!(!store.has(name).await.unwrap(), "{name} should be deleted");
    }

    // Clean re-install from scratch
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    assert_eq!(cached_body(&store, "a").await, Some(Bytes::from_static(b"a")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_during_activation_see_one_version_per_resource() {
    init_test_tracing!();
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(tmp.path()).await.unwrap());
    let network = MockNetwork::new();
    network.serve("/", b"<shell-v1>");
    network.serve("/a", b"a-v1");
    network.serve("/b", b"b-v1");

    let v1 = proxy(
        store.clone(),
        network.clone(),
        "1",
        manifest(&[("/", "h0"), ("a", "h1"), ("b", "h2")]),
    );
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    network.serve("/", b"<shell-v2>");
    network.serve("/b", b"b-v2");
    network.serve("/c", b"c-v2");
    let v2 = Arc::new(proxy(
        store.clone(),
        network.clone(),
        "2",
        manifest(&[("/", "h5"), ("a", "h1"), ("b", "h3"), ("c", "h4")]),
    ));
    v2.install().await.unwrap();
    network.set_latency(Duration::from_millis(2));

    let activation = tokio::spawn({
        let v2 = Arc::clone(&v2);
        async move { v2.activate().await }
    });

    let origin = Url::parse("https://app.test/").unwrap();
    let mut requests = Vec::new();
    for _ in 0..10 {
        for path in ["a", "b", "c", ""] {
            let v2 = Arc::clone(&v2);
            let url = origin.join(path).unwrap();
            requests.push(tokio::spawn(async move {
                let request = if path.is_empty() {
                    Request::navigate(url)
                } else {
                    Request::get(url)
                };
                let response = v2.handle_fetch(request).await;
                assert!(response.is_success(), "{path} answered {}", response.status);
                (path, response.body.collect().await.unwrap())
            }));
        }
    }

    // The new manifest is only persisted once its resources are live
    let content = store.open("app-content").await.unwrap();
    while !activation.is_finished() {
        let persisted = v2.lifecycle().previous_manifest().await.unwrap();
        if persisted.hash("b") == Some("h3") {
            assert_eq!(body_of(content.as_ref(), "b").await, Some(Bytes::from_static(b"b-v2")));
            assert!(body_of(content.as_ref(), "c").await.is_some());
        }
        tokio::task::yield_now().await;
    }
    activation.await.unwrap().unwrap();
    assert_eq!(v2.state(), LifecycleState::Active);

    for request in requests {
        let (path, body) = request.await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        let allowed: &[&str] = match path {
            "a" => &["a-v1"],
            "b" => &["b-v1", "b-v2"],
            "c" => &["c-v2"],
            _ => &["<shell-v1>", "<shell-v2>"],
        };
        assert!(allowed.contains(&body.as_str()), "{path} served {body}");
    }

    let mut keys = content.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["/", "a", "b", "c"]);
    assert_eq!(body_of(content.as_ref(), "a").await, Some(Bytes::from_static(b"a-v1")));
    assert_eq!(body_of(content.as_ref(), "b").await, Some(Bytes::from_static(b"b-v2")));
    assert_eq!(body_of(content.as_ref(), "c").await, Some(Bytes::from_static(b"c-v2")));
    assert_eq!(body_of(content.as_ref(), "/").await, Some(Bytes::from_static(b"<shell-v2>")));
    assert_eq!(network.calls("/a"), 1);
    assert!(!store.has("app-staging-2").await.unwrap());

    let persisted = v2.lifecycle().previous_manifest().await.unwrap();
    assert_eq!(persisted.hash("b"), Some("h3"));
}
