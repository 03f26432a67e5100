//! End-to-end request scenarios through the `KeyStash` facade
//!
//! Covers the orchestrator paths:
//! - first load from the loader, then hits from memory and persistence
//! - forced eviction always reloading
//! - missing loader with and without cached data
//! - expired-data fallback keeping the original source

use std::{sync::Arc, time::Duration};

use keystash_cache::{
    BoxError, CacheError, CacheSettings, ConfigProvider, EvictScope, KeyScope, KeyStash,
    ManualClock, Response, Source,
};
use tempfile::TempDir;

fn stash(
    dir: &TempDir,
    clock: &Arc<ManualClock>,
    configure: impl FnOnce(&mut CacheSettings),
) -> KeyStash {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut settings = CacheSettings::new(dir.path());
    configure(&mut settings);
    KeyStash::builder()
        .settings(settings)
        .clock(clock.clone())
        .build()
        .unwrap()
}

fn mocks_with(data: &[&str]) -> ConfigProvider<Vec<String>> {
    let data: Vec<String> = data.iter().map(|s| s.to_string()).collect();
    ConfigProvider::builder("mocks")
        .loader(move || async move { Ok::<_, BoxError>(data) })
        .build()
        .unwrap()
}

fn mocks_without_loader(life_time_millis: Option<u64>) -> ConfigProvider<Vec<String>> {
    ConfigProvider::builder("mocks")
        .life_time_millis(life_time_millis)
        .build()
        .unwrap()
}

fn strings(data: &[&str]) -> Vec<String> {
    data.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_first_request_loads_from_cloud() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    let reply = stash.retrieve(mocks_with(&["a", "b"])).await.unwrap().into_reply().unwrap();

    assert_eq!(reply.source(), Source::Cloud);
    assert_eq!(reply.data(), &strings(&["a", "b"]));
    assert!(!reply.is_encrypted());
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    stash.retrieve(mocks_with(&["a", "b"])).await.unwrap();
    let reply = stash.retrieve(mocks_with(&["c"])).await.unwrap().into_reply().unwrap();

    assert_ne!(reply.source(), Source::Cloud);
    assert_eq!(reply.data(), &strings(&["a", "b"]));
}

#[tokio::test]
async fn test_restart_serves_from_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    stash(&temp_dir, &clock, |_| {})
        .retrieve(mocks_with(&["a"]))
        .await
        .unwrap();

    let restarted = stash(&temp_dir, &clock, |_| {});
    let reply = restarted
        .retrieve(mocks_without_loader(None))
        .await
        .unwrap()
        .into_reply()
        .unwrap();
    assert_eq!(reply.source(), Source::Persistence);

    let reply = restarted
        .retrieve(mocks_without_loader(None))
        .await
        .unwrap()
        .into_reply()
        .unwrap();
    assert_eq!(reply.source(), Source::Memory);
}

#[tokio::test]
async fn test_forced_eviction_always_reaches_the_loader() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    for round in 0..3 {
        let config = ConfigProvider::<Vec<String>>::builder("mocks")
            .evict(EvictScope::Provider)
            .loader(move || async move { Ok::<_, BoxError>(vec![round.to_string()]) })
            .build()
            .unwrap();
        let reply = stash.retrieve(config).await.unwrap().into_reply().unwrap();

        assert_eq!(reply.source(), Source::Cloud);
        assert_eq!(reply.data(), &vec![round.to_string()]);
    }
}

#[tokio::test]
async fn test_forced_dynamic_key_eviction_leaves_other_keys() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    for page in ["1", "2"] {
        let config = ConfigProvider::<String>::builder("pages")
            .dynamic_key(page)
            .loader(move || async move { Ok::<_, BoxError>(format!("page {}", page)) })
            .build()
            .unwrap();
        stash.retrieve(config).await.unwrap();
    }

    let config = ConfigProvider::<String>::builder("pages")
        .dynamic_key("1")
        .evict(EvictScope::DynamicKey)
        .loader(|| async { Ok::<_, BoxError>("page 1 again".to_string()) })
        .build()
        .unwrap();
    stash.retrieve(config).await.unwrap();

    let config = ConfigProvider::<String>::builder("pages").dynamic_key("2").build().unwrap();
    let reply = stash.retrieve(config).await.unwrap().into_reply().unwrap();
    assert_eq!(reply.data(), "page 2");
    assert_eq!(reply.source(), Source::Memory);
}

#[tokio::test]
async fn test_no_loader_and_nothing_cached_fails() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |s| {
        s.use_expired_data_if_loader_not_available = true;
    });

    let err = stash.retrieve(mocks_without_loader(None)).await.unwrap_err();
    assert!(matches!(err, CacheError::LoaderUnavailable { .. }));
}

#[tokio::test]
async fn test_expired_data_served_when_loader_missing() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(10_000));
    let stash = stash(&temp_dir, &clock, |s| {
        s.use_expired_data_if_loader_not_available = true;
    });

    let config = ConfigProvider::<Vec<String>>::builder("mocks")
        .life_time_millis(Some(1_000))
        .loader(|| async { Ok::<_, BoxError>(vec!["stale".to_string()]) })
        .build()
        .unwrap();
    stash.retrieve(config).await.unwrap();
    clock.advance(1_001);

    let reply = stash
        .retrieve(mocks_without_loader(Some(1_000)))
        .await
        .unwrap()
        .into_reply()
        .unwrap();
    assert_eq!(reply.data(), &strings(&["stale"]));
    assert_eq!(reply.source(), Source::Memory);
    assert_eq!(stash.stats().fallbacks_served, 1);

    // The expired record was evicted while being served
    let err = stash.retrieve(mocks_without_loader(Some(1_000))).await.unwrap_err();
    assert!(matches!(err, CacheError::LoaderUnavailable { .. }));
}

#[tokio::test]
async fn test_expired_data_after_restart_keeps_persistence_source() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    let config = ConfigProvider::<Vec<String>>::builder("mocks")
        .life_time_millis(Some(1_000))
        .loader(|| async { Ok::<_, BoxError>(vec!["stale".to_string()]) })
        .build()
        .unwrap();
    stash(&temp_dir, &clock, |_| {}).retrieve(config).await.unwrap();

    // Not yet expired when the restarted engine sweeps at startup
    let restarted = stash(&temp_dir, &clock, |s| {
        s.use_expired_data_if_loader_not_available = true;
    });
    restarted.start().await.unwrap();
    clock.advance(5_000);

    let config = ConfigProvider::<Vec<String>>::builder("mocks")
        .life_time_millis(Some(1_000))
        .loader(|| async { Err::<Vec<String>, BoxError>("network down".into()) })
        .build()
        .unwrap();
    let reply = restarted.retrieve(config).await.unwrap().into_reply().unwrap();
    assert_eq!(reply.source(), Source::Persistence);
    assert_eq!(reply.data(), &strings(&["stale"]));
}

#[tokio::test]
async fn test_loader_failure_is_typed() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    let config = ConfigProvider::<u32>::builder("flaky")
        .loader(|| async { Err::<u32, BoxError>("timeout".into()) })
        .build()
        .unwrap();
    let err = stash.retrieve(config).await.unwrap_err();

    match err {
        CacheError::LoaderFailed { provider_key, source } => {
            assert_eq!(provider_key, "flaky");
            assert_eq!(source.to_string(), "timeout");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_encrypted_provider_round_trips_through_disk() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let with_key = |s: &mut CacheSettings| s.encryption_key = Some("passphrase".into());

    let config = ConfigProvider::<String>::builder("secrets")
        .encrypted(true)
        .loader(|| async { Ok::<_, BoxError>("token".to_string()) })
        .build()
        .unwrap();
    stash(&temp_dir, &clock, with_key).retrieve(config).await.unwrap();

    let raw = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|entry| std::fs::read(entry.unwrap().path()).unwrap())
        .collect::<Vec<_>>();
    assert!(raw.iter().all(|bytes| !String::from_utf8_lossy(bytes).contains("token")));

    let config = ConfigProvider::<String>::builder("secrets").encrypted(true).build().unwrap();
    let reply = stash(&temp_dir, &clock, with_key)
        .retrieve(config)
        .await
        .unwrap()
        .into_reply()
        .unwrap();
    assert_eq!(reply.data(), "token");
    assert_eq!(reply.source(), Source::Persistence);
    assert!(reply.is_encrypted());

    // A different passphrase cannot read the record and falls through to a miss
    let config = ConfigProvider::<String>::builder("secrets").encrypted(true).build().unwrap();
    let err = stash(&temp_dir, &clock, |s| s.encryption_key = Some("other".into()))
        .retrieve(config)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::LoaderUnavailable { .. }));
}

#[tokio::test]
async fn test_raw_data_response_and_explicit_eviction() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    let config = ConfigProvider::<u64>::builder("count")
        .detailed_response(false)
        .loader(|| async { Ok::<_, BoxError>(42) })
        .build()
        .unwrap();
    assert_eq!(stash.retrieve(config).await.unwrap(), Response::Data(42));

    stash
        .evict(&KeyScope::Provider { provider_key: "count" })
        .await
        .unwrap();
    let config = ConfigProvider::<u64>::builder("count").build().unwrap();
    assert!(stash.retrieve(config).await.is_err());
}

#[tokio::test]
async fn test_cached_data_is_isolated_from_callers() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});

    let mut first = stash.retrieve(mocks_with(&["a"])).await.unwrap().into_data();
    first.push("mutated".to_string());

    let second = stash.retrieve(mocks_without_loader(None)).await.unwrap().into_data();
    assert_eq!(second, strings(&["a"]));
}

#[tokio::test]
async fn test_cancelled_loader_leaves_nothing_cached() {
    let temp_dir = TempDir::new().unwrap();
    let stash = stash(&temp_dir, &Arc::new(ManualClock::new(0)), |_| {});
    stash.start().await.unwrap();

    let slow = ConfigProvider::<Vec<String>>::builder("mocks")
        .loader(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, BoxError>(strings(&["late"]))
        })
        .build()
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(50), stash.retrieve(slow)).await;
    assert!(outcome.is_err());

    assert!(stash.two_layers().memory().keys().is_empty());
    assert!(stash.two_layers().persistence().all_keys().await.unwrap().is_empty());
    assert!(matches!(
        stash.retrieve(mocks_without_loader(None)).await,
        Err(CacheError::LoaderUnavailable { .. })
    ));
}
