//! Runtime wiring tests: configuration in, running stack out.
//!
//! The `Dragonfly` test needs a live instance:
//!
//! ```bash
//! docker run -d -p 6379:6379 docker.dragonflydb.io/dragonflydb/dragonfly
//! cargo test -p questvault-db --test runtime -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::time::Duration;

use questvault_db::{CacheStore, DragonflyCache, Runtime, StoreConfig};
use questvault_types::{NewUser, Player, PlayerId, UserCharacterLink};

fn config(yaml: &str) -> StoreConfig {
    let base = "security:\n  argon2_memory_kib: 64\n  argon2_iterations: 1\n";
    StoreConfig::parse(&format!("{base}{yaml}")).expect("valid test config")
}

#[tokio::test]
async fn in_memory_runtime_serves_and_drains() {
    let runtime = Runtime::build(&config("batch:\n  flush_interval_ms: 3600000\n"))
        .await
        .expect("build");
    runtime.start();
    let service = runtime.service();

    let alice = service
        .create_user(NewUser::new("alice", "alice@example.com"), "pw123")
        .await;
    let user_id = alice.data.expect("created").id;
    let linked = service
        .create_character_link(UserCharacterLink::new(user_id, PlayerId::from("char-1"), "Alice", true))
        .await;
    assert!(linked.success);

    let mut player = Player::new(PlayerId::from("char-1"), "Alice");
    player.level = 3;
    let queued = service.queue_player_save(player).await;
    assert!(queued.success);
    assert_eq!(runtime.writes().map(|w| w.pending_count()), Some(1));

    let report = runtime.health().await;
    assert!(report.healthy);
    assert_eq!(report.pending_writes, 1);

    let drained = runtime.shutdown().await;
    assert_eq!(drained.success_count, 1);
    assert_eq!(
        runtime.backend().get_player(&PlayerId::from("char-1")).await.map(|p| p.level).ok(),
        Some(3)
    );
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("state.json");
    let yaml = format!(
        "backend:\n  kind: in_memory\n  snapshot_path: {}\nmaintenance:\n  enabled: false\n",
        snapshot.display()
    );

    let first = Runtime::build(&config(&yaml)).await.expect("build");
    let created = first
        .service()
        .create_user(NewUser::new("bob", "bob@example.com"), "pw")
        .await;
    assert!(created.success);
    first.shutdown().await;
    assert!(snapshot.exists());

    let second = Runtime::build(&config(&yaml)).await.expect("rebuild");
    let found = second.service().get_user_by_username("BOB").await;
    assert!(found.success);
    assert!(second.service().validate_password(&found.data.unwrap().id, "pw").await.data == Some(true));
}

#[tokio::test]
async fn sqlite_runtime_with_cache_disabled() {
    let runtime = Runtime::build(&config(
        "backend:\n  kind: sqlite\n  url: \"sqlite::memory:\"\ncache:\n  enabled: false\nbatch:\n  enabled: false\n",
    ))
    .await
    .expect("build");
    assert_eq!(runtime.backend().kind(), "sqlite");
    assert!(runtime.writes().is_none());

    let report = runtime.health().await;
    assert!(report.healthy);
    assert!(report.cache.is_none());
    runtime.shutdown().await;
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance"]
async fn dragonfly_store_round_trip() {
    let store = DragonflyCache::connect("redis://localhost:6379").await.expect("connect");
    store
        .set("test:round-trip", String::from("{\"v\":1}"), Duration::from_secs(30))
        .await
        .expect("set");
    assert_eq!(store.get("test:round-trip").await.expect("get").as_deref(), Some("{\"v\":1}"));
    store.remove("test:round-trip").await.expect("remove");
    assert!(store.get("test:round-trip").await.expect("get").is_none());
}
