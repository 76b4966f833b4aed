//! Storage contract suite.
//!
//! Every test body runs against the in-memory backend, against `SQLite`
//! (`sqlite::memory:`), and against each of them behind the in-process
//! cache tier, so the implementations are checked to be substitutable.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use questvault_db::{
    AccountPolicy, BatchConfig, BattleFilter, CacheTtls, CachedBackend, CredentialHasher, GameDataService,
    MemoryBackend, MemoryCache, SqliteBackend, SqliteConfig, StorageBackend, StoreError, WriteCoordinator,
};
use questvault_types::{
    ActionEndReason, ActionTarget, ActionType, BattleId, BattleQuery, BattleRecord, BattleStatus, BattleType,
    MAX_TEAM_SIZE, NewUser, OfflineData, Player, PlayerId, Team, TeamId, UserCharacterLink,
};

type Backend = Arc<dyn StorageBackend>;

fn policy() -> AccountPolicy {
    AccountPolicy::new(CredentialHasher::fast().expect("argon2 parameters"))
        .with_max_failed_logins(3)
        .with_lockout(Duration::minutes(15))
}

fn memory() -> Backend {
    Arc::new(MemoryBackend::new(policy()))
}

async fn sqlite() -> Backend {
    let backend = SqliteBackend::connect(&SqliteConfig::new("sqlite::memory:"), policy())
        .await
        .expect("in-memory SQLite");
    Arc::new(backend)
}

fn cached(inner: Backend) -> Backend {
    Arc::new(CachedBackend::new(inner, Arc::new(MemoryCache::default()), CacheTtls::default()))
}

async fn run<F, Fut>(body: F)
where
    F: Fn(Backend) -> Fut,
    Fut: Future<Output = ()>,
{
    body(memory()).await;
    body(sqlite().await).await;
    body(cached(memory())).await;
    body(cached(sqlite().await)).await;
}

/// Generates one `#[tokio::test]` per body that runs it on every backend.
macro_rules! contract_test {
    ($name:ident, $body:ident) => {
        #[tokio::test]
        async fn $name() {
            run($body).await;
        }
    };
}

/// Like `contract_test!`, on a multi-threaded runtime so spawned tasks
/// really run in parallel.
macro_rules! concurrent_contract_test {
    ($name:ident, $body:ident) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn $name() {
            run($body).await;
        }
    };
}

// =============================================================================
// Users
// =============================================================================

async fn uniqueness_body(store: Backend) {
    let alice = store
        .create_user(NewUser::new("alice", "alice@example.com"), "pw123")
        .await
        .expect("create alice");

    let same_name = store
        .create_user(NewUser::new("ALICE", "other@example.com"), "pw")
        .await;
    assert!(matches!(same_name, Err(StoreError::Conflict(_))), "{}", store.kind());

    let same_email = store
        .create_user(NewUser::new("alice2", "Alice@Example.COM"), "pw")
        .await;
    assert!(matches!(same_email, Err(StoreError::Conflict(_))), "{}", store.kind());

    let found = store.get_user_by_username("aLiCe").await.expect("lookup");
    assert_eq!(found.id, alice.id);
    let found = store.get_user_by_email("ALICE@example.com").await.expect("lookup");
    assert_eq!(found.id, alice.id);

    let mut renamed = store.create_user(NewUser::new("bob", "bob@example.com"), "pw").await.unwrap();
    renamed.username = String::from("Alice");
    assert!(matches!(store.update_user(renamed).await, Err(StoreError::Conflict(_))));
}
contract_test!(usernames_and_emails_are_unique_ignoring_case, uniqueness_body);

async fn password_body(store: Backend) {
    let user = store
        .create_user(NewUser::new("carol", "carol@example.com"), "hunter2")
        .await
        .unwrap();
    assert_ne!(user.password_hash, "hunter2");
    assert!(store.validate_password(&user.id, "hunter2").await.unwrap());
    assert!(!store.validate_password(&user.id, "hunter3").await.unwrap());

    for _ in 0..3 {
        store.record_login(&user.id, false, Some("10.1.1.1")).await.unwrap();
    }
    let locked = store.get_user(&user.id).await.unwrap();
    assert!(locked.is_locked_at(Utc::now()));
    assert_eq!(locked.failed_login_attempts, 3);
    assert!(!store.validate_password(&user.id, "hunter2").await.unwrap());

    assert!(store.unlock_user(&user.id).await.unwrap());
    assert!(store.validate_password(&user.id, "hunter2").await.unwrap());
    let after = store.record_login(&user.id, true, None).await.unwrap();
    assert_eq!(after.failed_login_attempts, 0);
    assert!(after.last_login_at.is_some());
    assert_eq!(after.login_history.len(), 4);
}
contract_test!(failed_logins_lock_until_unlocked, password_body);

async fn delete_user_body(store: Backend) {
    let user = store
        .create_user(NewUser::new("dave", "dave@example.com"), "pw")
        .await
        .unwrap();
    store
        .create_user_character_link(UserCharacterLink::new(user.id.clone(), PlayerId::from("dave-1"), "Dave", true))
        .await
        .unwrap();

    assert!(store.delete_user(&user.id).await.unwrap());
    assert!(!store.delete_user(&user.id).await.unwrap());
    assert!(store.get_user(&user.id).await.is_err_and(|e| e.is_not_found()));
    assert!(store.get_character_owner(&PlayerId::from("dave-1")).await.is_err());

    // The name is free again.
    assert!(store.create_user(NewUser::new("Dave", "dave@example.com"), "pw").await.is_ok());
}
contract_test!(deleting_a_user_frees_name_and_characters, delete_user_body);

// =============================================================================
// End-to-end scenario
// =============================================================================

async fn scenario_body(store: Backend) {
    let user = store
        .create_user(NewUser::new("alice", "alice@example.com"), "pw123")
        .await
        .expect("create alice");
    let char_1 = PlayerId::from("char-1");

    store
        .create_user_character_link(UserCharacterLink::new(user.id.clone(), char_1.clone(), "Alice", true))
        .await
        .expect("link");

    let mut player = Player::new(char_1.clone(), "Alice");
    player.user_id = Some(user.id.clone());
    store.save_player(player.clone()).await.expect("save level 1");

    let links = store.get_user_characters(&user.id).await.unwrap();
    assert_eq!(links.len(), 1, "{}", store.kind());
    assert!(links[0].is_default);
    assert_eq!(links[0].character_id, char_1);
    assert_eq!(store.get_character_owner(&char_1).await.unwrap(), user.id);

    player.level = 2;
    store.save_player(player).await.expect("save level 2");
    assert_eq!(store.get_player(&char_1).await.unwrap().level, 2);

    let a = ActionTarget::start(char_1.clone(), ActionType::Gathering, "resource_node", "oak-tree", 30_000);
    let b = ActionTarget::start(char_1.clone(), ActionType::Crafting, "recipe", "oak-plank", 10_000);
    store.save_action_target(a.clone()).await.unwrap();
    store.save_action_target(b.clone()).await.unwrap();

    let current = store.get_current_action_target(&char_1).await.unwrap();
    assert_eq!(current.map(|t| t.id), Some(b.id.clone()));

    let history = store.get_action_history(&char_1, 10).await.unwrap();
    let old = history.iter().find(|t| t.id == a.id).expect("superseded target kept");
    assert!(old.is_completed);
    assert_eq!(old.end_reason, Some(ActionEndReason::Superseded));
    assert_eq!(history.iter().filter(|t| !t.is_completed).count(), 1);
}
contract_test!(alice_end_to_end, scenario_body);

// =============================================================================
// Players
// =============================================================================

async fn progression_body(store: Backend) {
    let id = PlayerId::from("hero");
    let mut hero = Player::new(id.clone(), "Hero");
    hero.level = 5;
    hero.experience = 100;
    store.save_player(hero.clone()).await.unwrap();

    hero.level = 4;
    assert!(matches!(store.save_player(hero.clone()).await, Err(StoreError::Validation(_))));
    hero.level = 5;
    hero.experience = 50;
    assert!(matches!(store.save_player(hero).await, Err(StoreError::Validation(_))));
    assert_eq!(store.get_player(&id).await.unwrap().experience, 100);

    let reset = store.reset_player_progress(&id).await.unwrap();
    assert_eq!((reset.level, reset.experience), (1, 0));
    assert_eq!(store.get_player(&id).await.unwrap().level, 1);
}
contract_test!(progression_only_moves_back_through_reset, progression_body);

async fn batch_body(store: Backend) {
    let mut veteran = Player::new(PlayerId::from("veteran"), "Veteran");
    veteran.level = 10;
    store.save_player(veteran.clone()).await.unwrap();

    let mut demoted = veteran;
    demoted.level = 3;
    let mut broken = Player::new(PlayerId::from("broken"), "Broken");
    broken.health = broken.max_health.saturating_add(1);

    let batch = vec![
        Player::new(PlayerId::from("p-1"), "One"),
        demoted,
        Player::new(PlayerId::from("p-2"), "Two"),
        broken,
        Player::new(PlayerId::from("p-3"), "Three"),
    ];
    let result = store.batch_save_players(batch).await.unwrap();
    assert_eq!(result.success_count, 3, "{}", store.kind());
    assert_eq!(result.error_count, 2);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().any(|e| e.starts_with("veteran")));
    assert!(result.errors.iter().any(|e| e.starts_with("broken")));

    for id in ["p-1", "p-2", "p-3"] {
        assert!(store.get_player(&PlayerId::from(id)).await.is_ok());
    }
    assert_eq!(store.get_player(&PlayerId::from("veteran")).await.unwrap().level, 10);
    assert!(store.get_player(&PlayerId::from("broken")).await.is_err());
}
contract_test!(batch_reports_each_failure_and_keeps_the_rest, batch_body);

async fn search_body(store: Backend) {
    let mut online = Player::new(PlayerId::from("s-1"), "Stormblade");
    online.is_online = true;
    store.save_player(online).await.unwrap();
    store.save_player(Player::new(PlayerId::from("s-2"), "Stonefist")).await.unwrap();
    store.save_player(Player::new(PlayerId::from("s-3"), "Ember")).await.unwrap();

    let found = store.search_players("ST", 10).await.unwrap();
    let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["Stonefist", "Stormblade"]);
    assert_eq!(store.search_players("st", 1).await.unwrap().len(), 1);

    let online = store.get_online_players().await.unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].id, PlayerId::from("s-1"));
}
contract_test!(search_and_online_listing, search_body);

// =============================================================================
// Teams
// =============================================================================

async fn team_body(store: Backend) {
    let alice = PlayerId::from("alice");
    let team_id = TeamId::from("team-1");
    let team = Team::new(team_id.clone(), "Vanguard", alice.clone());
    assert_eq!(team.member_ids, vec![alice.clone()]);
    store.save_team(team.clone()).await.unwrap();

    let mut oversized = team;
    for n in 0..MAX_TEAM_SIZE {
        oversized.member_ids.push(PlayerId::from(format!("extra-{n}")));
    }
    let rejected = store.save_team(oversized).await;
    assert!(matches!(rejected, Err(StoreError::Validation(_))), "{}", store.kind());

    let stored = store.get_team(&team_id).await.unwrap();
    assert_eq!(stored.member_ids.len(), 1);
    assert_eq!(
        store.get_team_by_captain(&alice).await.unwrap().map(|t| t.id),
        Some(team_id.clone())
    );
    assert_eq!(store.get_team_by_player(&alice).await.unwrap().map(|t| t.id), Some(team_id));
}
contract_test!(team_size_limit_is_enforced, team_body);

// =============================================================================
// Action targets
// =============================================================================

async fn action_body(store: Backend) {
    let id = PlayerId::from("worker");
    let first = ActionTarget::start(id.clone(), ActionType::Combat, "enemy", "wolf", 5_000);
    store.save_action_target(first.clone()).await.unwrap();

    let done = store.complete_action_target(&first.id).await.unwrap();
    assert!(done.is_completed);
    assert_eq!(done.end_reason, Some(ActionEndReason::Completed));
    assert!(store.get_current_action_target(&id).await.unwrap().is_none());

    let second = ActionTarget::start(id.clone(), ActionType::Training, "attribute", "strength", 60_000);
    store.save_action_target(second).await.unwrap();
    assert!(store.cancel_action_target(&id).await.unwrap());
    assert!(!store.cancel_action_target(&id).await.unwrap());
    assert!(store.get_current_action_target(&id).await.unwrap().is_none());

    let history = store.get_action_history(&id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|t| t.is_completed));
}
contract_test!(actions_complete_and_cancel, action_body);

// =============================================================================
// Battles
// =============================================================================

async fn battle_body(store: Backend) {
    let hero = PlayerId::from("hero");
    let mut party = BattleRecord::begin(BattleId::from("b-1"), BattleType::Party, vec![hero.clone()]);
    party.team_id = Some(TeamId::from("t-1"));
    store.save_battle_record(party).await.unwrap();
    store
        .save_battle_record(BattleRecord::begin(BattleId::from("b-2"), BattleType::Solo, vec![hero.clone()]))
        .await
        .unwrap();

    assert_eq!(store.get_active_battles().await.unwrap().len(), 2);

    let ended = store
        .end_battle_record(&BattleId::from("b-1"), BattleStatus::Completed, serde_json::json!({"xp": 40}))
        .await
        .unwrap();
    assert_eq!(ended.status, BattleStatus::Completed);
    assert!(ended.ended_at.is_some() && ended.duration_ms.is_some());

    let again = store
        .end_battle_record(&BattleId::from("b-1"), BattleStatus::Aborted, serde_json::Value::Null)
        .await;
    assert!(matches!(again, Err(StoreError::Conflict(_))));
    let not_terminal = store
        .end_battle_record(&BattleId::from("b-2"), BattleStatus::InProgress, serde_json::Value::Null)
        .await;
    assert!(matches!(not_terminal, Err(StoreError::Validation(_))));

    let mine = store
        .get_battle_history(&BattleFilter::Player(hero), &BattleQuery::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    let team = store
        .get_battle_history(&BattleFilter::Team(TeamId::from("t-1")), &BattleQuery::default())
        .await
        .unwrap();
    assert_eq!(team.len(), 1);
    assert_eq!(store.get_battle_record(&BattleId::from("b-1")).await.unwrap().status, BattleStatus::Completed);
}
contract_test!(battles_end_once, battle_body);

// =============================================================================
// Offline data and retention
// =============================================================================

async fn offline_body(store: Backend) {
    let id = PlayerId::from("idler");
    let first = store
        .save_offline_data(OfflineData::new(id.clone(), "gathering_rewards", serde_json::json!({"ore": 3})))
        .await
        .unwrap();
    assert_eq!(first.version, 1);
    let second = store
        .save_offline_data(OfflineData::new(id.clone(), "xp", serde_json::json!({"xp": 12})))
        .await
        .unwrap();

    let mut edited = first.clone();
    edited.payload = serde_json::json!({"ore": 4});
    let edited = store.save_offline_data(edited).await.unwrap();
    assert_eq!(edited.version, 2);

    let unsynced = store.get_unsynced_offline_data(&id).await.unwrap();
    assert_eq!(unsynced.len(), 2);

    assert_eq!(store.mark_offline_data_synced(&[first.id.clone()]).await.unwrap(), 1);
    assert_eq!(store.mark_offline_data_synced(&[first.id.clone()]).await.unwrap(), 0);
    let remaining = store.get_unsynced_offline_data(&id).await.unwrap();
    assert_eq!(remaining.iter().map(|d| d.id.clone()).collect::<Vec<_>>(), vec![second.id]);

    let cutoff = Utc::now() + Duration::minutes(1);
    assert_eq!(store.cleanup_synced_offline_data(cutoff).await.unwrap(), 1, "{}", store.kind());
    assert_eq!(store.cleanup_synced_offline_data(cutoff).await.unwrap(), 0);
    assert_eq!(store.get_storage_stats().await.unwrap().total_offline_data, 1);
}
contract_test!(offline_retention_is_idempotent, offline_body);

async fn history_cleanup_body(store: Backend) {
    let id = PlayerId::from("veteran");
    let old = ActionTarget::start(id.clone(), ActionType::Exploration, "zone", "caves", 1_000);
    store.save_action_target(old.clone()).await.unwrap();
    store.complete_action_target(&old.id).await.unwrap();
    let live = ActionTarget::start(id.clone(), ActionType::Gathering, "resource_node", "iron", 1_000);
    store.save_action_target(live).await.unwrap();

    store
        .save_battle_record(BattleRecord::begin(BattleId::from("old"), BattleType::Solo, vec![id.clone()]))
        .await
        .unwrap();
    store
        .end_battle_record(&BattleId::from("old"), BattleStatus::Aborted, serde_json::Value::Null)
        .await
        .unwrap();
    store
        .save_battle_record(BattleRecord::begin(BattleId::from("live"), BattleType::Solo, vec![id.clone()]))
        .await
        .unwrap();

    let cutoff = Utc::now() + Duration::minutes(1);
    assert_eq!(store.cleanup_action_history(cutoff).await.unwrap(), 1);
    assert_eq!(store.cleanup_action_history(cutoff).await.unwrap(), 0);
    assert!(store.get_current_action_target(&id).await.unwrap().is_some());

    assert_eq!(store.cleanup_battle_records(cutoff).await.unwrap(), 1);
    assert_eq!(store.cleanup_battle_records(cutoff).await.unwrap(), 0);
    assert!(store.get_battle_record(&BattleId::from("old")).await.is_err_and(|e| e.is_not_found()));
    assert!(store.get_battle_record(&BattleId::from("live")).await.is_ok());
}
contract_test!(history_retention_keeps_live_rows, history_cleanup_body);

// =============================================================================
// Diagnostics and maintenance
// =============================================================================

async fn stats_body(store: Backend) {
    assert!(store.health_check().await.unwrap());
    let user = store
        .create_user(NewUser::new("erin", "erin@example.com"), "pw")
        .await
        .unwrap();
    store.lock_user(&user.id, None).await.unwrap();
    store.save_player(Player::new(PlayerId::from("erin-1"), "Erin")).await.unwrap();
    store.save_team(Team::new(TeamId::from("solo"), "Solo", PlayerId::from("erin-1"))).await.unwrap();

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.backend, store.kind());
    assert_eq!(stats.total_users, 1);
    assert_eq!(stats.locked_users, 1);
    assert_eq!(stats.total_players, 1);
    assert_eq!(stats.active_teams, 1);

    store.optimize().await.unwrap();
    store.rebuild_indexes().await.unwrap();
    store.compact().await.unwrap();
    assert_eq!(store.get_user_by_username("ERIN").await.unwrap().id, user.id);
}
contract_test!(stats_and_maintenance_keep_lookups_working, stats_body);

async fn backup_body(store: Backend) {
    store.save_player(Player::new(PlayerId::from("kept"), "Kept")).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = store.create_backup(dir.path()).await.unwrap();
    assert!(path.starts_with(dir.path()));
    assert!(std::fs::metadata(&path).is_ok_and(|m| m.len() > 0));
}
contract_test!(backups_land_in_the_directory, backup_body);

// =============================================================================
// Concurrency
// =============================================================================

async fn parallel_signup_body(store: Backend) {
    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .create_user(NewUser::new("racer", &format!("racer{n}@example.com")), "pw")
                    .await
            })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(matches!(e, StoreError::Conflict(_)), "{}: {e}", store.kind()),
        }
    }
    assert_eq!(created, 1, "{}", store.kind());
    assert!(store.get_user_by_username("RACER").await.is_ok());
}
concurrent_contract_test!(parallel_signups_for_one_name_admit_exactly_one, parallel_signup_body);

async fn parallel_saves_body(store: Backend) {
    let id = PlayerId::from("contested");
    store.save_player(Player::new(id.clone(), "writer-0")).await.unwrap();

    let tasks: Vec<_> = (1..=16u64)
        .map(|n| {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let mut player = Player::new(id, &format!("writer-{n}"));
                player.gold = n;
                store.save_player(player).await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Whole-entity last-writer-wins: the survivor is one writer's value, never a mix.
    let stored = store.get_player(&id).await.unwrap();
    assert!((1..=16).contains(&stored.gold), "{}", store.kind());
    assert_eq!(stored.name, format!("writer-{}", stored.gold), "{}", store.kind());
}
concurrent_contract_test!(parallel_saves_to_one_player_keep_a_whole_value, parallel_saves_body);

async fn cache_race(inner: Backend) {
    let tier = cached(Arc::clone(&inner));
    let id = PlayerId::from("hot");
    tier.save_player(Player::new(id.clone(), "Hot")).await.unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let tier = Arc::clone(&tier);
            let id = id.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = tier.get_player(&id).await;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    let writer = {
        let tier = Arc::clone(&tier);
        let id = id.clone();
        tokio::spawn(async move {
            for gold in 1..=50u64 {
                let mut player = Player::new(id.clone(), "Hot");
                player.gold = gold;
                tier.save_player(player).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    let authoritative = inner.get_player(&id).await.unwrap();
    assert_eq!(authoritative.gold, 50);
    assert_eq!(tier.get_player(&id).await.unwrap().gold, 50, "{}", inner.kind());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cached_reads_racing_writes_settle_on_the_last_write() {
    cache_race(memory()).await;
    cache_race(sqlite().await).await;
}

async fn direct_vs_queued(store: Backend) {
    let writes = Arc::new(WriteCoordinator::new(Arc::clone(&store), BatchConfig::default()));
    let service = GameDataService::new(Arc::clone(&store)).with_writes(Arc::clone(&writes));
    let id = PlayerId::from("raced");

    for round in 1..=20u64 {
        let mut queued = Player::new(id.clone(), "Raced");
        queued.gold = round * 2;
        assert!(service.queue_player_save(queued.clone()).await.success);

        let mut direct = queued;
        direct.gold = round * 2 + 1;
        let flushing = {
            let writes = Arc::clone(&writes);
            tokio::spawn(async move { writes.flush_all().await })
        };
        let saving = {
            let service = service.clone();
            tokio::spawn(async move { service.save_player(direct).await })
        };
        assert!(saving.await.unwrap().success);
        let _ = flushing.await.unwrap();

        let seen = service.get_player(&id).await;
        assert_eq!(seen.data.map(|p| p.gold), Some(round * 2 + 1), "{}", store.kind());
        assert_eq!(writes.flush_all().await.total(), 0);
        assert_eq!(store.get_player(&id).await.unwrap().gold, round * 2 + 1, "{}", store.kind());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_save_racing_a_queued_flush_keeps_the_direct_value() {
    direct_vs_queued(memory()).await;
    direct_vs_queued(sqlite().await).await;
    direct_vs_queued(cached(memory())).await;
}

// =============================================================================
// Batch failures
// =============================================================================

#[tokio::test]
async fn failed_flush_is_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("flush.db").display());
    let sqlite = Arc::new(SqliteBackend::connect(&SqliteConfig::new(&url), policy()).await.unwrap());
    let store: Backend = Arc::<SqliteBackend>::clone(&sqlite);
    let writes = WriteCoordinator::new(Arc::clone(&store), BatchConfig::default());

    writes
        .save_team(Team::new(TeamId::from("t-r"), "Party", PlayerId::from("lead")))
        .await
        .unwrap();
    sqlite.close().await;

    let failed = writes.flush_all().await;
    assert_eq!(failed.success_count, 0);
    assert_eq!(failed.error_count, 1);
    assert!(failed.errors[0].starts_with("t-r: "), "{:?}", failed.errors);
    assert_eq!(writes.pending_count(), 0);

    let replay = writes.flush_all().await;
    assert_eq!(replay.total(), 0);

    let reopened = SqliteBackend::connect(&SqliteConfig::new(&url), policy()).await.unwrap();
    assert!(reopened.get_team(&TeamId::from("t-r")).await.is_err_and(|e| e.is_not_found()));
}
