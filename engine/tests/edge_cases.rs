//! Edge case tests for tandem-engine
//!
//! These tests cover boundary conditions and unusual inputs against the
//! storage tiers, the conflict rule and backups.

use std::sync::Arc;

use chrono::NaiveDate;
use tandem_engine::{
    resolve, AnalyticsDay, BackupManager, BackupSnapshot, Challenge, EntityKind, Error,
    LearningProgress, ManualClock, MemoryStore, OfflineQueue, OfflineQueueItem, Payload, Record,
    RecordKey, Resolution, SqliteStore, SrsItem, TieredStore, UserProfile,
};

fn sqlite_tiers() -> TieredStore {
    let local = SqliteStore::open_in_memory().unwrap();
    TieredStore::new(Some(Arc::new(local)), Arc::new(MemoryStore::new()))
}

fn user(id: &str, name: &str) -> Record {
    Record::new(
        id,
        "learner-1",
        Payload::User(UserProfile::new(name, "en", "es")),
        1000,
    )
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_strings() {
    let store = sqlite_tiers();

    let names = vec![
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
    ];

    for (i, name) in names.iter().enumerate() {
        let record = user(&format!("u-{i}"), name);
        store.put(&record).unwrap();

        let stored = store.get(&record.key()).unwrap().unwrap();
        assert_eq!(stored, record, "failed for: {name}");
    }
}

#[test]
fn very_long_strings() {
    let store = sqlite_tiers();

    // 1MB term
    let term = "x".repeat(1024 * 1024);
    let record = Record::new(
        "s-1",
        "learner-1",
        Payload::SrsItem(SrsItem::new(term.clone(), "long", "es", 0)),
        1000,
    );
    store.put(&record).unwrap();

    let stored = store.get(&record.key()).unwrap().unwrap();
    match stored.payload {
        Payload::SrsItem(item) => assert_eq!(item.term.len(), 1024 * 1024),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn blank_identifiers_rejected() {
    let store = sqlite_tiers();

    let blank_id = user("   ", "Ana");
    assert!(matches!(store.put(&blank_id), Err(Error::InvalidRecord(_))));

    let mut no_owner = user("u-1", "Ana");
    no_owner.owner_id = String::new();
    assert!(matches!(store.put(&no_owner), Err(Error::InvalidRecord(_))));

    assert!(store.all().unwrap().is_empty());
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn counter_boundaries() {
    let store = sqlite_tiers();

    for (i, xp) in [0u64, 1, u32::MAX as u64, u64::MAX].iter().enumerate() {
        let mut progress = LearningProgress::new("es");
        progress.xp = *xp;
        let record = Record::new(format!("p-{i}"), "learner-1", Payload::Progress(progress), 1000);
        store.put(&record).unwrap();
        assert_eq!(store.get(&record.key()).unwrap().unwrap(), record);
    }
}

#[test]
fn accuracy_bounds() {
    let mut progress = LearningProgress::new("es");
    progress.accuracy = 1.0;
    assert!(Payload::Progress(progress.clone()).validate().is_ok());

    progress.accuracy = 1.0001;
    assert!(matches!(
        Payload::Progress(progress.clone()).validate(),
        Err(Error::InvalidPayload { .. })
    ));

    progress.accuracy = f64::NAN;
    assert!(Payload::Progress(progress).validate().is_err());
}

#[test]
fn full_day_of_study() {
    let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let mut day = AnalyticsDay::new(date);

    day.minutes_studied = 24 * 60;
    assert!(Payload::Analytics(day.clone()).validate().is_ok());

    day.minutes_studied += 1;
    assert!(Payload::Analytics(day).validate().is_err());
}

#[test]
fn completed_challenge_must_reach_goal() {
    let mut challenge = Challenge::new("Ten lessons", 10, 5_000);
    challenge.completed = true;
    challenge.current = 9;
    assert!(Payload::Challenge(challenge.clone()).validate().is_err());

    challenge.current = 12;
    assert!(Payload::Challenge(challenge).validate().is_ok());
}

// ============================================================================
// Conflict Edge Cases
// ============================================================================

#[test]
fn identical_records_are_in_sync() {
    let record = user("u-1", "Ana");
    assert_eq!(resolve(Some(&record), Some(&record)), Resolution::InSync);
    assert_eq!(resolve(None, None), Resolution::InSync);
}

#[test]
fn timestamp_tie_prefers_remote() {
    let local = user("u-1", "Ana");
    let remote = user("u-1", "Ana María");

    let resolution = resolve(Some(&local), Some(&remote));
    assert!(matches!(resolution, Resolution::Ambiguous { .. }));
    assert_eq!(resolution.winner(), Some(&remote));
}

#[test]
fn missing_side_adopts_the_other() {
    let record = user("u-1", "Ana");
    assert_eq!(
        resolve(Some(&record), None),
        Resolution::PushLocal(record.clone())
    );
    assert_eq!(resolve(None, Some(&record)), Resolution::PullRemote(record));
}

// ============================================================================
// Key Edge Cases
// ============================================================================

#[test]
fn ids_with_special_characters() {
    let store = sqlite_tiers();

    let ids = vec![
        "id-with-dashes",
        "id_with_underscores",
        "id.with.dots",
        "id:with:colons",
        "id/with/slashes",
        "id with spaces",
        "id'with\"quotes",
        "id%with_like%wildcards",
    ];

    for id in ids {
        let record = user(id, "Ana");
        store.put(&record).unwrap();
        assert_eq!(store.get(&record.key()).unwrap().unwrap().id, id);

        // Keys round-trip through their string form.
        let parsed: RecordKey = record.key().to_string().parse().unwrap();
        assert_eq!(parsed, record.key());
    }

    assert_eq!(store.scan(EntityKind::User, "learner-1").unwrap().len(), 8);
}

#[test]
fn malformed_keys_rejected() {
    for raw in ["", "user", "user:", "planet:p-1"] {
        assert!(raw.parse::<RecordKey>().is_err(), "{raw:?} should not parse");
    }
}

// ============================================================================
// Backup Edge Cases
// ============================================================================

#[test]
fn backup_of_empty_store() {
    let store = Arc::new(sqlite_tiers());
    let backups = BackupManager::new(store.clone(), Arc::new(ManualClock::new(5_000)));

    let snapshot = backups.create().unwrap();
    assert_eq!(snapshot.record_count(), 0);
    assert_eq!(snapshot.created_at, 5_000);

    store.put(&user("u-1", "Ana")).unwrap();
    let summary = backups.restore(&snapshot).unwrap();
    assert!(summary.restored.is_empty());
    assert_eq!(summary.removed, vec![RecordKey::new(EntityKind::User, "u-1")]);
    assert!(store.all().unwrap().is_empty());
}

#[test]
fn backup_json_rejects_garbage() {
    assert!(matches!(
        BackupSnapshot::from_json("not json"),
        Err(Error::BackupInvalid(_))
    ));
    assert!(matches!(
        BackupSnapshot::from_json("{\"formatVersion\":\"1\"}"),
        Err(Error::BackupInvalid(_))
    ));
}

// ============================================================================
// Queue Edge Cases
// ============================================================================

#[test]
fn many_pending_operations() {
    let store = Arc::new(sqlite_tiers());
    let clock = Arc::new(ManualClock::new(1_000));
    let queue = OfflineQueue::load(store.clone(), clock.clone(), 3).unwrap();

    for i in 0..1000u64 {
        let mut progress = LearningProgress::new("es");
        progress.xp = i;
        let record = Record::new("p-es", "learner-1", Payload::Progress(progress), 1000 + i);
        queue.enqueue(OfflineQueueItem::save(record, 1000 + i)).unwrap();
    }

    assert_eq!(queue.len(), 1000);

    // Reloading keeps insertion order.
    let reloaded = OfflineQueue::load(store, clock, 3).unwrap();
    let items = reloaded.items();
    assert_eq!(items.len(), 1000);
    assert!(items
        .windows(2)
        .all(|pair| pair[0].enqueued_at < pair[1].enqueued_at));
}
