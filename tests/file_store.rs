use ratebudget::{
    BudgetError, BudgetManager, BudgetTable, FileStateStore, ManualClock, RateLimitInfo,
    RateState, StateStore,
};
use std::sync::Arc;

// 2024-03-15T10:30:00Z
const T0: u64 = 1_710_498_600_000;
const HOUR: u64 = 3_600_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn missing_file_loads_fresh_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStateStore::new(dir.path().join("nested/state.json"));
    let state = store.load(T0).expect("load");
    assert_eq!(state, RateState::fresh(T0));
    assert!(!store.path().exists());
}

#[test]
fn save_then_load_is_a_fixed_point() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStateStore::new(dir.path().join("state.json"));

    store
        .transaction(T0, |state| {
            ratebudget::recorder::record_request(
                state,
                "cyber-ops",
                "/v3/entries",
                Some(RateLimitInfo::from_counts(12, 1000)),
                T0,
            )
        })
        .expect("transaction");

    let first = store.load(T0 + 1000).expect("load");
    store.save(&first).expect("save");
    let second = store.load(T0 + 2000).expect("reload");
    assert_eq!(first, second);
    assert_eq!(second.daily.total, 1);
    assert_eq!(second.last_updated, T0);
}

#[test]
fn rollover_applies_on_load() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStateStore::new(dir.path().join("state.json"));
    store
        .transaction(T0, |state| {
            ratebudget::recorder::record_request(state, "landscape", "/v3/mixes", None, T0)
        })
        .expect("transaction");

    let next_hour = store.load(T0 + HOUR).expect("load");
    assert_eq!(next_hour.hourly.total, 0);
    assert_eq!(next_hour.daily.total, 1);

    let next_day = store.load(T0 + 24 * HOUR).expect("load");
    assert_eq!(next_day.daily.total, 0);
    assert!(next_day.daily.by_consumer.is_empty());
    assert_eq!(next_day.monthly.total, 1);
}

#[test]
fn legacy_file_without_breaker_is_upgraded() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(
        &path,
        r#"{
            "daily": { "date": "2024-03-15", "total": 2, "byEndpoint": {}, "byConsumer": { "cyber-ops": 2 } },
            "hourly": { "hour": "2024-03-15T10", "total": 2 },
            "monthly": { "month": "2024-03", "total": 2 },
            "lastApiRateInfo": null,
            "lastRequestTs": 0,
            "lastUpdated": 0
        }"#,
    )
    .expect("write legacy");

    let store = FileStateStore::new(&path);
    let state = store.load(T0).expect("legacy state loads");
    assert_eq!(state.daily.used_by("cyber-ops"), 2);
    assert!(!state.circuit_breaker.is_open(T0));

    store.save(&state).expect("save");
    let json = std::fs::read_to_string(&path).expect("read back");
    assert!(json.contains("\"circuitBreaker\""));
    assert!(json.contains("\"version\": 1"));
}

#[test]
fn corrupt_file_is_an_error_not_a_reset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").expect("write");

    let err = FileStateStore::new(&path).load(T0).expect_err("corrupt file");
    assert!(matches!(err, BudgetError::Corrupt { .. }));
    assert_eq!(std::fs::read_to_string(&path).expect("untouched"), "{ not json");
}

#[test]
fn unwritable_location_surfaces_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").expect("write");

    let store = FileStateStore::new(blocker.join("state.json"));
    let err = store.save(&RateState::fresh(T0)).expect_err("parent is a file");
    assert!(matches!(err, BudgetError::Io { .. }));
}

#[test]
fn concurrent_managers_do_not_lose_increments() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Arc::new(dir.path().join("shared.json"));
    let threads = 8;
    let per_thread = 25;

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                // Each thread plays an independent process: its own store handle and manager.
                let manager =
                    BudgetManager::new(FileStateStore::new(path.as_path()), BudgetTable::default())
                        .with_clock(ManualClock::new(T0));
                let consumer = if i % 2 == 0 { "cyber-ops" } else { "landscape" };
                for _ in 0..per_thread {
                    manager.record_request(consumer, "/v3/entries", None).expect("record");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    let state = FileStateStore::new(path.as_path()).load(T0).expect("load");
    assert_eq!(state.daily.total, threads * per_thread);
    assert_eq!(state.daily.by_consumer.values().sum::<u32>(), state.daily.total);
    assert_eq!(state.daily.used_by("cyber-ops"), 4 * per_thread);
}
