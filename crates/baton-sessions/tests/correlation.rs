use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use baton_sessions::testing::FakeOpenFilesProbe;
use baton_sessions::{
    CorrelationError, CorrelationMethod, CorrelationTiming, LogLayout, NewSession,
    SessionCorrelator, SessionRegistry, SessionStore,
};
use tempfile::TempDir;

const PROJECT: &str = "/work/app";
const LOG_A: &str = "aaaaaaaa-1111-4111-8111-111111111111";
const LOG_B: &str = "bbbbbbbb-2222-4222-8222-222222222222";
const LOG_C: &str = "cccccccc-3333-4333-8333-333333333333";

struct Harness {
    state_dir: TempDir,
    logs_dir: TempDir,
    probe: Arc<FakeOpenFilesProbe>,
}

impl Harness {
    fn new() -> Self {
        Self {
            state_dir: TempDir::new().unwrap(),
            logs_dir: TempDir::new().unwrap(),
            probe: Arc::new(FakeOpenFilesProbe::new()),
        }
    }

    fn layout(&self) -> LogLayout {
        LogLayout::new(self.logs_dir.path(), "jsonl")
    }

    fn registry(&self) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            SessionStore::in_dir(self.state_dir.path()),
            4,
        ))
    }

    fn correlator(&self, registry: Arc<SessionRegistry>) -> Arc<SessionCorrelator> {
        Arc::new(SessionCorrelator::new(
            registry,
            self.probe.clone(),
            self.layout(),
            CorrelationTiming::default(),
        ))
    }

    /// Write a log whose timestamps lie `age` in the past.
    fn write_log(&self, id: &str, age: Duration) -> PathBuf {
        let path = self.layout().artifact_path(Path::new(PROJECT), id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{\"type\":\"user\"}\n").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        path
    }
}

async fn spawn_session(registry: &SessionRegistry, pid: u32) -> String {
    registry
        .create_session(NewSession {
            working_directory: Some(PathBuf::from(PROJECT)),
            pid: Some(pid),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
}

#[tokio::test(start_paused = true)]
async fn test_fallback_assigns_recent_log_after_probe_budget_is_spent() {
    let h = Harness::new();
    let registry = h.registry();
    let correlator = h.correlator(registry.clone());
    let session_id = spawn_session(&registry, 4242).await;

    h.write_log(LOG_A, Duration::from_secs(10));
    h.write_log(LOG_B, Duration::from_secs(300));

    let correlation = correlator.detect(&session_id).await.unwrap();

    assert_eq!(h.probe.probe_count(), 15);
    assert_eq!(correlation.method, CorrelationMethod::Fallback);
    assert_eq!(correlation.correlation_id, LOG_A);

    // persisted the moment it was found
    let persisted = SessionStore::in_dir(h.state_dir.path()).load().unwrap();
    assert_eq!(persisted.sessions[0].correlation_id.as_deref(), Some(LOG_A));
}

#[tokio::test(start_paused = true)]
async fn test_detection_fails_when_nothing_recent_exists() {
    let h = Harness::new();
    let registry = h.registry();
    let correlator = h.correlator(registry.clone());
    let session_id = spawn_session(&registry, 4242).await;
    h.write_log(LOG_B, Duration::from_secs(300));

    let err = correlator.detect(&session_id).await.unwrap_err();

    assert!(matches!(err, CorrelationError::NotDetected { attempts: 15, .. }));
    assert!(registry.get(&session_id).await.unwrap().correlation_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_probe_failures_are_retried_then_fall_back() {
    let h = Harness::new();
    let registry = h.registry();
    let correlator = h.correlator(registry.clone());
    let session_id = spawn_session(&registry, 4242).await;
    h.write_log(LOG_A, Duration::from_secs(5));
    h.probe.set_failing(true);

    let correlation = correlator.detect(&session_id).await.unwrap();

    assert_eq!(h.probe.probe_count(), 15);
    assert_eq!(correlation.correlation_id, LOG_A);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_never_share_a_log() {
    let h = Harness::new();
    let registry = h.registry();
    let correlator = h.correlator(registry.clone());

    let mut sessions = Vec::new();
    for pid in [100, 101, 102] {
        sessions.push(spawn_session(&registry, pid).await);
    }
    let a = h.write_log(LOG_A, Duration::from_secs(3));
    h.write_log(LOG_B, Duration::from_secs(2));

    // fallback race: three sessions, two candidate logs
    let handles: Vec<_> = sessions
        .iter()
        .map(|id| correlator.spawn_detection(id.clone()))
        .collect();
    let mut detected = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            detected += 1;
        }
    }
    assert_eq!(detected, 2);
    assert_unique(&registry).await;

    // the third session's process now holds a log another session was given
    let third = registry.get(&sessions[2]).await.unwrap();
    if third.correlation_id.is_none() {
        h.probe.set_open_files(102, vec![a.clone()]);
        for _ in 0..3 {
            correlator.revalidate_all().await;
            assert_unique(&registry).await;
        }
    }

    // every process reports the same log; ownership must not move
    for pid in [100, 101, 102] {
        h.probe.set_open_files(pid, vec![a.clone()]);
    }
    for _ in 0..3 {
        correlator.revalidate_all().await;
        assert_unique(&registry).await;
    }

    let c = h.write_log(LOG_C, Duration::from_secs(1));
    h.probe.set_open_files(102, vec![c]);
    correlator.revalidate_all().await;
    assert_unique(&registry).await;
    assert_eq!(
        registry.get(&sessions[2]).await.unwrap().correlation_id.as_deref(),
        Some(LOG_C)
    );
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_repairs_swapped_fallback_picks() {
    let h = Harness::new();
    let registry = h.registry();
    let correlator = h.correlator(registry.clone());
    let x = spawn_session(&registry, 100).await;
    let y = spawn_session(&registry, 101).await;
    let a = h.write_log(LOG_A, Duration::from_secs(3));
    let b = h.write_log(LOG_B, Duration::from_secs(2));

    // two sessions started together, the fallback handed out crossed logs
    registry.assign_correlation(&x, LOG_B).await.unwrap();
    registry.assign_correlation(&y, LOG_A).await.unwrap();
    h.probe.set_open_files(100, vec![a]);
    h.probe.set_open_files(101, vec![b]);

    assert_eq!(correlator.revalidate_all().await, 2);
    assert_unique(&registry).await;
    assert_eq!(registry.get(&x).await.unwrap().correlation_id.as_deref(), Some(LOG_A));
    assert_eq!(registry.get(&y).await.unwrap().correlation_id.as_deref(), Some(LOG_B));

    // settled
    assert_eq!(correlator.revalidate_all().await, 0);
    let persisted = SessionStore::in_dir(h.state_dir.path()).load().unwrap();
    let ids: Vec<_> = persisted
        .sessions
        .iter()
        .map(|s| s.correlation_id.as_deref())
        .collect();
    assert_eq!(ids, vec![Some(LOG_A), Some(LOG_B)]);
}

async fn assert_unique(registry: &SessionRegistry) {
    let ids: Vec<String> = registry
        .list()
        .await
        .into_iter()
        .filter_map(|s| s.correlation_id)
        .collect();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len(), "duplicate correlation ids: {:?}", ids);
}

#[tokio::test]
async fn test_restart_clears_missing_logs_and_keeps_valid_ones() {
    let h = Harness::new();
    let (valid, stale) = {
        let registry = h.registry();
        let valid = spawn_session(&registry, 100).await;
        let stale = spawn_session(&registry, 101).await;
        h.write_log(LOG_A, Duration::from_secs(60));
        let b = h.write_log(LOG_B, Duration::from_secs(60));
        registry.assign_correlation(&valid, LOG_A).await.unwrap();
        registry.assign_correlation(&stale, LOG_B).await.unwrap();
        fs::remove_file(b).unwrap();
        (valid, stale)
    };

    let registry = h.registry();
    assert_eq!(registry.restore().await.unwrap(), 2);
    let report = h.correlator(registry.clone()).recover_on_startup().await.unwrap();

    assert_eq!(report.validated, vec![valid.clone()]);
    assert_eq!(report.cleared, vec![stale.clone()]);
    // the only recent log belongs to the valid session
    assert!(report.recovered.is_empty());

    let restored = registry.get(&stale).await.unwrap();
    assert!(restored.restored);
    assert!(restored.correlation_id.is_none());
    assert_eq!(
        registry.get(&valid).await.unwrap().correlation_id.as_deref(),
        Some(LOG_A)
    );
}

#[tokio::test]
async fn test_restart_recovery_pairs_orphans_with_recent_logs() {
    let h = Harness::new();
    let (older, newer) = {
        let registry = h.registry();
        let older = spawn_session(&registry, 100).await;
        let newer = spawn_session(&registry, 101).await;
        (older, newer)
    };
    h.write_log(LOG_A, Duration::from_secs(20 * 60));
    h.write_log(LOG_B, Duration::from_secs(2 * 60));
    h.write_log(LOG_C, Duration::from_secs(2 * 60 * 60));

    let registry = h.registry();
    registry.restore().await.unwrap();
    let report = h.correlator(registry.clone()).recover_on_startup().await.unwrap();

    // oldest session takes the most recently modified log
    assert_eq!(
        report.recovered,
        vec![(older.clone(), LOG_B.to_string()), (newer.clone(), LOG_A.to_string())]
    );
    let persisted = SessionStore::in_dir(h.state_dir.path()).load().unwrap();
    let ids: Vec<_> = persisted
        .sessions
        .iter()
        .map(|s| s.correlation_id.as_deref())
        .collect();
    assert_eq!(ids, vec![Some(LOG_B), Some(LOG_A)]);
}
