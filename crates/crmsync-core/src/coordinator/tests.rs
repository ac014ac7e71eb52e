use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::crm::{CrmCallKind, CrmError, InMemoryCrm};
use crate::db::Database;
use crate::models::{EventStatus, RemoteRecord};

fn settings() -> SyncSettings {
    SyncSettings {
        worker_count: 4,
        max_attempts: 3,
        backoff_base: Duration::from_millis(50),
        backoff_cap: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
        reconcile_interval: Duration::from_secs(3_600),
        read_timeout: Duration::from_millis(200),
        staleness: Duration::from_secs(600),
        conflict_policy: ConflictPolicy::Manual,
    }
}

fn owner() -> OwnerId {
    OwnerId::new("acct-001").unwrap()
}

fn payload(subject: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("subject".into(), json!(subject));
    payload
}

fn coordinator_with(settings: SyncSettings) -> (SyncCoordinator, Arc<InMemoryCrm>) {
    let db = Database::open_in_memory().unwrap().into_shared();
    let crm = Arc::new(InMemoryCrm::new());
    (SyncCoordinator::new(db, crm.clone(), settings), crm)
}

fn coordinator() -> (SyncCoordinator, Arc<InMemoryCrm>) {
    coordinator_with(settings())
}

async fn wait_for_state(
    coordinator: &SyncCoordinator,
    key: &RecordKey,
    state: SyncState,
) -> Record {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let record = coordinator.cache().get_by_key(key).await.unwrap().unwrap();
        if record.sync_state == state {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {state}, record is {}",
            record.sync_state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_to_one_record_reach_the_crm_in_order() {
    let (coordinator, crm) = coordinator();

    let mut keys = Vec::new();
    for subject in ["a", "b", "c"] {
        let record = coordinator
            .write_record(&owner(), RecordKind::Case, payload(subject), EventId::new())
            .await
            .unwrap();
        for n in 1..=5 {
            let mut patch = Payload::new();
            patch.insert("n".into(), json!(n));
            coordinator
                .update_record(
                    &owner(),
                    RecordKind::Case,
                    &record.local_id.as_str(),
                    patch,
                    EventId::new(),
                )
                .await
                .unwrap();
        }
        keys.push(record.key());
    }

    coordinator.start().await.unwrap();
    for key in &keys {
        let synced = wait_for_state(&coordinator, key, SyncState::Synced).await;
        assert_eq!(synced.payload["n"], 5);
        let remote_id = synced.remote_id.unwrap();

        let seen: Vec<i64> = crm
            .calls_of(CrmCallKind::Update)
            .into_iter()
            .filter(|call| call.remote_id.as_deref() == Some(remote_id.as_str()))
            .map(|call| call.payload.unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
    assert_eq!(crm.calls_of(CrmCallKind::Create).len(), 3);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn repeated_idempotency_key_reaches_the_crm_once() {
    let (coordinator, crm) = coordinator();
    let key = EventId::new();

    let first = coordinator
        .write_record(&owner(), RecordKind::Document, payload("bill"), key)
        .await
        .unwrap();
    let second = coordinator
        .write_record(&owner(), RecordKind::Document, payload("bill"), key)
        .await
        .unwrap();
    assert_eq!(first.local_id, second.local_id);
    assert_eq!(first.sync_state, SyncState::Pending);

    coordinator.start().await.unwrap();
    wait_for_state(&coordinator, &first.key(), SyncState::Synced).await;
    coordinator.shutdown().await;

    assert_eq!(crm.calls_of(CrmCallKind::Create).len(), 1);
    assert_eq!(crm.count(&owner(), RecordKind::Document), 1);
}

#[tokio::test]
async fn idempotency_key_of_another_owner_is_rejected() {
    let (coordinator, _crm) = coordinator();
    let other = OwnerId::new("acct-999").unwrap();
    let key = EventId::new();

    let first = coordinator
        .write_record(&owner(), RecordKind::Case, payload("private to acct-001"), key)
        .await
        .unwrap();
    let err = coordinator
        .write_record(&other, RecordKind::Case, payload("from acct-999"), key)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(!err.to_string().contains("acct-001"));

    assert!(coordinator
        .cache()
        .list(&other, RecordKind::Case)
        .await
        .unwrap()
        .is_empty());
    let stored = coordinator
        .cache()
        .get_by_key(&first.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payload, payload("private to acct-001"));
}

#[tokio::test]
async fn versions_never_regress_across_reconciliation() {
    let (coordinator, crm) = coordinator();
    let written = coordinator
        .write_record(&owner(), RecordKind::Case, payload("v1"), EventId::new())
        .await
        .unwrap();
    coordinator.start().await.unwrap();
    let synced = wait_for_state(&coordinator, &written.key(), SyncState::Synced).await;
    coordinator.shutdown().await;

    let remote_id = synced.remote_id.clone().unwrap();
    crm.remote_edit(&owner(), RecordKind::Case, &remote_id, payload("v2"));
    coordinator.reconcile_now(&owner()).await.unwrap();
    let updated = coordinator
        .cache()
        .get_by_key(&written.key())
        .await
        .unwrap()
        .unwrap();
    assert!(updated.version > synced.version);
    assert_eq!(updated.payload["subject"], "v2");

    coordinator.reconcile_now(&owner()).await.unwrap();
    let again = coordinator
        .cache()
        .get_by_key(&written.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.version, updated.version);
    assert_eq!(coordinator.cache().list(&owner(), RecordKind::Case).await.unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_attempts_with_growing_gaps() {
    let (coordinator, crm) = coordinator();
    crm.set_offline(true);

    let written = coordinator
        .write_record(&owner(), RecordKind::Case, payload("doomed"), EventId::new())
        .await
        .unwrap();
    coordinator.start().await.unwrap();
    let failed = wait_for_state(&coordinator, &written.key(), SyncState::Failed).await;
    coordinator.shutdown().await;

    let creates = crm.calls_of(CrmCallKind::Create);
    assert_eq!(creates.len(), 3);
    let first_gap = creates[1].at - creates[0].at;
    let second_gap = creates[2].at - creates[1].at;
    assert!(first_gap >= Duration::from_millis(40), "{first_gap:?}");
    assert!(second_gap > first_gap, "{first_gap:?} then {second_gap:?}");

    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("Gave up after 3 attempts"));
    let dead = coordinator.dead_letters(&owner()).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.attempt, 3);
}

#[tokio::test]
async fn write_during_outage_syncs_after_recovery() {
    let (coordinator, crm) = coordinator_with(SyncSettings {
        max_attempts: 10,
        ..settings()
    });
    crm.set_offline(true);
    coordinator.start().await.unwrap();

    let written = coordinator
        .write_record(&owner(), RecordKind::Case, payload("hello"), EventId::new())
        .await
        .unwrap();
    assert_eq!(written.sync_state, SyncState::Pending);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let status = coordinator
        .record_status(&owner(), RecordKind::Case, &written.local_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, SyncState::Pending);
    assert!(status.remote_id.is_none());
    assert_eq!(status.queued_writes, 1);

    crm.set_offline(false);
    let synced = wait_for_state(&coordinator, &written.key(), SyncState::Synced).await;
    coordinator.shutdown().await;

    let remote_id = synced.remote_id.unwrap();
    assert!(crm.get(&owner(), RecordKind::Case, &remote_id).is_some());
    assert!(synced.last_error.is_none());
}

#[tokio::test]
async fn remote_edit_under_pending_write_needs_resolution() {
    let (coordinator, crm) = coordinator();
    let seeded = crm.seed(&owner(), RecordKind::Case, payload("original"));
    coordinator.reconcile_now(&owner()).await.unwrap();

    let pending = coordinator
        .update_record(
            &owner(),
            RecordKind::Case,
            &seeded.id,
            payload("portal edit"),
            EventId::new(),
        )
        .await
        .unwrap();
    assert_eq!(pending.sync_state, SyncState::Pending);

    crm.remote_edit(&owner(), RecordKind::Case, &seeded.id, payload("agent edit"));
    let report = coordinator.reconcile_now(&owner()).await.unwrap();
    assert_eq!(report.conflicts, vec![pending.key()]);

    let conflicted = coordinator
        .cache()
        .get_by_key(&pending.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conflicted.sync_state, SyncState::Conflict);
    assert_eq!(conflicted.payload["subject"], "portal edit");
    let remote = crm.get(&owner(), RecordKind::Case, &seeded.id).unwrap();
    assert_eq!(remote.payload["subject"], "agent edit");

    coordinator
        .resolve_conflict(&owner(), RecordKind::Case, &seeded.id, Resolution::KeepLocal)
        .await
        .unwrap();
    coordinator.start().await.unwrap();
    wait_for_state(&coordinator, &pending.key(), SyncState::Synced).await;
    coordinator.shutdown().await;

    let remote = crm.get(&owner(), RecordKind::Case, &seeded.id).unwrap();
    assert_eq!(remote.payload["subject"], "portal edit");
    assert_eq!(remote.remote_version, 3);
}

#[tokio::test]
async fn local_wins_policy_resolves_conflicts_automatically() {
    let (coordinator, crm) = coordinator_with(SyncSettings {
        conflict_policy: ConflictPolicy::LocalWins,
        ..settings()
    });
    let seeded = crm.seed(&owner(), RecordKind::Document, payload("original"));
    coordinator.reconcile_now(&owner()).await.unwrap();
    let pending = coordinator
        .update_record(
            &owner(),
            RecordKind::Document,
            &seeded.id,
            payload("portal edit"),
            EventId::new(),
        )
        .await
        .unwrap();

    crm.remote_edit(&owner(), RecordKind::Document, &seeded.id, payload("agent edit"));
    coordinator.reconcile_now(&owner()).await.unwrap();

    let record = coordinator
        .cache()
        .get_by_key(&pending.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sync_state, SyncState::Pending);
    assert_eq!(record.remote_version, Some(2));
}

async fn conflicted_update_without_newer_crm_version(
    policy: ConflictPolicy,
) -> (SyncCoordinator, Arc<InMemoryCrm>, RemoteRecord, Record) {
    let (coordinator, crm) = coordinator_with(SyncSettings {
        conflict_policy: policy,
        ..settings()
    });
    let seeded = crm.seed(&owner(), RecordKind::Case, payload("original"));
    coordinator.reconcile_now(&owner()).await.unwrap();
    let pending = coordinator
        .update_record(
            &owner(),
            RecordKind::Case,
            &seeded.id,
            payload("portal edit"),
            EventId::new(),
        )
        .await
        .unwrap();

    crm.fail_next(1, &CrmError::Conflict("version mismatch".into()));
    assert!(coordinator.inner.deliver_next().await.unwrap());
    (coordinator, crm, seeded, pending)
}

#[tokio::test]
async fn local_wins_settles_conflict_when_crm_version_is_unchanged() {
    let (coordinator, crm, seeded, pending) =
        conflicted_update_without_newer_crm_version(ConflictPolicy::LocalWins).await;

    let record = coordinator
        .cache()
        .get_by_key(&pending.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sync_state, SyncState::Pending);
    assert!(record.staged_remote.is_none());
    let events = coordinator.queue().events_for_key(&pending.key()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Queued);

    assert!(coordinator.inner.deliver_next().await.unwrap());
    let synced = coordinator
        .cache()
        .get_by_key(&pending.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    let remote = crm.get(&owner(), RecordKind::Case, &seeded.id).unwrap();
    assert_eq!(remote.payload["subject"], "portal edit");
    assert_eq!(remote.remote_version, 2);
}

#[tokio::test]
async fn unchanged_crm_version_is_staged_for_manual_resolution() {
    let (coordinator, _crm, seeded, pending) =
        conflicted_update_without_newer_crm_version(ConflictPolicy::Manual).await;

    let conflicted = coordinator
        .cache()
        .get_by_key(&pending.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conflicted.sync_state, SyncState::Conflict);
    let staged = conflicted.staged_remote.unwrap();
    assert_eq!(staged.remote_version, 1);
    assert_eq!(staged.payload["subject"], "original");

    let resolved = coordinator
        .resolve_conflict(&owner(), RecordKind::Case, &seeded.id, Resolution::AcceptRemote)
        .await
        .unwrap();
    assert_eq!(resolved.sync_state, SyncState::Synced);
    assert_eq!(resolved.payload["subject"], "original");
    assert_eq!(
        coordinator
            .queue()
            .dead_letters_for_key(&pending.key())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn create_rejected_as_conflict_fails_the_record() {
    let (coordinator, crm) = coordinator();
    let written = coordinator
        .write_record(&owner(), RecordKind::Case, payload("new case"), EventId::new())
        .await
        .unwrap();

    crm.fail_next(1, &CrmError::Conflict("duplicate".into()));
    assert!(coordinator.inner.deliver_next().await.unwrap());

    let failed = coordinator
        .cache()
        .get_by_key(&written.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.sync_state, SyncState::Failed);
    assert!(failed.last_error.unwrap().contains("Create rejected as a conflict"));
    let dead = coordinator.dead_letters(&owner()).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(coordinator
        .queue()
        .events_for_key(&written.key())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn read_miss_with_slow_crm_times_out_but_still_fills_cache() {
    let (coordinator, crm) = coordinator();
    let seeded = crm.seed(&owner(), RecordKind::Case, payload("slow"));
    crm.set_latency(Duration::from_millis(600));

    let started = Instant::now();
    let result = coordinator
        .read_record(&owner(), RecordKind::Case, &seeded.id)
        .await
        .unwrap();
    assert_eq!(result, ReadResult::NotFound);
    assert!(started.elapsed() < Duration::from_millis(500));

    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator
        .cache()
        .find_by_remote_id(&owner(), RecordKind::Case, &seeded.id)
        .await
        .unwrap()
        .is_none()
    {
        assert!(Instant::now() < deadline, "late fetch never reached the cache");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn reads_prefer_cache_and_degrade_when_stale_and_offline() {
    let (coordinator, crm) = coordinator();
    let seeded = crm.seed(&owner(), RecordKind::Document, payload("contract"));

    let fetched = coordinator
        .read_record(&owner(), RecordKind::Document, &seeded.id)
        .await
        .unwrap();
    let record = fetched.record().unwrap().clone();
    assert!(!fetched.is_degraded());

    crm.set_offline(true);
    let cached = coordinator
        .read_record(&owner(), RecordKind::Document, &record.local_id.as_str())
        .await
        .unwrap();
    assert_eq!(cached.record().unwrap().local_id, record.local_id);
    assert!(!cached.is_degraded());

    let mut stale = record.clone();
    stale.last_synced_at = Some(now_ms() - 3_600_000);
    coordinator.cache().put(&stale).await.unwrap();
    let degraded = coordinator
        .read_record(&owner(), RecordKind::Document, &seeded.id)
        .await
        .unwrap();
    assert!(degraded.is_degraded());

    crm.set_offline(false);
    let refreshed = coordinator
        .read_record(&owner(), RecordKind::Document, &seeded.id)
        .await
        .unwrap();
    assert!(!refreshed.is_degraded());
    let fresh = refreshed.record().unwrap();
    assert!(!fresh.is_stale(now_ms(), coordinator.settings().staleness));
}

#[tokio::test]
async fn list_records_triggers_background_refresh() {
    let (coordinator, crm) = coordinator();
    crm.seed(&owner(), RecordKind::Case, payload("one"));
    crm.seed(&owner(), RecordKind::Case, payload("two"));
    coordinator.start().await.unwrap();

    let first = coordinator
        .list_records(&owner(), RecordKind::Case)
        .await
        .unwrap();
    assert!(first.len() <= 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let listed = coordinator
            .list_records(&owner(), RecordKind::Case)
            .await
            .unwrap();
        if listed.len() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "partition was never refreshed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    coordinator.shutdown().await;
}

#[tokio::test]
async fn queued_and_in_flight_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crmsync.db");
    let crm = Arc::new(InMemoryCrm::new());

    let (queued, in_flight) = {
        let db = Database::open(&path).unwrap().into_shared();
        let coordinator = SyncCoordinator::new(db, crm.clone(), settings());
        let in_flight = coordinator
            .write_record(&owner(), RecordKind::Case, payload("first"), EventId::new())
            .await
            .unwrap();
        let queued = coordinator
            .write_record(&owner(), RecordKind::Document, payload("second"), EventId::new())
            .await
            .unwrap();
        // Claimed by a worker that never finished.
        let claimed = coordinator.queue().dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(claimed.record_key, in_flight.key());
        (queued, in_flight)
    };

    let db = Database::open(&path).unwrap().into_shared();
    let coordinator = SyncCoordinator::new(db, crm.clone(), settings());
    assert_eq!(
        coordinator.queue_stats(Some(&owner())).await.unwrap().in_flight,
        1
    );
    coordinator.start().await.unwrap();
    wait_for_state(&coordinator, &in_flight.key(), SyncState::Synced).await;
    wait_for_state(&coordinator, &queued.key(), SyncState::Synced).await;
    coordinator.shutdown().await;

    assert_eq!(crm.calls_of(CrmCallKind::Create).len(), 2);
}

#[tokio::test]
async fn operator_retry_moves_failed_record_back_to_sync() {
    let (coordinator, crm) = coordinator();
    let written = coordinator
        .write_record(&owner(), RecordKind::Case, payload("retry me"), EventId::new())
        .await
        .unwrap();

    crm.fail_next(1, &CrmError::Fatal("payload rejected".into()));
    assert!(coordinator.inner.deliver_next().await.unwrap());
    let failed = coordinator
        .cache()
        .get_by_key(&written.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.sync_state, SyncState::Failed);
    assert!(failed.last_error.unwrap().starts_with("Rejected by CRM"));
    assert!(!coordinator.inner.deliver_next().await.unwrap());

    let retried = coordinator
        .retry_failed(&owner(), RecordKind::Case, &written.local_id.as_str())
        .await
        .unwrap();
    assert_eq!(retried.sync_state, SyncState::Pending);
    assert!(retried.last_error.is_none());

    assert!(coordinator.inner.deliver_next().await.unwrap());
    let synced = coordinator
        .cache()
        .get_by_key(&written.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    assert!(synced.remote_id.is_some());
    assert!(coordinator.dead_letters(&owner()).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_of_unknown_record_is_not_found() {
    let (coordinator, _crm) = coordinator();
    let err = coordinator
        .update_record(
            &owner(),
            RecordKind::Case,
            "missing",
            Payload::new(),
            EventId::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(coordinator
        .record_status(&owner(), RecordKind::Case, "missing")
        .await
        .unwrap()
        .is_none());
}
