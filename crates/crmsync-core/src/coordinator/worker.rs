//! Queue workers: claim an event, call the CRM, record the outcome

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;

use crate::crm::{CrmError, CrmResult};
use crate::error::Result;
use crate::models::{Record, RemoteRecord, SyncEvent};
use crate::queue::FailureOutcome;
use crate::util::now_ms;

use super::Inner;

pub(super) async fn run(id: usize, inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(worker = id, "Sync worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.deliver_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => tracing::error!(worker = id, "Sync worker error: {err}"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = inner.wake.notified() => {}
            () = tokio::time::sleep(inner.settings.poll_interval) => {}
        }
    }
    tracing::debug!(worker = id, "Sync worker stopped");
}

impl Inner {
    /// Deliver one ready event, rotating over partitions with work.
    ///
    /// Returns `false` when nothing was ready.
    pub(super) async fn deliver_next(&self) -> Result<bool> {
        let owners = self.queue.ready_owners(now_ms()).await?;
        if owners.is_empty() {
            return Ok(false);
        }

        let start = self.next_partition.fetch_add(1, Ordering::Relaxed);
        for offset in 0..owners.len() {
            let owner = &owners[(start + offset) % owners.len()];
            if let Some(event) = self.queue.dequeue_next(owner).await? {
                self.deliver(&event).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn deliver(&self, event: &SyncEvent) -> Result<()> {
        let key = &event.record_key;
        let Some(record) = self.cache.get_by_key(key).await? else {
            let missing = CrmError::Fatal(format!("Record {key} is missing from the cache"));
            self.queue.record_failure(event, &missing).await?;
            return Ok(());
        };

        tracing::debug!(%key, event = %event.event_id, attempt = event.attempt + 1, "Delivering write");
        let outcome = match self.send(&record, event).await {
            // There is no CRM version to reconcile a rejected create against.
            Err(CrmError::Conflict(message)) if record.remote_id.is_none() => Err(
                CrmError::Fatal(format!("Create rejected as a conflict: {message}")),
            ),
            other => other,
        };
        match outcome {
            Ok(remote) => {
                self.queue.acknowledge(event, &remote).await?;
                // The next write of this record may be ready now.
                self.wake.notify_one();
            }
            Err(CrmError::Conflict(message)) => {
                self.queue.pause_for_conflict(event, &message).await?;
                self.refresh_conflict(&record).await;
            }
            Err(err) => match self.queue.record_failure(event, &err).await? {
                FailureOutcome::Retry { .. } => {}
                FailureOutcome::DeadLettered { reason } => {
                    tracing::debug!(%key, "Record failed: {reason}");
                }
            },
        }
        Ok(())
    }

    /// A record that has no CRM id yet is created, whatever the event says
    async fn send(&self, record: &Record, event: &SyncEvent) -> CrmResult<RemoteRecord> {
        let key = &event.record_key;
        match record.remote_id.as_deref() {
            None => {
                self.adapter
                    .create(&key.owner_id, key.kind, &event.payload, event.event_id)
                    .await
            }
            Some(remote_id) => {
                self.adapter
                    .update(
                        &key.owner_id,
                        key.kind,
                        remote_id,
                        &event.payload,
                        record.remote_version,
                        event.event_id,
                    )
                    .await
            }
        }
    }

    /// Pull the CRM's current version of a conflicted record and offer it to
    /// the resolver
    async fn refresh_conflict(&self, record: &Record) {
        let key = record.key();
        let Some(remote_id) = record.remote_id.as_deref() else {
            return;
        };

        if let Err(err) = self
            .reconciler
            .refresh_record(&record.owner_id, record.kind, remote_id)
            .await
        {
            // The resolver still runs, without a CRM snapshot.
            tracing::warn!(%key, "Could not fetch conflicting CRM version: {err}");
        }
        if let Err(err) = self.reevaluate_conflict(&key).await {
            tracing::warn!(%key, "Conflict re-evaluation failed: {err}");
        }
    }
}
