#![forbid(unsafe_code)]

//! Background reconciliation between the local store and the cloud.
//!
//! One cycle pushes the outbox oldest-first, then pulls the device
//! assignment and permission changes. Push and pull back off independently;
//! a schema-class failure flips the worker into degraded mode, where it keeps
//! retrying at the capped backoff and logs instead of failing. A rejected
//! request is reported the same way, since the same batch is retried until
//! someone fixes the data or the table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use doorkeep_contracts::access::AccessLogId;
use doorkeep_contracts::UnixTimeNs;
use doorkeep_storage::{EdgeStoreRepo, PermissionUpsertOutcome, StorageError};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::cloud::{CloudApi, CloudError, CloudErrorClass};
use crate::identity_registry::IdentityRegistry;

pub const SYNC_INTERVAL_MS_DEFAULT: u64 = 5_000;
pub const SYNC_BATCH_SIZE_DEFAULT: usize = 50;
pub const SYNC_MAX_PUSH_BATCHES_PER_CYCLE: usize = 8;
pub const SYNC_MAX_PULL_PAGES_PER_CYCLE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncWorkerConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: SYNC_INTERVAL_MS_DEFAULT,
            batch_size: SYNC_BATCH_SIZE_DEFAULT,
            backoff: BackoffPolicy::sync_default(),
        }
    }
}

/// Lifetime counters, shared with the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncWorkerCounters {
    pub cycles: u64,
    pub pushed_total: u64,
    pub permissions_applied_total: u64,
    pub push_failures: u64,
    pub pull_failures: u64,
    pub consecutive_push_failures: u32,
    pub consecutive_pull_failures: u32,
    pub last_push_ok_at_ms: Option<u64>,
    pub last_pull_ok_at_ms: Option<u64>,
    pub push_degraded_reason: Option<String>,
    pub pull_degraded_reason: Option<String>,
    pub last_error: Option<String>,
}

impl SyncWorkerCounters {
    pub fn is_degraded(&self) -> bool {
        self.push_degraded_reason.is_some() || self.pull_degraded_reason.is_some()
    }
}

/// Cloneable read handle over the worker's counters.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusHandle {
    inner: Arc<Mutex<SyncWorkerCounters>>,
}

impl SyncStatusHandle {
    pub fn snapshot(&self) -> SyncWorkerCounters {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut SyncWorkerCounters)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleMetrics {
    pub pushed: usize,
    pub push_batches: usize,
    pub push_deferred: bool,
    pub push_error: Option<CloudErrorClass>,
    pub permissions_applied: usize,
    pub permissions_stale: usize,
    pub permissions_skipped: usize,
    pub identity_changed: bool,
    pub pull_deferred: bool,
    pub pull_error: Option<CloudErrorClass>,
    pub storage_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Push,
    Pull,
}

impl SyncPhase {
    fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Push => "push",
            SyncPhase::Pull => "pull",
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SyncPhaseError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct SyncWorker {
    store: Arc<dyn EdgeStoreRepo>,
    cloud: Arc<dyn CloudApi>,
    registry: Arc<IdentityRegistry>,
    config: SyncWorkerConfig,
    push_backoff: Backoff,
    pull_backoff: Backoff,
    status: SyncStatusHandle,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn EdgeStoreRepo>,
        cloud: Arc<dyn CloudApi>,
        registry: Arc<IdentityRegistry>,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            registry,
            push_backoff: Backoff::new(config.backoff),
            pull_backoff: Backoff::new(config.backoff),
            config,
            status: SyncStatusHandle::default(),
        }
    }

    pub fn status(&self) -> SyncStatusHandle {
        self.status.clone()
    }

    pub fn config(&self) -> &SyncWorkerConfig {
        &self.config
    }

    /// Runs one push-then-pull cycle at `now`. Never fails: every error is
    /// logged, counted and turned into backoff.
    pub fn run_cycle(&mut self, now: UnixTimeNs) -> SyncCycleMetrics {
        let mut metrics = SyncCycleMetrics::default();

        if self.push_backoff.is_ready(now) {
            match self.push_phase(now, &mut metrics) {
                Ok(()) => self.phase_succeeded(SyncPhase::Push, now),
                Err(err) => self.phase_failed(SyncPhase::Push, err, now, &mut metrics),
            }
        } else {
            metrics.push_deferred = true;
        }

        if self.pull_backoff.is_ready(now) {
            match self.pull_phase(&mut metrics) {
                Ok(()) => self.phase_succeeded(SyncPhase::Pull, now),
                Err(err) => self.phase_failed(SyncPhase::Pull, err, now, &mut metrics),
            }
        } else {
            metrics.pull_deferred = true;
        }

        self.status.update(|c| {
            c.cycles = c.cycles.saturating_add(1);
            c.pushed_total = c.pushed_total.saturating_add(metrics.pushed as u64);
            c.permissions_applied_total = c
                .permissions_applied_total
                .saturating_add(metrics.permissions_applied as u64);
        });
        debug!(?metrics, "sync cycle finished");
        metrics
    }

    fn push_phase(
        &mut self,
        now: UnixTimeNs,
        metrics: &mut SyncCycleMetrics,
    ) -> Result<(), SyncPhaseError> {
        let batch_size = self.config.batch_size.max(1);
        for _ in 0..SYNC_MAX_PUSH_BATCHES_PER_CYCLE {
            let batch = self.store.next_unsynced_log_rows(batch_size)?;
            if batch.is_empty() {
                break;
            }
            self.cloud.push_access_logs(&batch)?;
            let ids: Vec<AccessLogId> = batch.iter().map(|entry| entry.id).collect();
            let marked = self.store.mark_log_rows_synced(&ids, now)?;
            metrics.pushed += marked;
            metrics.push_batches += 1;
            info!(pushed = marked, "access log batch synced");
            if batch.len() < batch_size {
                break;
            }
        }
        Ok(())
    }

    fn pull_phase(&mut self, metrics: &mut SyncCycleMetrics) -> Result<(), SyncPhaseError> {
        if let Some(device_id) = self.registry.device_id() {
            if let Some(assigned) = self.cloud.fetch_device_assignment(&device_id)? {
                if self.registry.get().as_ref() != Some(&assigned) {
                    self.store.set_device_identity(assigned.clone())?;
                    self.registry.set(assigned.clone());
                    metrics.identity_changed = true;
                    info!(
                        device_id = %assigned.device_id,
                        room = %assigned.room_id,
                        building = assigned.building.as_ref().map(|b| b.as_str()).unwrap_or(""),
                        "device assigned by cloud"
                    );
                }
            }
        }

        let page_limit = self.config.batch_size.max(1);
        for _ in 0..SYNC_MAX_PULL_PAGES_PER_CYCLE {
            let since = self.store.sync_cursor()?;
            let changes = self
                .cloud
                .pull_permission_changes(since.as_ref(), page_limit)?;
            let page_len = changes.rows.len() + changes.skipped;
            metrics.permissions_skipped += changes.skipped;
            for permission in changes.rows {
                match self.store.upsert_permission_row(permission)? {
                    PermissionUpsertOutcome::Inserted | PermissionUpsertOutcome::Updated => {
                        metrics.permissions_applied += 1
                    }
                    PermissionUpsertOutcome::Stale => metrics.permissions_stale += 1,
                    PermissionUpsertOutcome::Unchanged => {}
                }
            }
            // The cursor moves only after the whole page is applied.
            match changes.next_cursor {
                Some(next) if since.as_ref() != Some(&next) => {
                    self.store.set_sync_cursor(next)?;
                }
                _ => break,
            }
            if page_len < page_limit {
                break;
            }
        }
        if metrics.permissions_applied > 0 {
            info!(
                applied = metrics.permissions_applied,
                stale = metrics.permissions_stale,
                "permission changes applied"
            );
        }
        Ok(())
    }

    fn phase_succeeded(&mut self, phase: SyncPhase, now: UnixTimeNs) {
        let backoff = match phase {
            SyncPhase::Push => &mut self.push_backoff,
            SyncPhase::Pull => &mut self.pull_backoff,
        };
        backoff.record_success();
        self.status.update(|c| match phase {
            SyncPhase::Push => {
                if c.push_degraded_reason.take().is_some() {
                    info!("sync push recovered from degraded mode");
                }
                c.consecutive_push_failures = 0;
                c.last_push_ok_at_ms = Some(now.as_millis());
            }
            SyncPhase::Pull => {
                if c.pull_degraded_reason.take().is_some() {
                    info!("sync pull recovered from degraded mode");
                }
                c.consecutive_pull_failures = 0;
                c.last_pull_ok_at_ms = Some(now.as_millis());
            }
        });
    }

    fn phase_failed(
        &mut self,
        phase: SyncPhase,
        err: SyncPhaseError,
        now: UnixTimeNs,
        metrics: &mut SyncCycleMetrics,
    ) {
        let backoff = match phase {
            SyncPhase::Push => &mut self.push_backoff,
            SyncPhase::Pull => &mut self.pull_backoff,
        };
        let retry_in_ms = backoff.record_failure(now);
        let failures = backoff.consecutive_failures();
        let message = err.to_string();

        let degraded_reason = match &err {
            SyncPhaseError::Storage(_) => {
                metrics.storage_failed = true;
                error!(phase = phase.as_str(), error = %message, retry_in_ms, "sync storage failure");
                None
            }
            SyncPhaseError::Cloud(cloud_err) => {
                let class = cloud_err.class();
                match phase {
                    SyncPhase::Push => metrics.push_error = Some(class),
                    SyncPhase::Pull => metrics.pull_error = Some(class),
                }
                match class {
                    CloudErrorClass::Schema => {
                        warn!(phase = phase.as_str(), error = %message, retry_in_ms, "cloud schema/config error, sync degraded");
                        Some(message.clone())
                    }
                    CloudErrorClass::Rejected => {
                        warn!(phase = phase.as_str(), error = %message, retry_in_ms, failures, "cloud rejected sync request, sync degraded");
                        Some(format!("rejected: {message}"))
                    }
                    CloudErrorClass::Transient => {
                        warn!(phase = phase.as_str(), class = class.as_str(), error = %message, retry_in_ms, failures, "cloud sync failed");
                        None
                    }
                }
            }
        };

        self.status.update(|c| {
            match phase {
                SyncPhase::Push => {
                    c.push_failures = c.push_failures.saturating_add(1);
                    c.consecutive_push_failures = failures;
                    if let Some(reason) = degraded_reason {
                        c.push_degraded_reason = Some(reason);
                    }
                }
                SyncPhase::Pull => {
                    c.pull_failures = c.pull_failures.saturating_add(1);
                    c.consecutive_pull_failures = failures;
                    if let Some(reason) = degraded_reason {
                        c.pull_degraded_reason = Some(reason);
                    }
                }
            }
            c.last_error = Some(message);
        });
    }

    /// Runs cycles until `shutdown` flips to `true` or its sender is dropped.
    /// A cycle in flight always completes before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.interval_ms.max(1));
        info!(
            interval_ms = self.config.interval_ms,
            batch_size = self.config.batch_size,
            "sync worker started"
        );
        let mut worker = self;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let cycle = tokio::task::spawn_blocking(move || {
                let metrics = worker.run_cycle(UnixTimeNs::now());
                (worker, metrics)
            })
            .await;
            worker = match cycle {
                Ok((worker, _metrics)) => worker,
                Err(err) => {
                    error!(error = %err, "sync cycle task aborted, worker exiting");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("sync worker stopped");
    }
}
