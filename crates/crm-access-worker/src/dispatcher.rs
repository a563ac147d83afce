use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crm_access_core::model::{GroupId, PermissionSetId, UserId};
use crm_access_core::outbox::{EventType, OutboxEvent};
use crm_access_storage::{AccessStore, ChangeSubscription, StorageError, Wake};

use crate::audit;
use crate::effective::EffectivePermissionComputer;
use crate::error::DispatchError;
use crate::metrics::DispatcherMetrics;
use crate::rls::RlsEffectiveComputer;

pub const DEFAULT_CHANNEL: &str = "access_outbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub sweep_interval: Duration,
    pub reconnect_backoff: Duration,
    pub channel: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            sweep_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

/// What a single dispatch did with its event. Every variant ends with the
/// event marked processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Recomputed,
    Reserved,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.processed + self.failed
    }
}

/// Drains the outbox into the two computers. Woken by notifications, a
/// periodic tick, and once at every (re)connect.
pub struct OutboxDispatcher<S> {
    store: Arc<S>,
    permissions: EffectivePermissionComputer<S>,
    rls: RlsEffectiveComputer<S>,
    config: DispatcherConfig,
    metrics: Arc<DispatcherMetrics>,
}

impl<S: AccessStore> OutboxDispatcher<S> {
    pub fn new(store: Arc<S>, config: DispatcherConfig) -> Self {
        Self {
            permissions: EffectivePermissionComputer::new(Arc::clone(&store)),
            rls: RlsEffectiveComputer::new(Arc::clone(&store)),
            store,
            config,
            metrics: Arc::new(DispatcherMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<DispatcherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs until `cancel` fires. A lost subscription tears the session down
    /// and a new one is attempted after the reconnect backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            channel = %self.config.channel,
            batch_size = self.config.batch_size,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "outbox dispatcher starting"
        );

        while !cancel.is_cancelled() {
            match self.run_session(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_secs = self.config.reconnect_backoff.as_secs(),
                        "dispatcher session ended, reconnecting after backoff"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }

        tracing::info!("outbox dispatcher stopped");
    }

    /// One subscription's lifetime. Returns `Ok` only on cancellation.
    async fn run_session(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        let mut subscription = self.store.subscribe(&self.config.channel).await?;
        tracing::info!(channel = %self.config.channel, "listening for outbox notifications");

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if let Err(e) = self.sweep_until(cancel).await {
                tracing::error!(error = %e, "outbox sweep failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                wake = subscription.wait(self.config.sweep_interval) => match wake? {
                    Wake::Notified => tracing::trace!("woken by notification"),
                    Wake::TimedOut => tracing::trace!("woken by sweep interval"),
                },
            }
        }
    }

    /// Processes pending events in creation order. Events that fail stay
    /// pending for the next sweep and are stepped over when fetching the next
    /// batch, so they never hide newer events.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        self.sweep_until(&CancellationToken::new()).await
    }

    async fn sweep_until(&self, cancel: &CancellationToken) -> Result<SweepReport, StorageError> {
        self.metrics.record_sweep();
        let mut report = SweepReport::default();

        loop {
            // Every failure so far is still pending ahead of the unseen events.
            let batch = self
                .store
                .list_unprocessed(report.failed, self.config.batch_size)
                .await?;
            let fetched = batch.len();

            for event in &batch {
                if cancel.is_cancelled() {
                    return Ok(report);
                }
                self.process(event, &mut report).await;
            }

            if fetched < self.config.batch_size {
                break;
            }
        }

        if report.total() > 0 {
            tracing::info!(
                processed = report.processed,
                failed = report.failed,
                unknown = report.unknown,
                total_processed = self.metrics.events_processed(),
                total_failed = self.metrics.events_failed(),
                "outbox sweep finished"
            );
        }
        Ok(report)
    }

    async fn process(&self, event: &OutboxEvent, report: &mut SweepReport) {
        let result = match self.dispatch(event).await {
            Ok(disposition) => self
                .store
                .mark_processed(&event.id)
                .await
                .map(|()| disposition)
                .map_err(DispatchError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(disposition) => {
                report.processed += 1;
                self.metrics.record_processed();
                if disposition == Disposition::Unknown {
                    report.unknown += 1;
                    self.metrics.record_unknown();
                }
                audit::audit_event_processed(event);
            }
            Err(e) => {
                report.failed += 1;
                self.metrics.record_failed();
                audit::audit_event_failed(event, &e);
            }
        }
    }

    /// Routes one event to the computers. Safe to repeat for the same event.
    pub async fn dispatch(&self, event: &OutboxEvent) -> Result<Disposition, DispatchError> {
        match &event.event_type {
            EventType::UserChanged => {
                let user_id = UserId::new(event.entity_id);
                self.permissions.recompute_for_user(&user_id).await?;
                self.rls.recompute_visible_owners_for_user(&user_id).await?;
            }
            EventType::PermissionSetChanged => {
                let ps_id = PermissionSetId::new(event.entity_id);
                self.permissions.recompute_for_permission_set(&ps_id).await?;
            }
            EventType::RoleChanged => {
                self.rls.recompute_role_hierarchy().await?;
                self.rls.recompute_visible_owners_all().await?;
            }
            EventType::GroupChanged => {
                let group_id = GroupId::new(event.entity_id);
                self.rls.recompute_group_members_for_group(&group_id).await?;
            }
            EventType::ObjectChanged => {
                self.rls.recompute_object_hierarchy().await?;
            }
            EventType::TerritoryChanged => {
                audit::audit_event_ignored(event, "territory recompute not implemented");
                return Ok(Disposition::Reserved);
            }
            EventType::Unknown(_) => {
                audit::audit_event_ignored(event, "unknown event type");
                return Ok(Disposition::Unknown);
            }
        }
        Ok(Disposition::Recomputed)
    }
}
