//! Rectification sweep — periodically retries failed scaling attempts.
//!
//! Each pass snapshots the failed registry entries, refetches every live
//! object, recomputes its target from the namespace's current state, and
//! re-runs the scaler with the failure flag carried over. Entries that
//! succeed leave the registry; entries that fail again stay for the next
//! pass. Workloads that no longer exist are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use scaler_core::{ItemKey, ScalingItem, State, target_replicas};

use crate::context::EngineContext;
use crate::error::{AdapterError, ScaleResult};
use crate::scaler::{ScaleOutcome, Scaler};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Failed entries that were re-run.
    pub retried: usize,
    pub succeeded: usize,
    /// Re-runs that failed again, or entries whose target could not be computed.
    pub failed: usize,
    /// Entries dropped because the workload is gone.
    pub removed: usize,
    /// Re-runs deferred by the quota gate.
    pub deferred: usize,
}

pub struct RectificationSweep {
    ctx: Arc<EngineContext>,
    scaler: Scaler,
}

impl RectificationSweep {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let scaler = Scaler::new(ctx.clone());
        Self { ctx, scaler }
    }

    /// Run one pass over the failed entries and wait for every retry.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let failures = self.ctx.registry.failures();
        if failures.is_empty() {
            return report;
        }
        debug!(failed = failures.len(), "rectification pass started");

        let mut states: HashMap<String, Option<State>> = HashMap::new();
        let mut retries = JoinSet::new();

        for entry in failures {
            if entry.is_being_scaled {
                continue;
            }
            let key = entry.key();

            if !states.contains_key(&entry.namespace) {
                let state = match self.ctx.catalog.resolve_namespace(&entry.namespace).await {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!(namespace = %entry.namespace, error = %e, "cannot resolve state for rectification");
                        None
                    }
                };
                states.insert(entry.namespace.clone(), state);
            }
            let Some(state) = states.get(&entry.namespace).cloned().flatten() else {
                continue;
            };

            let Some(adapter) = self.ctx.adapters.get(entry.kind) else {
                warn!(item = %key, kind = %entry.kind, "no adapter for failed workload");
                continue;
            };
            let mut live = match adapter.get(&entry.namespace, &entry.name).await {
                Ok(live) => live,
                Err(AdapterError::NotFound(_)) => {
                    self.ctx.registry.remove(&key);
                    info!(item = %key, "failed workload no longer exists");
                    report.removed += 1;
                    continue;
                }
                Err(e) => {
                    warn!(item = %key, error = %e, "cannot fetch failed workload");
                    continue;
                }
            };

            let target = match target_replicas(&live, &state) {
                Ok(target) => target,
                Err(e) => {
                    let message = e.to_string();
                    self.ctx.registry.update(&key, |entry| entry.failure_message = message);
                    warn!(item = %key, state = %state.name, error = %e, "cannot compute rectification target");
                    report.failed += 1;
                    continue;
                }
            };

            // Mark the entry in flight so triggers only refresh its target.
            let mut claimed = entry.clone();
            claimed.is_being_scaled = true;
            self.ctx
                .registry
                .upsert(&claimed, true, entry.failure_message.clone(), target.replicas);

            live.failure = true;
            live.failure_message = entry.failure_message.clone();
            report.retried += 1;
            info!(
                item = %key,
                state = %target.name,
                from = live.spec_replicas,
                to = target.replicas,
                "retrying failed scaling"
            );

            let scaler = self.scaler.clone();
            retries.spawn(async move {
                let result = scaler.scale(live, &target).await;
                (key, result)
            });
        }

        while let Some(joined) = retries.join_next().await {
            match joined {
                Ok((key, result)) => record(&mut report, &key, result),
                Err(e) => {
                    error!(error = %e, "rectification task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            retried = report.retried,
            succeeded = report.succeeded,
            failed = report.failed,
            removed = report.removed,
            "rectification pass complete"
        );
        report
    }

    /// Sweep every `interval` until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "rectification sweep started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("rectification sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Failed entries still waiting for a successful retry.
    pub fn pending(&self) -> Vec<ScalingItem> {
        self.ctx.registry.failures()
    }
}

fn record(report: &mut SweepReport, key: &ItemKey, result: ScaleResult<ScaleOutcome>) {
    match result {
        Ok(ScaleOutcome::Scaled { .. }) | Ok(ScaleOutcome::Unchanged) => {
            debug!(item = %key, "rectified");
            report.succeeded += 1;
        }
        Ok(ScaleOutcome::Removed) => report.removed += 1,
        Ok(ScaleOutcome::QuotaDenied) => report.deferred += 1,
        Err(_) => report.failed += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::memory::MemoryCluster;
    use scaler_core::{
        EngineConfig, OPT_IN_LABEL, ScalingItemType, StateDefinition, state_annotation,
    };

    const KIND: ScalingItemType = ScalingItemType::Deployment;

    fn setup() -> (Arc<MemoryCluster>, Arc<EngineContext>) {
        let cluster = MemoryCluster::new();
        cluster.set_definitions(vec![StateDefinition::new("peak", 5)]);
        cluster.set_cluster_states(&["peak"]);
        let config = EngineConfig {
            conflict_backoff: "1ms".to_string(),
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(
            config,
            cluster.adapters(&[KIND]),
            cluster.clone(),
            cluster.clone(),
            Arc::new(RecordingEventSink::new()),
        )
        .unwrap();
        (cluster, ctx)
    }

    fn workload(cluster: &MemoryCluster, name: &str, spec: i32, peak: i32) -> ScalingItem {
        let mut item = ScalingItem::new(KIND, "shop", name);
        item.labels.insert(OPT_IN_LABEL.into(), "true".into());
        item.annotations
            .insert(state_annotation("peak"), peak.to_string());
        item.annotations
            .insert(state_annotation("default"), "1".to_string());
        item.spec_replicas = spec;
        item.ready_replicas = spec;
        cluster.put_workload(item.clone());
        item
    }

    #[tokio::test]
    async fn empty_registry_is_a_noop() {
        let (_cluster, ctx) = setup();
        let report = RectificationSweep::new(ctx).sweep_once().await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn failed_entry_is_retried_and_cleared() {
        let (cluster, ctx) = setup();
        let item = workload(&cluster, "api", 1, 4);
        ctx.registry.upsert(&item, true, "conflicts", 4);

        let sweep = RectificationSweep::new(ctx.clone());
        let report = sweep.sweep_once().await;

        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 1);
        assert!(ctx.registry.is_empty());
        assert!(sweep.pending().is_empty());
        assert_eq!(cluster.history(&item.key()), vec![4]);
    }

    #[tokio::test]
    async fn repeated_failure_stays_registered() {
        let (cluster, ctx) = setup();
        let item = workload(&cluster, "api", 1, 4);
        ctx.registry.upsert(&item, true, "conflicts", 4);
        cluster.inject_conflicts(100);

        let report = RectificationSweep::new(ctx.clone()).sweep_once().await;
        assert_eq!(report.failed, 1);
        let entry = ctx.registry.get(&item.key()).unwrap();
        assert!(entry.failure);
        assert!(!entry.is_being_scaled);
    }

    #[tokio::test]
    async fn deleted_workload_is_removed() {
        let (cluster, ctx) = setup();
        let item = workload(&cluster, "api", 1, 4);
        ctx.registry.upsert(&item, true, "conflicts", 4);
        cluster.delete_workload(KIND, &item.key());

        let report = RectificationSweep::new(ctx.clone()).sweep_once().await;
        assert_eq!(report.removed, 1);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn missing_target_keeps_entry_with_message() {
        let (cluster, ctx) = setup();
        let mut item = workload(&cluster, "api", 1, 4);
        item.annotations.remove(&state_annotation("peak"));
        cluster.put_workload(item.clone());
        ctx.registry.upsert(&item, true, "conflicts", 4);

        let report = RectificationSweep::new(ctx.clone()).sweep_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        let entry = ctx.registry.get(&item.key()).unwrap();
        assert!(entry.failure_message.contains("peak"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_cluster, ctx) = setup();
        let sweep = RectificationSweep::new(ctx);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            sweep.run(Duration::from_millis(5), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
