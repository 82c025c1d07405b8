//! Reconciler — one reconciliation cycle per namespace or object.
//!
//! A cycle resolves the namespace's state, computes each workload's target
//! from its annotations, leaves workloads that are already scaling or
//! parked in failure to their running attempt (refreshing the target they
//! chase), admits the remaining changes against the quota as one batch,
//! and launches one scaler task per admitted workload. Per-item problems
//! are reported in the cycle's decisions and never abort siblings.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scaler_core::{
    ItemKey, OPT_IN_LABEL, ScalingItem, ScalingItemType, State, StateReplicaMap, StateReplicas,
    target_replicas,
};
use scaler_registry::Claim;

use crate::context::EngineContext;
use crate::error::{AdapterError, EngineError, EngineResult, ScaleError, ScaleResult};
use crate::events::{Event, REASON_QUOTA_EXCEEDED, REASON_SCALING_FAILED};
use crate::scaler::{ScaleOutcome, Scaler};
use crate::source::LabelSelector;

/// What a cycle decided for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Not opted in, or carries no state annotations; not managed.
    Skipped,
    /// Already at target.
    Unchanged,
    /// A scaler task was started.
    Launched { from: i32, to: i32, state: String },
    /// An attempt is running or parked in failure; its target was refreshed.
    Deferred { to: i32, failed: bool },
    /// The batch was refused by the quota gate.
    QuotaDenied { to: i32 },
    /// The target could not be computed or admitted.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemDecision {
    pub item: ItemKey,
    pub kind: ScalingItemType,
    pub decision: Decision,
}

/// Result of one cycle: per-item decisions plus the launched tasks.
#[derive(Serialize)]
pub struct ReconcileReport {
    pub namespace: String,
    pub state: String,
    pub items: Vec<ItemDecision>,
    #[serde(skip)]
    pub handles: Vec<(ItemKey, JoinHandle<ScaleResult<ScaleOutcome>>)>,
}

impl ReconcileReport {
    pub fn launched(&self) -> usize {
        self.handles.len()
    }

    pub fn decision(&self, key: &ItemKey) -> Option<&Decision> {
        self.items
            .iter()
            .find(|d| &d.item == key)
            .map(|d| &d.decision)
    }

    /// Wait for every launched scaler task.
    pub async fn wait(self) -> Vec<(ItemKey, ScaleResult<ScaleOutcome>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for (key, handle) in self.handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ScaleError::Task(e.to_string())),
            };
            results.push((key, result));
        }
        results
    }
}

pub struct Reconciler {
    ctx: Arc<EngineContext>,
    scaler: Scaler,
}

impl Reconciler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let scaler = Scaler::new(ctx.clone());
        Self { ctx, scaler }
    }

    /// Reconcile every opted-in workload of every enabled kind in `namespace`.
    ///
    /// `NotFound` and `TooMany` from state resolution abort the cycle
    /// before anything is changed. Launched scalers keep running after
    /// this returns; use [`ReconcileReport::wait`] to join them.
    pub async fn reconcile_namespace(&self, namespace: &str) -> EngineResult<ReconcileReport> {
        let state = self.ctx.catalog.resolve_namespace(namespace).await?;

        let selector = LabelSelector::from([(OPT_IN_LABEL.to_string(), "true".to_string())]);
        let mut items = Vec::new();
        for kind in self.ctx.enabled_kinds() {
            let adapter = self
                .ctx
                .adapters
                .get(kind)
                .ok_or(EngineError::NoAdapter(kind))?;
            items.extend(adapter.list(namespace, &selector).await?);
        }
        debug!(%namespace, state = %state.name, items = items.len(), "reconciling namespace");

        Ok(self.plan(namespace, &state, items).await)
    }

    /// Reconcile a single object.
    ///
    /// A workload that no longer exists has its registry entry dropped and
    /// yields an empty report.
    pub async fn reconcile_item(
        &self,
        kind: ScalingItemType,
        namespace: &str,
        name: &str,
    ) -> EngineResult<ReconcileReport> {
        if !self.ctx.enabled_kinds().contains(&kind) {
            return Err(EngineError::NoAdapter(kind));
        }
        let state = self.ctx.catalog.resolve_namespace(namespace).await?;
        let adapter = self
            .ctx
            .adapters
            .get(kind)
            .ok_or(EngineError::NoAdapter(kind))?;

        let items = match adapter.get(namespace, name).await {
            Ok(item) => vec![item],
            Err(AdapterError::NotFound(_)) => {
                let key = ItemKey::new(namespace, name);
                if self.ctx.registry.remove(&key).is_some() {
                    info!(item = %key, "workload deleted, registry entry dropped");
                }
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(self.plan(namespace, &state, items).await)
    }

    async fn plan(&self, namespace: &str, state: &State, items: Vec<ScalingItem>) -> ReconcileReport {
        let mut report = ReconcileReport {
            namespace: namespace.to_string(),
            state: state.name.clone(),
            items: Vec::new(),
            handles: Vec::new(),
        };
        let mut candidates: Vec<(ScalingItem, StateReplicas)> = Vec::new();

        for item in items {
            let key = item.key();
            let decision = match self.target(&item, state) {
                Ok(None) => Some(Decision::Skipped),
                Ok(Some(target)) => self.triage(&item, target, &mut candidates),
                Err(message) => {
                    warn!(item = %key, state = %state.name, error = %message, "cannot compute target");
                    self.ctx
                        .events
                        .emit(Event::warning(&item, REASON_SCALING_FAILED, message.clone()));
                    Some(Decision::Failed { message })
                }
            };
            if let Some(decision) = decision {
                report.items.push(ItemDecision {
                    item: key,
                    kind: item.kind,
                    decision,
                });
            }
        }

        if candidates.is_empty() {
            return report;
        }

        let changes: Vec<(&ScalingItem, i32)> = candidates
            .iter()
            .map(|(item, target)| (item, target.replicas))
            .collect();
        let admission = self.ctx.quota.admit_batch(namespace, &changes).await;

        match admission {
            Err(e) => {
                error!(%namespace, error = %e, "quota snapshot unavailable");
                let message = e.to_string();
                for (item, _) in candidates {
                    report.items.push(ItemDecision {
                        item: item.key(),
                        kind: item.kind,
                        decision: Decision::Failed {
                            message: message.clone(),
                        },
                    });
                }
            }
            Ok(admission) if !admission.allowed => {
                let quota = admission.quota.unwrap_or_default();
                for (item, target) in candidates {
                    self.ctx.events.emit(Event::warning(
                        &item,
                        REASON_QUOTA_EXCEEDED,
                        format!(
                            "scaling to {} replicas denied by quota {quota}: short by {}",
                            target.replicas, admission.shortfall
                        ),
                    ));
                    report.items.push(ItemDecision {
                        item: item.key(),
                        kind: item.kind,
                        decision: Decision::QuotaDenied {
                            to: target.replicas,
                        },
                    });
                }
            }
            Ok(_) => {
                for (item, target) in candidates {
                    let decision = self.launch(item.clone(), target, &mut report);
                    report.items.push(ItemDecision {
                        item: item.key(),
                        kind: item.kind,
                        decision,
                    });
                }
            }
        }

        info!(
            %namespace,
            state = %state.name,
            items = report.items.len(),
            launched = report.launched(),
            "reconcile cycle complete"
        );
        report
    }

    /// `Ok(None)` when the workload is not opted in or has no state
    /// annotations at all.
    fn target(&self, item: &ScalingItem, state: &State) -> Result<Option<StateReplicas>, String> {
        if !item.is_opted_in() {
            return Ok(None);
        }
        let map = StateReplicaMap::from_annotations(&item.annotations).map_err(|e| e.to_string())?;
        if map.is_empty() {
            return Ok(None);
        }
        target_replicas(item, state)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Decide whether `item` needs a new attempt; queue it if so.
    fn triage(
        &self,
        item: &ScalingItem,
        target: StateReplicas,
        candidates: &mut Vec<(ScalingItem, StateReplicas)>,
    ) -> Option<Decision> {
        let key = item.key();
        let registry = &self.ctx.registry;

        if registry.get(&key).is_some_and(|e| e.is_being_scaled || e.failure) {
            match registry.claim(item, target.replicas) {
                Claim::InFlight => {
                    return Some(Decision::Deferred {
                        to: target.replicas,
                        failed: false,
                    });
                }
                Claim::Failed => {
                    return Some(Decision::Deferred {
                        to: target.replicas,
                        failed: true,
                    });
                }
                // Finished between the check and the claim.
                Claim::Claimed => registry.release(&key),
            }
        }

        if item.spec_replicas == target.replicas {
            return Some(Decision::Unchanged);
        }
        candidates.push((item.clone(), target));
        None
    }

    fn launch(
        &self,
        item: ScalingItem,
        target: StateReplicas,
        report: &mut ReconcileReport,
    ) -> Decision {
        let key = item.key();
        match self.ctx.registry.claim(&item, target.replicas) {
            Claim::Claimed => {
                let decision = Decision::Launched {
                    from: item.spec_replicas,
                    to: target.replicas,
                    state: target.name.clone(),
                };
                report.handles.push((key, self.scaler.spawn(item, target)));
                decision
            }
            claim => Decision::Deferred {
                to: target.replicas,
                failed: claim == Claim::Failed,
            },
        }
    }

    /// Reconcile `namespaces` every `interval` until `shutdown` changes.
    ///
    /// Launched scalers are detached; their outcomes land on the registry.
    pub async fn run(
        &self,
        namespaces: Vec<String>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            namespaces = namespaces.len(),
            interval_ms = interval.as_millis() as u64,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    for namespace in &namespaces {
                        if let Err(e) = self.reconcile_namespace(namespace).await {
                            match &e {
                                EngineError::NotFound(_) => debug!(%namespace, error = %e, "nothing to reconcile"),
                                _ => error!(%namespace, error = %e, "reconcile cycle aborted"),
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}
