//! Scaler — drives a workload's replica count toward its state target.
//!
//! ```text
//! Idle ──▶ Scaling ──▶ Ready
//!             │
//!             ├──────▶ Failed   (recorded on the registry, retried by the sweep)
//!             └──────▶ Removed  (object gone; registry entry dropped)
//! ```
//!
//! Rapid mode writes the target in one update. Step mode moves one
//! replica at a time and waits for the rollout to become ready between
//! steps. Both modes re-read the registry before every write, so a target
//! revised by a concurrent trigger is chased instead of the one captured
//! at start. Every write passes the quota gate and is retried on
//! optimistic-concurrency conflicts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scaler_core::{ScalingItem, ScalingMode, StateReplicas};
use scaler_quota::Admission;

use crate::context::EngineContext;
use crate::error::{AdapterError, ScaleError, ScaleResult};
use crate::events::{Event, REASON_QUOTA_EXCEEDED, REASON_SCALED, REASON_SCALING_FAILED};
use crate::source::WorkloadAdapter;

/// Terminal result of a scaling attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScaleOutcome {
    /// Already at target; nothing written.
    Unchanged,
    /// Reached the target.
    Scaled { replicas: i32 },
    /// The quota gate refused a write. Not a failure.
    QuotaDenied,
    /// The workload no longer exists.
    Removed,
}

/// Result of one gated, conflict-retried write.
enum Applied {
    Updated(ScalingItem),
    QuotaDenied(Admission),
    Removed,
}

/// Executes scaling attempts against the engine context.
#[derive(Clone)]
pub struct Scaler {
    ctx: Arc<EngineContext>,
}

impl Scaler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run [`Scaler::scale`] on a background task.
    ///
    /// The handle is the completion signal; dropping it leaves the attempt
    /// running. Callers must claim the workload on the registry first so
    /// that two attempts never run for the same key.
    pub fn spawn(
        &self,
        item: ScalingItem,
        target: StateReplicas,
    ) -> JoinHandle<ScaleResult<ScaleOutcome>> {
        let scaler = self.clone();
        tokio::spawn(async move { scaler.scale(item, &target).await })
    }

    /// Move `item` to `target.replicas` and record the outcome.
    ///
    /// Failures are logged, stored on the registry entry, and emitted as a
    /// warning event before the error is returned.
    pub async fn scale(&self, item: ScalingItem, target: &StateReplicas) -> ScaleResult<ScaleOutcome> {
        let key = item.key();
        let registry = &self.ctx.registry;

        if item.spec_replicas == target.replicas && !item.failure && registry.get(&key).is_none() {
            debug!(item = %key, replicas = target.replicas, "already at target");
            return Ok(ScaleOutcome::Unchanged);
        }

        // A claimed entry already holds the newest target; keep it.
        if registry.update(&key, |e| e.is_being_scaled = true).is_none() {
            let mut entry = item.clone();
            entry.is_being_scaled = true;
            registry.upsert(&entry, item.failure, item.failure_message.clone(), target.replicas);
        }

        info!(
            item = %key,
            kind = %item.kind,
            state = %target.name,
            from = item.spec_replicas,
            to = target.replicas,
            mode = ?self.ctx.config.scaling_mode,
            "scaling workload"
        );

        let result = self.drive(&item, target).await;
        self.finish(&item, target, result)
    }

    async fn drive(&self, item: &ScalingItem, target: &StateReplicas) -> ScaleResult<ScaleOutcome> {
        let key = item.key();
        let adapter = self.adapter(item)?;
        let mut current = item.clone();
        let mut written = false;

        loop {
            // Always chase the latest target any trigger stored.
            let desired = self
                .ctx
                .registry
                .update(&key, |e| e.is_being_scaled = true)
                .map(|e| e.desired_replicas)
                .unwrap_or(target.replicas);

            if current.spec_replicas == desired {
                break;
            }

            let next = match self.ctx.config.scaling_mode {
                ScalingMode::Rapid => desired,
                ScalingMode::Step => {
                    let step = step_toward(current.spec_replicas, desired);
                    match self.wait_ready(adapter.as_ref(), &current, step).await? {
                        Some(live) => current = live,
                        None => return Ok(ScaleOutcome::Removed),
                    }
                    if current.spec_replicas == desired {
                        continue;
                    }
                    step_toward(current.spec_replicas, desired)
                }
            };

            match self.apply(adapter.as_ref(), &current, next, &target.name).await? {
                Applied::Updated(live) => {
                    debug!(item = %key, replicas = live.spec_replicas, desired, "replicas written");
                    current = live;
                    written = true;
                }
                Applied::QuotaDenied(admission) => {
                    self.ctx.events.emit(Event::warning(
                        item,
                        REASON_QUOTA_EXCEEDED,
                        format!(
                            "scaling to {next} replicas denied by quota {}: short by {}",
                            admission.quota.as_deref().unwrap_or("unknown"),
                            admission.shortfall
                        ),
                    ));
                    return Ok(ScaleOutcome::QuotaDenied);
                }
                Applied::Removed => return Ok(ScaleOutcome::Removed),
            }
        }

        if written {
            Ok(ScaleOutcome::Scaled {
                replicas: current.spec_replicas,
            })
        } else {
            Ok(ScaleOutcome::Unchanged)
        }
    }

    /// Poll the live object until it is ready for the next step.
    ///
    /// Ready means `ready == step` or `spec == ready`. The wait is bounded
    /// by the workload's progress deadline plus the configured slack.
    /// Returns `None` if the object disappeared.
    async fn wait_ready(
        &self,
        adapter: &dyn WorkloadAdapter,
        item: &ScalingItem,
        step: i32,
    ) -> ScaleResult<Option<ScalingItem>> {
        let key = item.key();
        let limit = Duration::from_secs(u64::from(item.progress_deadline_seconds))
            + self.ctx.timings.step_timeout_slack;
        let poll_interval = self.ctx.timings.poll_interval;

        let poll = async {
            loop {
                let live = match adapter.get(&item.namespace, &item.name).await {
                    Ok(live) => live,
                    Err(AdapterError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(ScaleError::from(e)),
                };

                if live.ready_replicas == step || live.spec_replicas == live.ready_replicas {
                    return Ok(Some(live));
                }
                if live.progress_deadline_exceeded() {
                    return Err(ScaleError::ProgressDeadlineExceeded { item: key.clone() });
                }

                debug!(
                    item = %key,
                    spec = live.spec_replicas,
                    ready = live.ready_replicas,
                    step,
                    "waiting for rollout"
                );
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(limit, poll).await {
            Ok(result) => result,
            Err(_) => Err(ScaleError::StepTimeout {
                item: item.key(),
                step,
                waited: limit,
            }),
        }
    }

    /// Write `replicas` to the live object.
    ///
    /// Refetches before each attempt, refuses any workload that is no
    /// longer opted in, and consults the quota gate. Conflicts are retried
    /// with a fixed backoff.
    async fn apply(
        &self,
        adapter: &dyn WorkloadAdapter,
        item: &ScalingItem,
        replicas: i32,
        state: &str,
    ) -> ScaleResult<Applied> {
        let key = item.key();
        let attempts = self.ctx.config.conflict_retries.max(1);

        for attempt in 1..=attempts {
            let mut live = match adapter.get(&item.namespace, &item.name).await {
                Ok(live) => live,
                Err(AdapterError::NotFound(_)) => return Ok(Applied::Removed),
                Err(e) => return Err(e.into()),
            };

            if !live.is_opted_in() {
                return Err(ScaleError::OptedOut {
                    item: key,
                    state: state.to_string(),
                });
            }

            let admission = self.ctx.quota.admit_item(&live, replicas).await?;
            if !admission.allowed {
                return Ok(Applied::QuotaDenied(admission));
            }

            live.spec_replicas = replicas;
            match adapter.update(&live).await {
                Ok(updated) => return Ok(Applied::Updated(updated)),
                Err(AdapterError::Conflict(_)) => {
                    debug!(item = %key, attempt, attempts, "write conflict, retrying");
                    if attempt < attempts {
                        tokio::time::sleep(self.ctx.timings.conflict_backoff).await;
                    }
                }
                Err(AdapterError::NotFound(_)) => return Ok(Applied::Removed),
                Err(e) => return Err(e.into()),
            }
        }

        Err(ScaleError::ConflictRetriesExhausted {
            item: key,
            attempts,
        })
    }

    /// Record the outcome on the registry and the event sink.
    fn finish(
        &self,
        item: &ScalingItem,
        target: &StateReplicas,
        result: ScaleResult<ScaleOutcome>,
    ) -> ScaleResult<ScaleOutcome> {
        let key = item.key();
        let registry = &self.ctx.registry;

        match &result {
            Ok(ScaleOutcome::Scaled { replicas }) => {
                registry.settle(&key, *replicas);
                self.ctx.events.emit(Event::normal(
                    item,
                    REASON_SCALED,
                    format!(
                        "scaled from {} to {replicas} replicas for state {}",
                        item.spec_replicas, target.name
                    ),
                ));
                info!(item = %key, replicas, state = %target.name, "scaling complete");
            }
            Ok(ScaleOutcome::Unchanged) => {
                registry.settle(&key, item.spec_replicas);
                debug!(item = %key, "no scaling needed");
            }
            Ok(ScaleOutcome::QuotaDenied) => {
                registry.release(&key);
                info!(item = %key, to = target.replicas, "scaling deferred by quota");
            }
            Ok(ScaleOutcome::Removed) => {
                registry.remove(&key);
                info!(item = %key, "workload removed while scaling");
            }
            Err(e) => {
                let message = e.to_string();
                let recorded = registry.update(&key, |entry| {
                    entry.failure = true;
                    entry.failure_message = message.clone();
                    entry.is_being_scaled = false;
                });
                if recorded.is_none() {
                    let mut entry = item.clone();
                    entry.is_being_scaled = false;
                    registry.upsert(&entry, true, message.clone(), target.replicas);
                }
                self.ctx
                    .events
                    .emit(Event::warning(item, REASON_SCALING_FAILED, message));
                error!(item = %key, state = %target.name, error = %e, "scaling failed");
            }
        }

        result
    }

    fn adapter(&self, item: &ScalingItem) -> ScaleResult<Arc<dyn WorkloadAdapter>> {
        self.ctx.adapters.get(item.kind).cloned().ok_or_else(|| {
            warn!(item = %item.key(), kind = %item.kind, "no adapter for workload kind");
            ScaleError::NoAdapter(item.kind)
        })
    }
}

/// One replica from `current` toward `desired`.
fn step_toward(current: i32, desired: i32) -> i32 {
    if current < desired {
        current + 1
    } else {
        current - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::memory::MemoryCluster;
    use scaler_core::{
        DEFAULT_STATE, EngineConfig, ItemKey, OPT_IN_LABEL, PROGRESS_DEADLINE_EXCEEDED, Quantity,
        ResourceList, ScalingItemType,
    };

    const KIND: ScalingItemType = ScalingItemType::Deployment;

    struct Harness {
        cluster: Arc<MemoryCluster>,
        events: RecordingEventSink,
        ctx: Arc<EngineContext>,
    }

    fn harness(mode: ScalingMode) -> Harness {
        let cluster = MemoryCluster::new();
        let events = RecordingEventSink::new();
        let config = EngineConfig {
            scaling_mode: mode,
            poll_interval: "1ms".to_string(),
            step_timeout_slack: "200ms".to_string(),
            conflict_backoff: "1ms".to_string(),
            conflict_retries: 3,
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(
            config,
            cluster.adapters(&[KIND]),
            cluster.clone(),
            cluster.clone(),
            Arc::new(events.clone()),
        )
        .unwrap();
        Harness {
            cluster,
            events,
            ctx,
        }
    }

    fn workload(cluster: &MemoryCluster, replicas: i32) -> ScalingItem {
        let mut item = ScalingItem::new(KIND, "shop", "api");
        item.labels.insert(OPT_IN_LABEL.into(), "true".into());
        item.spec_replicas = replicas;
        item.ready_replicas = replicas;
        item.progress_deadline_seconds = 0;
        item.resources.limits = ResourceList::new().with("cpu", Quantity::from_millis(500));
        cluster.put_workload(item.clone());
        item
    }

    fn target(replicas: i32) -> StateReplicas {
        StateReplicas {
            name: "peak".to_string(),
            replicas,
        }
    }

    #[tokio::test]
    async fn unchanged_when_at_target() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 3);

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(3)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Unchanged);
        assert!(h.cluster.history(&item.key()).is_empty());
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn rapid_jumps_to_target() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(6)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Scaled { replicas: 6 });
        assert_eq!(h.cluster.history(&item.key()), vec![6]);
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.events.reasons_for(&item.key()), vec![REASON_SCALED.to_string()]);
    }

    #[tokio::test]
    async fn step_moves_one_replica_at_a_time() {
        let h = harness(ScalingMode::Step);
        let item = workload(&h.cluster, 5);

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(2)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Scaled { replicas: 2 });
        assert_eq!(h.cluster.history(&item.key()), vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn step_chases_revised_target() {
        let h = harness(ScalingMode::Step);
        let item = workload(&h.cluster, 0);

        let registry = h.ctx.registry.clone();
        h.cluster.on_update(Arc::new(move |stored| {
            if stored.spec_replicas == 2 {
                registry.claim(stored, 4);
            }
        }));

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(8)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Scaled { replicas: 4 });
        assert_eq!(h.cluster.history(&item.key()), vec![1, 2, 3, 4]);
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);
        h.cluster.inject_conflicts(2);

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(3)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Scaled { replicas: 3 });
    }

    #[tokio::test]
    async fn conflict_exhaustion_is_recorded() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);
        h.cluster.inject_conflicts(10);

        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &target(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::ConflictRetriesExhausted { attempts: 3, .. }));

        let entry = h.ctx.registry.get(&item.key()).unwrap();
        assert!(entry.failure);
        assert!(!entry.is_being_scaled);
        assert!(entry.failure_message.contains("conflicting writes"));
        assert_eq!(entry.desired_replicas, 3);
        assert_eq!(
            h.events.reasons_for(&item.key()),
            vec![REASON_SCALING_FAILED.to_string()]
        );
    }

    #[tokio::test]
    async fn opted_out_workload_is_refused() {
        let h = harness(ScalingMode::Rapid);
        let mut item = workload(&h.cluster, 1);
        item.labels.insert(OPT_IN_LABEL.into(), "false".into());
        h.cluster.put_workload(item.clone());

        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &target(4))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::OptedOut { .. }));
        assert!(h.ctx.registry.is_failed(&item.key()));
        assert!(h.cluster.history(&item.key()).is_empty());
    }

    #[tokio::test]
    async fn opted_out_workload_is_refused_even_for_default() {
        let h = harness(ScalingMode::Rapid);
        let mut item = workload(&h.cluster, 4);
        item.labels.remove(OPT_IN_LABEL);
        h.cluster.put_workload(item.clone());

        let default = StateReplicas {
            name: DEFAULT_STATE.to_string(),
            replicas: 1,
        };
        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &default)
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::OptedOut { state, .. } if state == DEFAULT_STATE));
        assert!(h.cluster.history(&item.key()).is_empty());
        assert!(h.ctx.registry.is_failed(&item.key()));
    }

    #[tokio::test]
    async fn opt_out_mid_flight_stops_step_scaling() {
        let h = harness(ScalingMode::Step);
        let item = workload(&h.cluster, 0);

        let cluster = Arc::downgrade(&h.cluster);
        h.cluster.on_update(Arc::new(move |stored| {
            if let Some(cluster) = cluster.upgrade() {
                let mut opted_out = stored.clone();
                opted_out.labels.remove(OPT_IN_LABEL);
                cluster.put_workload(opted_out);
            }
        }));

        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &target(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::OptedOut { .. }));
        assert_eq!(h.cluster.history(&item.key()), vec![1]);
    }

    #[tokio::test]
    async fn quota_denial_is_not_a_failure() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);
        h.cluster.set_quota(
            "shop",
            "compute",
            ResourceList::new().with("limits.cpu", Quantity::from_units(2)),
        );

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(5)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::QuotaDenied);
        assert!(h.cluster.history(&item.key()).is_empty());
        assert!(h.ctx.registry.is_empty());
        assert_eq!(
            h.events.reasons_for(&item.key()),
            vec![REASON_QUOTA_EXCEEDED.to_string()]
        );
    }

    #[tokio::test]
    async fn step_times_out_when_rollout_stalls() {
        let h = harness(ScalingMode::Step);
        let item = workload(&h.cluster, 0);
        h.cluster.set_auto_ready(false);

        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &target(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::StepTimeout { step: 2, .. }));
        assert_eq!(h.cluster.history(&item.key()), vec![1]);
        assert!(h.ctx.registry.is_failed(&item.key()));
    }

    #[tokio::test]
    async fn step_fails_on_progress_deadline_condition() {
        let h = harness(ScalingMode::Step);
        let item = workload(&h.cluster, 2);
        h.cluster.set_auto_ready(false);
        h.cluster.set_ready(KIND, &item.key(), 1);
        h.cluster
            .set_condition(KIND, &item.key(), Some(PROGRESS_DEADLINE_EXCEEDED));

        let err = Scaler::new(h.ctx.clone())
            .scale(item.clone(), &target(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::ProgressDeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn vanished_workload_is_removed() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);
        h.cluster.delete_workload(KIND, &item.key());

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(3)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Removed);
        assert!(h.ctx.registry.get(&ItemKey::new("shop", "api")).is_none());
    }

    #[tokio::test]
    async fn failed_item_at_target_is_cleared() {
        let h = harness(ScalingMode::Rapid);
        let mut item = workload(&h.cluster, 3);
        h.ctx.registry.upsert(&item, true, "earlier failure", 3);
        item.failure = true;

        let outcome = Scaler::new(h.ctx.clone()).scale(item.clone(), &target(3)).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Unchanged);
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn spawn_returns_completion_handle() {
        let h = harness(ScalingMode::Rapid);
        let item = workload(&h.cluster, 1);

        let handle = Scaler::new(h.ctx.clone()).spawn(item, target(2));
        assert_eq!(handle.await.unwrap().unwrap(), ScaleOutcome::Scaled { replicas: 2 });
    }

    #[test]
    fn step_toward_moves_by_one() {
        assert_eq!(step_toward(0, 8), 1);
        assert_eq!(step_toward(5, 2), 4);
    }
}
