//! Quota gate — approves or denies replica changes against namespace quotas.
//!
//! The projected need of a change is `replicas × per-replica limits`,
//! expressed in quota keys (`limits.cpu`, `limits.memory`). For every
//! quota object in the namespace the gate computes
//! `headroom = hard - used` and `shortfall = headroom - need`; any negative
//! dimension denies the change. Names without a hard limit are not
//! constrained, and a namespace without quota objects admits everything.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use scaler_core::{ResourceList, ScalingItem};

use crate::error::QuotaResult;

/// Hard limits and current usage of one quota object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub name: String,
    pub hard: ResourceList,
    pub used: ResourceList,
}

/// Boxed future returned by [`QuotaSource::quotas`].
pub type QuotaFuture<'a> = Pin<Box<dyn Future<Output = QuotaResult<Vec<QuotaStatus>>> + Send + 'a>>;

/// Where the gate reads namespace quotas from.
pub trait QuotaSource: Send + Sync {
    /// All quota objects of `namespace`, with their hard and used amounts.
    fn quotas<'a>(&'a self, namespace: &'a str) -> QuotaFuture<'a>;
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    /// Quota object that denied the change.
    pub quota: Option<String>,
    /// Negative dimensions of `headroom - need` for the denying quota.
    pub shortfall: ResourceList,
}

impl Admission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            quota: None,
            shortfall: ResourceList::new(),
        }
    }
}

/// Translate per-replica limits into quota keys and multiply by `replicas`.
pub fn needed_resources(item: &ScalingItem, replicas: i32) -> ResourceList {
    let replicas = i64::from(replicas.max(0));
    item.resources
        .limits
        .iter()
        .filter_map(|(name, q)| match name {
            "cpu" => Some(("limits.cpu".to_string(), q * replicas)),
            "memory" => Some(("limits.memory".to_string(), q * replicas)),
            _ => None,
        })
        .collect()
}

/// Whether a change bypasses the gate.
///
/// Workloads that allow autoscaling are never blocked from holding or
/// lowering their replica count; scale-ups are still gated.
pub fn is_exempt(item: &ScalingItem, replicas: i32) -> bool {
    item.allows_autoscaling() && replicas <= item.spec_replicas
}

/// Admission control over a [`QuotaSource`].
#[derive(Clone)]
pub struct QuotaGate {
    source: Arc<dyn QuotaSource>,
}

impl QuotaGate {
    pub fn new(source: Arc<dyn QuotaSource>) -> Self {
        Self { source }
    }

    /// Check `needed` against every quota object of `namespace`.
    ///
    /// Source errors propagate: without a snapshot nothing is admitted.
    pub async fn admit(&self, namespace: &str, needed: &ResourceList) -> QuotaResult<Admission> {
        let quotas = self.source.quotas(namespace).await?;

        for quota in &quotas {
            let headroom = quota.hard.sub(&quota.used).restrict_to(&quota.hard);
            let shortfall = headroom.sub(needed).restrict_to(&quota.hard).negative();

            if !shortfall.is_empty() {
                info!(
                    %namespace,
                    quota = %quota.name,
                    needed = %needed,
                    shortfall = %shortfall,
                    "quota denies change"
                );
                return Ok(Admission {
                    allowed: false,
                    quota: Some(quota.name.clone()),
                    shortfall,
                });
            }
        }

        debug!(%namespace, needed = %needed, quotas = quotas.len(), "quota admits change");
        Ok(Admission::allowed())
    }

    /// Check a single workload moving to `replicas`.
    pub async fn admit_item(&self, item: &ScalingItem, replicas: i32) -> QuotaResult<Admission> {
        if is_exempt(item, replicas) {
            debug!(item = %item.key(), replicas, "quota gate skipped for autoscaling workload");
            return Ok(Admission::allowed());
        }
        self.admit(&item.namespace, &needed_resources(item, replicas))
            .await
    }

    /// Check a set of changes in one namespace as a unit.
    ///
    /// The need of every non-exempt change is summed and compared against
    /// one quota snapshot, so the whole batch is approved or denied together.
    pub async fn admit_batch(
        &self,
        namespace: &str,
        changes: &[(&ScalingItem, i32)],
    ) -> QuotaResult<Admission> {
        let needed = changes
            .iter()
            .filter(|(item, replicas)| !is_exempt(item, *replicas))
            .fold(ResourceList::new(), |acc, (item, replicas)| {
                acc.add(&needed_resources(item, *replicas))
            });

        if needed.is_empty() {
            return Ok(Admission::allowed());
        }
        self.admit(namespace, &needed).await
    }
}
