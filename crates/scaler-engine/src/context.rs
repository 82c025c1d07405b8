//! Engine context — configuration and collaborators built once at startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use scaler_core::{EngineConfig, ScalingItemType};
use scaler_quota::{QuotaGate, QuotaSource};
use scaler_registry::Registry;

use crate::catalog::StateCatalog;
use crate::error::EngineResult;
use crate::events::EventSink;
use crate::source::{AdapterSet, StateSource};

/// Parsed durations from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub poll_interval: Duration,
    pub step_timeout_slack: Duration,
    pub rectify_interval: Duration,
    pub reconcile_interval: Duration,
    pub conflict_backoff: Duration,
}

impl Timings {
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        Ok(Self {
            poll_interval: config.poll_interval()?,
            step_timeout_slack: config.step_timeout_slack()?,
            rectify_interval: config.rectify_interval()?,
            reconcile_interval: config.reconcile_interval()?,
            conflict_backoff: config.conflict_backoff()?,
        })
    }
}

/// Everything the scaler, reconciler, and sweep share.
///
/// Shared as `Arc<EngineContext>`; the registry inside lives as long as
/// the process.
pub struct EngineContext {
    pub config: EngineConfig,
    pub timings: Timings,
    pub registry: Registry,
    pub adapters: AdapterSet,
    pub catalog: StateCatalog,
    pub quota: QuotaGate,
    pub events: Arc<dyn EventSink>,
    pub started_at: Instant,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        adapters: AdapterSet,
        states: Arc<dyn StateSource>,
        quotas: Arc<dyn QuotaSource>,
        events: Arc<dyn EventSink>,
    ) -> EngineResult<Arc<Self>> {
        let timings = Timings::from_config(&config)?;
        info!(
            platform = ?config.platform,
            mode = ?config.scaling_mode,
            adapters = adapters.len(),
            "engine context initialized"
        );
        Ok(Arc::new(Self {
            config,
            timings,
            registry: Registry::new(),
            adapters,
            catalog: StateCatalog::new(states),
            quota: QuotaGate::new(quotas),
            events,
            started_at: Instant::now(),
        }))
    }

    /// Kinds that the platform supports and an adapter is registered for.
    pub fn enabled_kinds(&self) -> Vec<ScalingItemType> {
        self.config
            .platform
            .kinds()
            .into_iter()
            .filter(|kind| self.adapters.contains(*kind))
            .collect()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
