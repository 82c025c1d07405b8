//! State catalog — resolves the effective state of a namespace.

use std::sync::Arc;

use tracing::{debug, warn};

use scaler_core::{State, resolve_state, validate_definitions};

use crate::error::{EngineError, EngineResult};
use crate::source::StateSource;

/// Reads state selections and definitions from a [`StateSource`].
#[derive(Clone)]
pub struct StateCatalog {
    source: Arc<dyn StateSource>,
}

impl StateCatalog {
    pub fn new(source: Arc<dyn StateSource>) -> Self {
        Self { source }
    }

    /// Resolve the one state that applies to `namespace`.
    ///
    /// `NotFound` means there is nothing to act on this cycle: no
    /// definitions, no selection at all, or selections naming undefined
    /// states. `TooMany` means one scope has several selection objects.
    pub async fn resolve_namespace(&self, namespace: &str) -> EngineResult<State> {
        let definitions = self.source.definitions().await?;
        if definitions.is_empty() {
            return Err(EngineError::NotFound("no state definitions".to_string()));
        }
        validate_definitions(&definitions)?;

        let cluster = single("cluster", self.source.cluster_states().await?)?;
        let local = single("namespace", self.source.namespace_states(namespace).await?)?;
        if cluster.is_none() && local.is_none() {
            return Err(EngineError::NotFound(format!(
                "no cluster or namespace state selected for {namespace}"
            )));
        }

        let state = resolve_state(cluster.as_deref(), local.as_deref(), &definitions);
        if state.is_empty() {
            warn!(
                %namespace,
                cluster = ?cluster,
                namespace_state = ?local,
                "selected scaling states are not defined"
            );
            return Err(EngineError::NotFound(format!(
                "selected states for {namespace} are not defined"
            )));
        }

        debug!(%namespace, state = %state.name, priority = state.priority, "resolved scaling state");
        Ok(state)
    }
}

fn single(scope: &'static str, mut names: Vec<String>) -> EngineResult<Option<String>> {
    match names.len() {
        0 => Ok(None),
        1 => Ok(names.pop()),
        count => Err(EngineError::TooMany { scope, count }),
    }
}
