//! Scaling states — definitions, priority resolution, and per-item targets.
//!
//! A cluster declares an ordered set of named states. A cluster-wide and a
//! namespace-wide selection each name one of them; the one with the lower
//! priority number wins. Each workload then maps the winning state name to
//! a replica count through its `scaler/state-<name>-replicas` annotations.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{
    DEFAULT_STATE, STATE_ANNOTATION_PREFIX, STATE_ANNOTATION_SUFFIX, ScalingItem,
};

/// A state declared once per cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub priority: i32,
}

impl StateDefinition {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            priority,
        }
    }
}

/// A resolved state. The default value means "no state selected".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub priority: i32,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl From<&StateDefinition> for State {
    fn from(def: &StateDefinition) -> Self {
        Self {
            name: def.name.clone(),
            priority: def.priority,
        }
    }
}

/// Reject definition lists that declare a name twice.
pub fn validate_definitions(definitions: &[StateDefinition]) -> CoreResult<()> {
    let mut seen = HashSet::new();
    for def in definitions {
        if !seen.insert(def.name.as_str()) {
            return Err(CoreError::DuplicateState(def.name.clone()));
        }
    }
    Ok(())
}

/// Look up a state by name. Unknown or absent names yield the empty state.
pub fn find_state(name: Option<&str>, definitions: &[StateDefinition]) -> State {
    name.and_then(|n| definitions.iter().find(|d| d.name == n))
        .map(State::from)
        .unwrap_or_default()
}

/// Pick the state that takes precedence.
///
/// An empty operand yields the other one. Otherwise the smaller priority
/// number wins and a tie returns `b`.
pub fn prioritize(a: State, b: State) -> State {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    if a.priority < b.priority { a } else { b }
}

/// Resolve the effective state from the cluster and namespace selections.
pub fn resolve_state(
    cluster: Option<&str>,
    namespace: Option<&str>,
    definitions: &[StateDefinition],
) -> State {
    prioritize(
        find_state(cluster, definitions),
        find_state(namespace, definitions),
    )
}

/// Replica count for one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReplicas {
    pub name: String,
    pub replicas: i32,
}

/// Per-workload `state name -> replicas` map parsed from annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateReplicaMap(BTreeMap<String, i32>);

impl StateReplicaMap {
    /// Parse every `scaler/state-<name>-replicas` annotation.
    ///
    /// Unrelated annotations are ignored; a value that is not a
    /// non-negative decimal integer fails the whole parse.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> CoreResult<Self> {
        let mut map = BTreeMap::new();

        for (key, value) in annotations {
            let Some(state) = state_name(key) else {
                continue;
            };
            let replicas = value
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|replicas| *replicas >= 0)
                .ok_or_else(|| CoreError::Replicas {
                    key: key.clone(),
                    value: value.clone(),
                })?;
            map.insert(state.to_string(), replicas);
        }

        Ok(Self(map))
    }

    pub fn get(&self, state: &str) -> Option<StateReplicas> {
        self.0.get(state).map(|replicas| StateReplicas {
            name: state.to_string(),
            replicas: *replicas,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// State name of a `scaler/state-<name>-replicas` key.
fn state_name(key: &str) -> Option<&str> {
    key.strip_prefix(STATE_ANNOTATION_PREFIX)?
        .strip_suffix(STATE_ANNOTATION_SUFFIX)
        .filter(|name| !name.is_empty())
}

/// Compute the replica target of a workload for the resolved state.
///
/// Workloads that are not opted in always look up the `default` state.
pub fn target_replicas(item: &ScalingItem, state: &State) -> CoreResult<StateReplicas> {
    let lookup = if item.is_opted_in() {
        state.name.as_str()
    } else {
        DEFAULT_STATE
    };

    let map = StateReplicaMap::from_annotations(&item.annotations)?;
    map.get(lookup)
        .ok_or_else(|| CoreError::MissingStateReplicas {
            item: item.key().to_string(),
            state: lookup.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ALLOW_AUTOSCALING_ANNOTATION, OPT_IN_LABEL, ScalingItemType};

    fn definitions() -> Vec<StateDefinition> {
        vec![StateDefinition::new("bau", 10), StateDefinition::new("peak", 5)]
    }

    fn state(name: &str, priority: i32) -> State {
        State {
            name: name.to_string(),
            priority,
        }
    }

    fn item(opted_in: bool, annotations: &[(&str, &str)]) -> ScalingItem {
        let mut item = ScalingItem::new(ScalingItemType::Deployment, "shop", "api");
        item.labels
            .insert(OPT_IN_LABEL.into(), opted_in.to_string());
        for (k, v) in annotations {
            item.annotations.insert(k.to_string(), v.to_string());
        }
        item
    }

    #[test]
    fn prioritize_is_symmetric_for_distinct_priorities() {
        let a = state("bau", 10);
        let b = state("peak", 5);
        assert_eq!(prioritize(a.clone(), b.clone()), prioritize(b.clone(), a));
        assert_eq!(prioritize(state("x", 1), state("y", 2)).name, "x");
    }

    #[test]
    fn prioritize_empty_yields_other() {
        let x = state("peak", 5);
        assert_eq!(prioritize(State::default(), x.clone()), x);
        assert_eq!(prioritize(x.clone(), State::default()), x);
        assert!(prioritize(State::default(), State::default()).is_empty());
    }

    #[test]
    fn prioritize_tie_returns_second() {
        let a = state("left", 3);
        let b = state("right", 3);
        assert_eq!(prioritize(a, b).name, "right");
    }

    #[test]
    fn find_state_unknown_is_empty() {
        assert!(find_state(Some("holiday"), &definitions()).is_empty());
        assert!(find_state(None, &definitions()).is_empty());
        assert_eq!(find_state(Some("peak"), &definitions()).priority, 5);
    }

    #[test]
    fn resolve_prefers_lower_priority_number() {
        let resolved = resolve_state(Some("bau"), Some("peak"), &definitions());
        assert_eq!(resolved.name, "peak");

        let resolved = resolve_state(Some("bau"), None, &definitions());
        assert_eq!(resolved.name, "bau");

        let resolved = resolve_state(Some("bau"), Some("unknown"), &definitions());
        assert_eq!(resolved.name, "bau");
    }

    #[test]
    fn duplicate_definitions_rejected() {
        let mut defs = definitions();
        assert!(validate_definitions(&defs).is_ok());
        defs.push(StateDefinition::new("bau", 1));
        assert!(matches!(
            validate_definitions(&defs),
            Err(CoreError::DuplicateState(name)) if name == "bau"
        ));
    }

    #[test]
    fn parses_replica_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert("scaler/state-peak-replicas".to_string(), "5".to_string());
        annotations.insert("scaler/state-bau-replicas".to_string(), "2".to_string());
        annotations.insert("app.kubernetes.io/name".to_string(), "api".to_string());

        let map = StateReplicaMap::from_annotations(&annotations).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("peak"),
            Some(StateReplicas {
                name: "peak".into(),
                replicas: 5
            })
        );
        assert_eq!(map.get("bau").unwrap().replicas, 2);
    }

    #[test]
    fn non_integer_annotation_fails() {
        let mut annotations = BTreeMap::new();
        annotations.insert("scaler/state-peak-replicas".to_string(), "five".to_string());
        assert!(matches!(
            StateReplicaMap::from_annotations(&annotations),
            Err(CoreError::Replicas { .. })
        ));
    }

    #[test]
    fn state_names_may_contain_dashes() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "scaler/state-black-friday-replicas".to_string(),
            "12".to_string(),
        );
        let map = StateReplicaMap::from_annotations(&annotations).unwrap();
        assert_eq!(map.get("black-friday").unwrap().replicas, 12);
    }

    #[test]
    fn target_uses_resolved_state_when_opted_in() {
        let item = item(
            true,
            &[
                ("scaler/state-bau-replicas", "4"),
                ("scaler/state-default-replicas", "1"),
            ],
        );
        let target = target_replicas(&item, &state("bau", 10)).unwrap();
        assert_eq!(target.name, "bau");
        assert_eq!(target.replicas, 4);
    }

    #[test]
    fn target_forced_to_default_when_opted_out() {
        let item = item(
            false,
            &[
                ("scaler/state-peak-replicas", "9"),
                ("scaler/state-default-replicas", "1"),
            ],
        );
        let target = target_replicas(&item, &state("peak", 5)).unwrap();
        assert_eq!(target.name, DEFAULT_STATE);
        assert_eq!(target.replicas, 1);
    }

    #[test]
    fn missing_state_entry_is_an_error() {
        let item = item(true, &[("scaler/state-bau-replicas", "4")]);
        assert!(matches!(
            target_replicas(&item, &state("peak", 5)),
            Err(CoreError::MissingStateReplicas { state, .. }) if state == "peak"
        ));
    }

    #[test]
    fn autoscaling_annotation_does_not_change_target() {
        let mut item = item(true, &[("scaler/state-bau-replicas", "4")]);
        item.annotations
            .insert(ALLOW_AUTOSCALING_ANNOTATION.into(), "true".into());

        item.spec_replicas = 7;
        assert_eq!(target_replicas(&item, &state("bau", 10)).unwrap().replicas, 4);

        item.spec_replicas = 2;
        assert_eq!(target_replicas(&item, &state("bau", 10)).unwrap().replicas, 4);
    }

    #[test]
    fn negative_annotation_fails() {
        let mut annotations = BTreeMap::new();
        annotations.insert("scaler/state-bau-replicas".to_string(), "-2".to_string());
        assert!(matches!(
            StateReplicaMap::from_annotations(&annotations),
            Err(CoreError::Replicas { value, .. }) if value == "-2"
        ));
    }

    #[test]
    fn malformed_state_keys_are_ignored() {
        let mut annotations = BTreeMap::new();
        annotations.insert("scaler/state--replicas".to_string(), "3".to_string());
        annotations.insert("scaler/state-replicas".to_string(), "3".to_string());
        annotations.insert("scaler/state-bau-count".to_string(), "3".to_string());
        assert!(StateReplicaMap::from_annotations(&annotations).unwrap().is_empty());
    }
}
