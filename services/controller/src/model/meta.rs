//! Object metadata, owner references, and label selectors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gamefleet_events::ObjectKey;
use gamefleet_id::{ObjectUid, ResourceVersion};
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Well-known label and annotation keys.
pub mod labels {
    /// Name of the owning game deployment.
    pub const DEPLOYMENT: &str = "gamefleet.io/deployment";
    /// Revision name an instance or hook run belongs to.
    pub const REVISION_HASH: &str = "gamefleet.io/revision-hash";
    /// Identity token of an instance.
    pub const INSTANCE_ID: &str = "gamefleet.io/instance-id";
    /// Why a hook run exists (`canary-step` or `pre-delete`).
    pub const HOOK_TYPE: &str = "gamefleet.io/hook-type";
    /// Canary step a hook run verifies.
    pub const STEP_INDEX: &str = "gamefleet.io/step-index";

    pub const HOOK_TYPE_CANARY: &str = "canary-step";
    pub const HOOK_TYPE_PRE_DELETE: &str = "pre-delete";

    /// Annotation carrying the last in-place update record.
    pub const INPLACE_UPDATE_STATE: &str = "gamefleet.io/inplace-update-state";
}

/// Metadata common to every cluster object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,

    /// Assigned by the cluster on creation.
    #[serde(default)]
    pub uid: ObjectUid,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    /// Optimistic-concurrency token; `UNSET` skips the check on update.
    #[serde(default)]
    pub resource_version: ResourceVersion,

    /// Incremented by the cluster on every spec change.
    #[serde(default)]
    pub generation: i64,

    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Creates metadata with just a namespace and name.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Work-queue key of the object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Value of a label, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The owner reference with `controller` set, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// True if the object is controlled by the object with `uid`.
    pub fn is_controlled_by(&self, uid: &ObjectUid) -> bool {
        self.controller_ref().is_some_and(|r| &r.uid == uid)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Key of the game deployment owning this object: its controller
    /// reference, falling back to the deployment label.
    pub fn deployment_key(&self) -> Option<ObjectKey> {
        let name = match self.controller_ref() {
            Some(owner) if owner.kind == super::GAME_DEPLOYMENT_KIND => owner.name.as_str(),
            _ => self.label(labels::DEPLOYMENT)?,
        };
        Some(ObjectKey::new(self.namespace.clone(), name))
    }
}

/// Weak back-reference from an owned object to its owner.
///
/// Owners are resolved by looking up `(namespace, name)`; the `uid` guards
/// against a same-named replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: ObjectUid,
    #[serde(default)]
    pub controller: bool,
}

// =============================================================================
// Label Selectors
// =============================================================================

/// Set-based selector operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One set-based selector requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Selector as written in a deployment spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Selector matching exactly the given labels.
    pub fn from_labels<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }
}

/// A validated label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<LabelSelectorRequirement>,
}

impl Selector {
    /// Validates a selector. An empty selector is rejected: it would claim
    /// every instance in the namespace.
    pub fn parse(selector: &LabelSelector) -> Result<Self, ControllerError> {
        let mut requirements: Vec<LabelSelectorRequirement> = selector
            .match_labels
            .iter()
            .map(|(k, v)| LabelSelectorRequirement {
                key: k.clone(),
                operator: SelectorOperator::In,
                values: vec![v.clone()],
            })
            .collect();
        requirements.extend(selector.match_expressions.iter().cloned());

        if requirements.is_empty() {
            return Err(ControllerError::InvalidSelector(
                "selector must not be empty".to_string(),
            ));
        }

        for req in &mut requirements {
            validate_label_key(&req.key)?;
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(ControllerError::InvalidSelector(format!(
                        "{:?} requirement on '{}' needs at least one value",
                        req.operator, req.key
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(ControllerError::InvalidSelector(format!(
                        "{:?} requirement on '{}' must not have values",
                        req.operator, req.key
                    )));
                }
                _ => {}
            }
            req.values.sort();
            req.values.dedup();
        }
        requirements.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(Self { requirements })
    }

    /// Selector over exact label matches; used for objects the controller
    /// labels itself, so it never fails validation for non-empty input.
    pub fn for_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut requirements: Vec<LabelSelectorRequirement> = labels
            .into_iter()
            .map(|(k, v)| LabelSelectorRequirement {
                key: k.to_string(),
                operator: SelectorOperator::In,
                values: vec![v.to_string()],
            })
            .collect();
        requirements.sort_by(|a, b| a.key.cmp(&b.key));
        Self { requirements }
    }

    /// True if `labels` satisfy every requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| {
            let value = labels.get(&req.key);
            match req.operator {
                SelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
                SelectorOperator::NotIn => value.is_none_or(|v| !req.values.contains(v)),
                SelectorOperator::Exists => value.is_some(),
                SelectorOperator::DoesNotExist => value.is_none(),
            }
        })
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req.operator {
                SelectorOperator::In if req.values.len() == 1 => {
                    format!("{}={}", req.key, req.values[0])
                }
                SelectorOperator::In => format!("{} in ({})", req.key, req.values.join(",")),
                SelectorOperator::NotIn => format!("{} notin ({})", req.key, req.values.join(",")),
                SelectorOperator::Exists => req.key.clone(),
                SelectorOperator::DoesNotExist => format!("!{}", req.key),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

fn validate_label_key(key: &str) -> Result<(), ControllerError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    let valid_name = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    let valid_prefix = prefix.is_none_or(|p| {
        !p.is_empty()
            && p.len() <= 253
            && p.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.'))
    });

    if valid_name && valid_prefix {
        Ok(())
    } else {
        Err(ControllerError::InvalidSelector(format!(
            "invalid label key '{key}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches_labels_and_expressions() {
        let selector = Selector::parse(&LabelSelector {
            match_labels: labels(&[("app", "lobby")]),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "tier".into(),
                    operator: SelectorOperator::In,
                    values: vec!["gold".into(), "silver".into()],
                },
                LabelSelectorRequirement {
                    key: "drain".into(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        })
        .unwrap();

        assert!(selector.matches(&labels(&[("app", "lobby"), ("tier", "gold")])));
        assert!(!selector.matches(&labels(&[("app", "lobby"), ("tier", "bronze")])));
        assert!(!selector.matches(&labels(&[
            ("app", "lobby"),
            ("tier", "gold"),
            ("drain", "yes")
        ])));
    }

    #[test]
    fn test_selector_string_is_canonical() {
        let selector = Selector::parse(&LabelSelector {
            match_labels: labels(&[("region", "eu"), ("app", "lobby")]),
            match_expressions: vec![LabelSelectorRequirement {
                key: "canary".into(),
                operator: SelectorOperator::Exists,
                values: vec![],
            }],
        })
        .unwrap();
        assert_eq!(selector.to_string(), "app=lobby,canary,region=eu");
    }

    #[test]
    fn test_invalid_selectors_rejected() {
        assert!(Selector::parse(&LabelSelector::default()).is_err());

        let empty_in = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "app".into(),
                operator: SelectorOperator::In,
                values: vec![],
            }],
        };
        assert!(Selector::parse(&empty_in).is_err());

        let bad_key = LabelSelector::from_labels([("-app", "x")]);
        assert!(Selector::parse(&bad_key).is_err());

        let prefixed = LabelSelector::from_labels([("gamefleet.io/deployment", "x")]);
        assert!(Selector::parse(&prefixed).is_ok());
    }
}
