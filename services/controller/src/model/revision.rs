//! Revision records: immutable snapshots of an instance template.

use gamefleet_events::ObjectKey;
use gamefleet_reconcile::canonical_json;
use serde::{Deserialize, Serialize};

use super::instance::InstanceTemplate;
use super::meta::ObjectMeta;
use crate::error::ControllerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub meta: ObjectMeta,
    /// Canonical patch `{"spec":{"template":...}}`.
    pub data: serde_json::Value,
    /// Sequence number; the highest is the newest.
    pub revision: i64,
}

impl Revision {
    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Builds the patch document stored in a revision.
    pub fn data_for(template: &InstanceTemplate) -> Result<serde_json::Value, ControllerError> {
        Ok(serde_json::json!({
            "spec": { "template": serde_json::to_value(template)? }
        }))
    }

    /// Decodes the template back out of the stored patch.
    pub fn template(&self) -> Result<InstanceTemplate, ControllerError> {
        let template = self
            .data
            .pointer("/spec/template")
            .cloned()
            .ok_or_else(|| {
                ControllerError::MissingField(format!("revision {} has no template", self.name()))
            })?;
        Ok(serde_json::from_value(template)?)
    }

    /// Content equality on the canonical payload.
    pub fn same_content(&self, data: &serde_json::Value) -> bool {
        canonical_json(&self.data) == canonical_json(data)
    }
}
