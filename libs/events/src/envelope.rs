//! Event envelope - the common wrapper for all change events.

use chrono::{DateTime, Utc};
use gamefleet_id::{EventId, ResourceVersion};
use serde::{Deserialize, Serialize};

use crate::{ChangeKind, EventError, ObjectKey, ResourceKind};

/// The event envelope - common metadata for all change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Globally monotonic event identifier.
    pub event_id: EventId,

    /// When the change was observed.
    pub occurred_at: DateTime<Utc>,

    /// What happened to the object.
    pub change: ChangeKind,

    /// Kind of the object.
    pub resource: ResourceKind,

    /// Namespaced name of the object.
    pub key: ObjectKey,

    /// Resource version of the observed state.
    pub resource_version: ResourceVersion,

    /// The observed object.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }

    /// Maps the payload, keeping the envelope metadata.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> EventEnvelope<Q> {
        EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            change: self.change,
            resource: self.resource,
            key: self.key,
            resource_version: self.resource_version,
            payload: f(self.payload),
        }
    }

    /// Returns true if this event reports the object as gone.
    pub fn is_deletion(&self) -> bool {
        self.change == ChangeKind::Deleted
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    change: Option<ChangeKind>,
    resource: Option<ResourceKind>,
    key: Option<ObjectKey>,
    resource_version: ResourceVersion,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            change: None,
            resource: None,
            key: None,
            resource_version: ResourceVersion::UNSET,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn change(mut self, change: ChangeKind) -> Self {
        self.change = Some(change);
        self
    }

    pub fn object(mut self, resource: ResourceKind, key: ObjectKey) -> Self {
        self.resource = Some(resource);
        self.key = Some(key);
        self
    }

    pub fn resource_version(mut self, version: ResourceVersion) -> Self {
        self.resource_version = version;
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope, failing if a required field is missing.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            change: self.change.ok_or(EventError::MissingField("change"))?,
            resource: self.resource.ok_or(EventError::MissingField("resource"))?,
            key: self.key.ok_or(EventError::MissingField("key"))?,
            resource_version: self.resource_version,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
