//! Wire format for batch requests
//!
//! ```json
//! {
//!   "orgId": "...",
//!   "trackerId": "...",
//!   "visitorId": "...",
//!   "events": [
//!     { "collectionName": "purchases", "properties": {...}, "timestamp": "2026-..." }
//!   ]
//! }
//! ```
//!
//! The token travels in the `Authorization` header, not in the body.

use crate::context::ClientContext;
use crate::types::{Event, Properties};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One event as sent to the endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub collection_name: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        Self {
            collection_name: event.collection_name.clone(),
            properties: event.properties.clone(),
            timestamp: event.created_at,
        }
    }
}

/// A batch of events for one visitor, with the client's credentials
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub org_id: String,
    pub tracker_id: String,
    #[serde(skip)]
    pub token: String,
    pub visitor_id: Uuid,
    pub events: Vec<WireEvent>,
}

impl BatchRequest {
    /// Build a request from events that share one visitor id
    pub fn new(context: &ClientContext, visitor_id: Uuid, events: &[&Event]) -> Self {
        Self {
            org_id: context.org_id().to_string(),
            tracker_id: context.tracker_id().to_string(),
            token: context.token().to_string(),
            visitor_id,
            events: events.iter().map(|e| WireEvent::from(*e)).collect(),
        }
    }
}
