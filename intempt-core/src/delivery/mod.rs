//! Delivery to the Intempt collection endpoint
//!
//! ## Architecture
//!
//! - [`payload`] - wire format of one batch request
//! - [`transport`] - the `send(request)` capability and its HTTP implementation
//! - [`dispatcher`] - background worker that drains the queue in order
//!
//! Responses are classified as:
//! - 2xx: delivered
//! - 5xx, timeout, connectivity loss: transient, retried with backoff
//! - anything else (4xx): permanent, dropped at once

pub mod dispatcher;
pub mod payload;
pub mod transport;

pub use dispatcher::{Backoff, DeliveryDispatcher, DispatcherHandle};
pub use payload::{BatchRequest, WireEvent};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
