//! # intempt-core
//!
//! Client SDK for the Intempt analytics platform.
//!
//! This library provides:
//! - Event capture into a bounded, persistent queue
//! - Batched, ordered delivery with retry and backoff
//! - A durable visitor identity with merged profile properties
//! - Debounced beacon region enter/exit monitoring
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Capture:** public calls validate input and stamp the visitor id on the
//!   caller's thread
//! - **Queue:** a bounded FIFO that drops its oldest entry when full
//! - **Delivery:** one background worker per client sends batches in order,
//!   retrying transient failures before anything queued behind them
//!
//! ## Example
//!
//! ```rust,no_run
//! use intempt_core::{IntemptClient, Properties};
//! use serde_json::json;
//!
//! let client = IntemptClient::new("org-id", "tracker-id", "token").expect("valid credentials");
//! client
//!     .add_event(Properties::keyed([("sku", json!("A-1"))]), "purchases")
//!     .expect("valid event");
//! println!("visitor {}", client.visitor_id());
//! ```

// Re-export commonly used items at the crate root
pub use client::{shared_client, shared_client_with, ClientBuilder, IntemptClient, SDK_VERSION};
pub use config::Config;
pub use error::{Error, NetworkErrorKind, Result};
pub use logging::{disable_logging, enable_logging, is_logging_enabled};
pub use region::{LocationProvider, RegionObserver};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::*;

// Public modules
pub mod client;
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod queue;
pub mod region;
pub mod store;
pub mod types;
