//! Per-client credentials and feature flags

use crate::error::{Error, Result};
use crate::types::AuthorizationLevel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Credentials and mutable flags for one client instance.
///
/// Credentials are fixed at construction. Geo-location starts enabled.
#[derive(Debug)]
pub struct ClientContext {
    org_id: String,
    tracker_id: String,
    token: String,
    geo_location_enabled: AtomicBool,
    /// Highest level forwarded to the platform so far
    requested_level: Mutex<Option<AuthorizationLevel>>,
}

impl ClientContext {
    /// Create a context, rejecting empty credentials
    pub fn new(
        org_id: impl Into<String>,
        tracker_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let org_id = org_id.into();
        let tracker_id = tracker_id.into();
        let token = token.into();

        for (name, value) in [
            ("organization id", &org_id),
            ("tracker id", &tracker_id),
            ("token", &token),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }

        Ok(Self {
            org_id,
            tracker_id,
            token,
            geo_location_enabled: AtomicBool::new(true),
            requested_level: Mutex::new(None),
        })
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn tracker_id(&self) -> &str {
        &self.tracker_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_geo_location_enabled(&self) -> bool {
        self.geo_location_enabled.load(Ordering::SeqCst)
    }

    /// Set the flag, returning the previous value
    pub(crate) fn set_geo_location_enabled(&self, enabled: bool) -> bool {
        self.geo_location_enabled.swap(enabled, Ordering::SeqCst)
    }

    /// Record an authorization request.
    ///
    /// Returns true when the level must be forwarded to the platform: only
    /// the first request for a level above everything requested so far.
    pub fn request_authorization(&self, level: AuthorizationLevel) -> bool {
        let mut requested = self.requested_level.lock();
        match *requested {
            Some(current) if current >= level => false,
            _ => {
                *requested = Some(level);
                true
            }
        }
    }

    pub fn requested_authorization(&self) -> Option<AuthorizationLevel> {
        *self.requested_level.lock()
    }
}
