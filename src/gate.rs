//! Pre-dispatch check against the block records written by the detector.

use crate::config::Config;
use crate::policy::{block_key, Subject, TrustedSet};
use crate::store::ExpiringStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status code sent to blocked clients.
pub const REJECT_STATUS: u16 = 403;

/// Body sent to blocked clients.
pub const REJECT_BODY: &str = "ScanForbidden";

/// Outcome of the gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Continue to the application.
    Allow,
    /// Stop here and answer with the fixed rejection.
    Reject,
}

impl Decision {
    pub fn is_reject(&self) -> bool {
        matches!(self, Decision::Reject)
    }

    /// Status code for a rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            Decision::Allow => None,
            Decision::Reject => Some(REJECT_STATUS),
        }
    }

    /// Body for a rejection.
    pub fn body(&self) -> Option<&'static str> {
        match self {
            Decision::Allow => None,
            Decision::Reject => Some(REJECT_BODY),
        }
    }
}

/// Read-only gate in front of the application.
pub struct ScanGate {
    store: Arc<dyn ExpiringStore>,
    trusted: TrustedSet,
    log_blocked: bool,
}

impl ScanGate {
    pub fn new(store: Arc<dyn ExpiringStore>, trusted: TrustedSet) -> Self {
        Self {
            store,
            trusted,
            log_blocked: true,
        }
    }

    /// Create a gate from loaded configuration.
    pub fn from_config(config: &Config, store: Arc<dyn ExpiringStore>) -> Self {
        Self {
            log_blocked: config.settings.log_blocked,
            ..Self::new(store, TrustedSet::from_strings(&config.trusted))
        }
    }

    /// Check for a live block record.
    ///
    /// Absent and trusted identifiers return false without a store lookup.
    /// Store errors also return false so an outage never locks clients out.
    pub async fn is_blocked(&self, identifier: Option<&str>) -> bool {
        let ip = match self.trusted.classify(identifier) {
            Subject::Tracked(ip) => ip,
            Subject::Trusted(ip) => {
                debug!(ip = %ip, "Trusted client, skipping scan check");
                return false;
            }
            Subject::Absent => return false,
        };

        match self.store.has(&block_key(&ip)).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(
                    ip = %ip,
                    store = self.store.name(),
                    error = %e,
                    "Block lookup failed, allowing request"
                );
                false
            }
        }
    }

    /// Decide whether a request may proceed.
    pub async fn check(&self, identifier: Option<&str>) -> Decision {
        if !self.is_blocked(identifier).await {
            return Decision::Allow;
        }

        if self.log_blocked {
            info!(ip = identifier.unwrap_or_default(), "Rejecting blocked client");
        }
        Decision::Reject
    }
}
