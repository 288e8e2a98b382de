//! Not-found recorder and block promotion.
//!
//! Each not-found outcome bumps a per-IP counter whose TTL restarts on every
//! write. Once the counter is strictly above the threshold a block record is
//! written with its own, independent TTL. Store failures are logged and
//! dropped: detection is best-effort and never fails the request.

use crate::config::{Config, DetectionConfig};
use crate::policy::{block_key, count_key, parse_identifier, Subject, TrustedSet};
use crate::store::ExpiringStore;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records not-found outcomes and promotes noisy clients to blocked.
pub struct ScanDetector {
    store: Arc<dyn ExpiringStore>,
    detection: DetectionConfig,
    trusted: TrustedSet,
    log_blocked: bool,
}

impl ScanDetector {
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        detection: DetectionConfig,
        trusted: TrustedSet,
    ) -> Self {
        Self {
            store,
            detection,
            trusted,
            log_blocked: true,
        }
    }

    /// Create a detector from loaded configuration.
    pub fn from_config(config: &Config, store: Arc<dyn ExpiringStore>) -> Self {
        Self {
            log_blocked: config.settings.log_blocked,
            ..Self::new(
                store,
                config.detection.clone(),
                TrustedSet::from_strings(&config.trusted),
            )
        }
    }

    pub fn detection(&self) -> &DetectionConfig {
        &self.detection
    }

    pub fn trusted(&self) -> &TrustedSet {
        &self.trusted
    }

    pub fn store(&self) -> &Arc<dyn ExpiringStore> {
        &self.store
    }

    fn tracked(&self, identifier: Option<&str>) -> Option<IpAddr> {
        match self.trusted.classify(identifier) {
            Subject::Tracked(ip) => Some(ip),
            Subject::Trusted(_) | Subject::Absent => None,
        }
    }

    /// Count one not-found outcome, restarting the counter window.
    pub async fn record_attempt(&self, identifier: Option<&str>) {
        let Some(ip) = self.tracked(identifier) else {
            return;
        };

        match self
            .store
            .increment(&count_key(&ip), self.detection.count_window())
            .await
        {
            Ok(count) => debug!(ip = %ip, count, "Recorded not-found attempt"),
            Err(e) => warn!(
                ip = %ip,
                store = self.store.name(),
                error = %e,
                "Failed to record not-found attempt"
            ),
        }
    }

    /// Block the identifier if its counter is above the threshold.
    ///
    /// Returns true when a block record was written.
    pub async fn check_and_block(&self, identifier: Option<&str>) -> bool {
        let Some(ip) = self.tracked(identifier) else {
            return false;
        };

        let count = match self.store.get(&count_key(&ip)).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to read attempt counter");
                return false;
            }
        };

        if count <= self.detection.threshold {
            return false;
        }

        let blocked_at = chrono::Utc::now().timestamp().max(0) as u64;
        match self
            .store
            .set(&block_key(&ip), blocked_at, self.detection.block_duration())
            .await
        {
            Ok(()) => {
                if self.log_blocked {
                    info!(
                        ip = %ip,
                        count,
                        threshold = self.detection.threshold,
                        duration_secs = self.detection.block_duration_seconds,
                        "Blocking scanning client"
                    );
                }
                true
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to write block record");
                false
            }
        }
    }

    /// Handle a not-found outcome: record it, then evaluate the threshold.
    pub async fn on_not_found(&self, identifier: Option<&str>) -> bool {
        self.record_attempt(identifier).await;
        self.check_and_block(identifier).await
    }

    /// Check for a live block record. Store errors read as not blocked.
    pub async fn is_blocked(&self, identifier: Option<&str>) -> bool {
        let Some(ip) = self.tracked(identifier) else {
            return false;
        };

        self.store.has(&block_key(&ip)).await.unwrap_or_else(|e| {
            warn!(ip = %ip, error = %e, "Block lookup failed, allowing");
            false
        })
    }

    /// Remove a block record. Returns whether one existed.
    pub async fn unblock(&self, identifier: &str) -> bool {
        let Some(ip) = parse_identifier(identifier) else {
            return false;
        };

        match self.store.delete(&block_key(&ip)).await {
            Ok(removed) => {
                if removed {
                    info!(ip = %ip, "Block removed");
                }
                removed
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to remove block record");
                false
            }
        }
    }

    /// Remove an attempt counter. Returns whether one existed.
    pub async fn reset_count(&self, identifier: &str) -> bool {
        let Some(ip) = parse_identifier(identifier) else {
            return false;
        };

        self.store.delete(&count_key(&ip)).await.unwrap_or_else(|e| {
            warn!(ip = %ip, error = %e, "Failed to reset attempt counter");
            false
        })
    }

    /// Current attempt count, 0 when absent, trusted or unreadable.
    pub async fn get_count(&self, identifier: &str) -> u64 {
        let Some(ip) = self.tracked(Some(identifier)) else {
            return 0;
        };

        match self.store.get(&count_key(&ip)).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to read attempt counter");
                0
            }
        }
    }

    /// Always 0; block records expire on their own.
    pub fn cleanup_expired_blocks(&self) -> u64 {
        0
    }

    /// Always 0; there are no persistent records.
    pub fn cleanup_old_records(&self, _days: u32) -> u64 {
        0
    }
}
