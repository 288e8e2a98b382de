//! Scan Detection Agent for Zentinel.
//!
//! Tracks how often each client IP hits "not found" and temporarily blocks
//! clients that probe faster than a configured rate.
//!
//! # Features
//!
//! - **Not-found counting** - Per-IP counter, window restarts on every 404
//! - **Automatic blocking** - `403 ScanForbidden` once the counter exceeds the threshold
//! - **TTL expiry** - Counters and blocks live in an expiring store, no sweeps
//! - **Trusted clients** - Loopback (or configured IPs/CIDRs) are never counted
//! - **Fail-open** - Store errors never turn into rejected requests
//! - **actix-web middleware** - Gate before dispatch, detector after a 404
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!
//! detection:
//!   threshold: 20
//!   count_window_seconds: 60
//!   block_duration_seconds: 300
//!
//! trusted:
//!   - "127.0.0.1"
//!   - "::1"
//! ```

pub mod cleanup;
pub mod config;
pub mod detector;
pub mod gate;
pub mod middleware;
pub mod policy;
pub mod store;

pub use config::Config;
pub use detector::ScanDetector;
pub use gate::{Decision, ScanGate};
pub use middleware::ScanProtection;
pub use store::{ExpiringStore, MemoryStore, StoreError};
