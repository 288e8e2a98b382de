//! `cleanup` maintenance command.
//!
//! Block records and counters expire inside the store, so there is nothing to
//! purge. The command is kept so existing cron jobs and runbooks that call it
//! keep working; it reports the expiry model and exits successfully.

use crate::detector::ScanDetector;
use std::io::Write;

/// Counts reported by the cleanup command. Both are always 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub expired_blocks: u64,
    pub old_records: u64,
}

impl CleanupSummary {
    pub fn is_empty(&self) -> bool {
        self.expired_blocks == 0 && self.old_records == 0
    }
}

/// Run the cleanup command, writing its report to `out`.
pub fn run_cleanup<W: Write>(detector: &ScanDetector, mut out: W) -> anyhow::Result<CleanupSummary> {
    let detection = detector.detection();

    writeln!(out, "Scan detection cleanup (store-based)")?;
    writeln!(out)?;
    writeln!(out, "Store layout:")?;
    writeln!(
        out,
        "  - Block records expire automatically after {}s",
        detection.block_duration_seconds
    )?;
    writeln!(
        out,
        "  - Not-found counters expire automatically after {}s without activity",
        detection.count_window_seconds
    )?;
    writeln!(out, "  - No persistent storage, nothing accumulates")?;
    writeln!(out, "  - Store backend: {}", detector.store().name())?;
    writeln!(out)?;

    let summary = CleanupSummary {
        expired_blocks: detector.cleanup_expired_blocks(),
        old_records: detector.cleanup_old_records(30),
    };

    if summary.is_empty() {
        writeln!(out, "Nothing to clean up: all entries expire on their own")?;
    } else {
        writeln!(
            out,
            "Removed {} expired blocks and {} old records",
            summary.expired_blocks, summary.old_records
        )?;
    }

    Ok(summary)
}
