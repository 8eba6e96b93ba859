//! Sync configuration shared by all providers.

use std::time::Duration;

use calbridge_core::TimeWindow;
use chrono::{DateTime, Utc};

/// How far busytimes are materialized around "now", and how many
/// occurrences one recurring event may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub behind: Duration,
    pub ahead: Duration,
    pub occurrence_limit: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            behind: Duration::from_secs(30 * 24 * 60 * 60),
            ahead: Duration::from_secs(365 * 24 * 60 * 60),
            occurrence_limit: 365,
        }
    }
}

impl SyncConfig {
    pub fn with_behind(mut self, behind: Duration) -> Self {
        self.behind = behind;
        self
    }

    pub fn with_ahead(mut self, ahead: Duration) -> Self {
        self.ahead = ahead;
        self
    }

    pub fn with_occurrence_limit(mut self, limit: u16) -> Self {
        self.occurrence_limit = limit;
        self
    }

    /// The materialization window around `now`.
    pub fn window_at(&self, now: DateTime<Utc>) -> TimeWindow {
        let behind = chrono::Duration::from_std(self.behind).unwrap_or(chrono::Duration::zero());
        let ahead = chrono::Duration::from_std(self.ahead).unwrap_or(chrono::Duration::zero());
        TimeWindow::around(now, behind, ahead)
    }

    pub fn window(&self) -> TimeWindow {
        self.window_at(Utc::now())
    }
}
