//! Wall-clock helpers for run metadata.

use std::time::{Duration, Instant, SystemTime};

/// RFC 3339 timestamp for `startedAt`/`finishedAt` fields.
pub fn wall_time_iso_utc() -> String {
    let dt: time::OffsetDateTime = SystemTime::now().into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Optional wall-clock budget for a run.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() >= limit)
    }
}
