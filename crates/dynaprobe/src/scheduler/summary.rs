use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::CheckStatus;

/// Tally of one pass
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub invalid: usize,
    /// Events accepted by the publisher
    pub published: usize,
}

impl PassSummary {
    pub fn new(pass_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id,
            started_at,
            elapsed: Duration::ZERO,
            total: 0,
            passed: 0,
            failed: 0,
            timed_out: 0,
            invalid: 0,
            published: 0,
        }
    }

    pub fn record(&mut self, status: CheckStatus) {
        self.total += 1;
        match status {
            CheckStatus::Passed => self.passed += 1,
            CheckStatus::Failed => self.failed += 1,
            CheckStatus::TimedOut => self.timed_out += 1,
            CheckStatus::Invalid => self.invalid += 1,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} checks: {} passed, {} failed, {} timed out, {} invalid ({} published)",
            self.total, self.passed, self.failed, self.timed_out, self.invalid, self.published
        )
    }
}
