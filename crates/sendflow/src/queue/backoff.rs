use chrono::{DateTime, Duration, Utc};

/// Fixed retry schedule: the n-th retry waits `table[n - 1]` seconds, and
/// every retry past the end of the table reuses the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    table_secs: Vec<i64>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            table_secs: vec![60, 5 * 60, 30 * 60],
        }
    }
}

impl BackoffSchedule {
    /// An empty table falls back to the default schedule.
    pub fn new(table_secs: Vec<i64>) -> Self {
        if table_secs.is_empty() {
            return Self::default();
        }
        Self { table_secs }
    }

    pub fn table_secs(&self) -> &[i64] {
        &self.table_secs
    }

    /// Delay before retry number `attempt_count` (1-based; 0 and below map to the first entry).
    pub fn delay_seconds(&self, attempt_count: i32) -> i64 {
        let idx = (attempt_count.max(1) as usize).saturating_sub(1);
        let last = self.table_secs.len() - 1;
        self.table_secs[idx.min(last)].max(0)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt_count: i32) -> DateTime<Utc> {
        now + Duration::seconds(self.delay_seconds(attempt_count))
    }
}
