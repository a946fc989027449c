use std::fmt::Write as _;

use chrono::SecondsFormat;
use conductor_client::{LogLevel, LogRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub info: usize,
    pub warning: usize,
    pub error: usize,
}

impl LevelCounts {
    fn record(&mut self, level: LogLevel) {
        match level {
            LogLevel::Info => self.info += 1,
            LogLevel::Warning => self.warning += 1,
            LogLevel::Error => self.error += 1,
        }
    }
}

/// Borrowed view of a run's accumulated log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSnapshot<'a> {
    pub records: &'a [LogRecord],
    pub cumulative_cost: f64,
    pub cumulative_tokens: u64,
    pub level_counts: LevelCounts,
}

/// Ordered log records for one run plus running totals.
///
/// Totals are maintained on append so snapshots never rescan the records.
#[derive(Debug, Clone, Default)]
pub struct LogAccumulator {
    records: Vec<LogRecord>,
    cumulative_cost: f64,
    cumulative_tokens: u64,
    level_counts: LevelCounts,
}

impl LogAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: LogRecord) {
        self.cumulative_cost += record.cost.unwrap_or(0.0);
        self.cumulative_tokens = self
            .cumulative_tokens
            .saturating_add(record.tokens.unwrap_or(0));
        self.level_counts.record(record.level);
        self.records.push(record);
    }

    #[must_use]
    pub fn snapshot(&self) -> LogSnapshot<'_> {
        LogSnapshot {
            records: &self.records,
            cumulative_cost: self.cumulative_cost,
            cumulative_tokens: self.cumulative_tokens,
            level_counts: self.level_counts,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Plain-text export, one `[timestamp] LEVEL: message` line per record.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            let _ = writeln!(out, "{}", format_log_line(record));
        }
        out
    }
}

#[must_use]
pub fn format_log_line(record: &LogRecord) -> String {
    let timestamp = record.timestamp.map_or_else(
        || "-".to_string(),
        |timestamp| timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    format!("[{timestamp}] {}: {}", record.level.label(), record.message)
}
