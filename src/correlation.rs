//! Correlation identifiers for in-flight requests.
//!
//! ```ignore
//! let ids = CorrelationIdGenerator::new(IdFormat::Sequential, Some("req".into()));
//! let a = ids.generate(); // "req_1_x8Kq2z"
//! let b = ids.generate(); // "req_2_P0aLm4"
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const SUFFIX_LEN: usize = 6;
const DEFAULT_SHORT_LEN: usize = 12;
const TIMESTAMP_DIGITS: usize = 13;

/// Shape of generated identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdFormat {
    /// `[prefix_]counter_suffix`, counter scoped to the generator.
    #[default]
    Sequential,
    /// Fixed-length random alphanumeric.
    Short,
    /// 13-digit epoch milliseconds followed by a random suffix.
    Timestamp,
    /// Random (v4) UUID.
    Uuid,
}

/// Produces identifiers unique per generator instance. Never blocks, never fails.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    format: IdFormat,
    prefix: Option<String>,
    short_len: usize,
    counter: AtomicU64,
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new(IdFormat::default(), None)
    }
}

impl CorrelationIdGenerator {
    pub fn new(format: IdFormat, prefix: Option<String>) -> Self {
        Self {
            format,
            prefix: prefix.filter(|p| !p.is_empty()),
            short_len: DEFAULT_SHORT_LEN,
            counter: AtomicU64::new(0),
        }
    }

    /// Length used by [`IdFormat::Short`]. Values below 8 are raised to 8.
    pub fn with_short_len(mut self, len: usize) -> Self {
        self.short_len = len.max(8);
        self
    }

    pub fn format(&self) -> IdFormat {
        self.format
    }

    pub fn generate(&self) -> String {
        let id = match self.format {
            IdFormat::Sequential => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{n}_{}", random_alphanumeric(SUFFIX_LEN))
            }
            IdFormat::Short => random_alphanumeric(self.short_len),
            IdFormat::Timestamp => {
                let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
                format!("{millis:013}_{}", random_alphanumeric(SUFFIX_LEN))
            }
            IdFormat::Uuid => uuid::Uuid::new_v4().to_string(),
        };

        match &self.prefix {
            Some(prefix) => format!("{prefix}_{id}"),
            None => id,
        }
    }

    /// Extracts an embedded 13-digit millisecond timestamp, if any.
    ///
    /// Diagnostics only; ids carry no ordering guarantee.
    pub fn parse(id: &str) -> Option<OffsetDateTime> {
        let bytes = id.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if !bytes[start].is_ascii_digit() {
                start += 1;
                continue;
            }
            let end = bytes[start..]
                .iter()
                .position(|b| !b.is_ascii_digit())
                .map_or(bytes.len(), |p| start + p);
            if end - start == TIMESTAMP_DIGITS {
                let millis: i128 = id[start..end].parse().ok()?;
                return OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000).ok();
            }
            start = end;
        }
        None
    }

    /// Zeroes the sequential counter.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}

fn random_alphanumeric(len: usize) -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(len)
        .collect()
}
