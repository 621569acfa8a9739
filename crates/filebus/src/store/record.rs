//! Record file names
//!
//! A record's whole persisted schema is its file name:
//!
//! ```text
//! <visibility><19-digit ticks><5-digit sequence>_<producer id>.json
//! ```
//!
//! Ticks are 100 ns units since the Unix epoch (UTC), zero padded so that
//! lexicographic order of names equals chronological order. For deferred
//! records the ticks hold the due time instead of the send time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// File extension shared by all record files
pub const RECORD_EXTENSION: &str = ".json";

const TICKS_WIDTH: usize = 19;
const SEQUENCE_WIDTH: usize = 5;
const MAX_SEQUENCE: u32 = 99_999;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Visibility class of a record, encoded as the first character of its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Eligible for claim
    Ready,
    /// Claimed by a consumer, or being written by a producer
    Claimed,
    /// Not eligible until its due time
    Deferred,
    /// Aborted; left for manual inspection or replay
    Error,
}

impl Visibility {
    /// Prefix character used in file names
    pub fn prefix(self) -> char {
        match self {
            Self::Ready => 'b',
            Self::Claimed => 't',
            Self::Deferred => 'd',
            Self::Error => 'e',
        }
    }

    /// Parse a prefix character
    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'b' => Some(Self::Ready),
            't' => Some(Self::Claimed),
            'd' => Some(Self::Deferred),
            'e' => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Claimed => write!(f, "claimed"),
            Self::Deferred => write!(f, "deferred"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Convert a UTC timestamp to ticks (100 ns since the Unix epoch)
pub fn ticks_from_datetime(time: DateTime<Utc>) -> i64 {
    time.timestamp() * TICKS_PER_SECOND + i64::from(time.timestamp_subsec_nanos() / 100)
}

/// Convert ticks back to a UTC timestamp
pub fn datetime_from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Current time in ticks
pub fn now_ticks() -> i64 {
    ticks_from_datetime(Utc::now())
}

/// A parsed record file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordName {
    pub visibility: Visibility,
    pub ticks: i64,
    pub sequence: u32,
    pub producer: String,
}

impl RecordName {
    /// Parse a file name; returns `None` for anything that is not a record
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(RECORD_EXTENSION)?;
        let mut chars = stem.chars();
        let visibility = Visibility::from_prefix(chars.next()?)?;
        let rest = chars.as_str();

        let digits = TICKS_WIDTH + SEQUENCE_WIDTH;
        if rest.len() < digits + 2 || !rest.is_char_boundary(digits) {
            return None;
        }
        let (key, tail) = rest.split_at(digits);
        let producer = tail.strip_prefix('_')?;
        if producer.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            visibility,
            ticks: key[..TICKS_WIDTH].parse().ok()?,
            sequence: key[TICKS_WIDTH..].parse().ok()?,
            producer: producer.to_string(),
        })
    }

    /// The same record under a different visibility class
    pub fn with_visibility(&self, visibility: Visibility) -> Self {
        Self {
            visibility,
            ..self.clone()
        }
    }

    /// The sortable part of the name, without the visibility prefix
    pub fn sequence_key(&self) -> String {
        format!(
            "{:0tw$}{:0sw$}_{}",
            self.ticks,
            self.sequence,
            self.producer,
            tw = TICKS_WIDTH,
            sw = SEQUENCE_WIDTH
        )
    }

    /// Timestamp embedded in the name (send time, or due time if deferred)
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        datetime_from_ticks(self.ticks)
    }

    /// Age of the record relative to `now`; zero if the timestamp is in the future
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = ticks_from_datetime(now).saturating_sub(self.ticks).max(0);
        Duration::from_nanos((elapsed as u64).saturating_mul(100))
    }

    /// Whether a deferred record may be claimed at `now_ticks`
    pub fn is_due(&self, now_ticks: i64) -> bool {
        self.ticks <= now_ticks
    }
}

impl fmt::Display for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.visibility.prefix(),
            self.sequence_key(),
            RECORD_EXTENSION
        )
    }
}

/// Sort key for a raw file name: everything after the visibility prefix
///
/// Ready and deferred names compare by effective timestamp through this key.
pub fn effective_order_key(file_name: &str) -> &str {
    file_name.get(1..).unwrap_or("")
}

/// Generates unique, per-producer monotonic record names
pub struct FileNameGenerator {
    producer_id: String,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_ticks: i64,
    sequence: u32,
}

impl FileNameGenerator {
    /// Create a generator with a fresh producer id
    pub fn new() -> Self {
        Self::with_producer_id(Uuid::now_v7().simple().to_string())
    }

    /// Create a generator with a fixed producer id
    pub fn with_producer_id(producer_id: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            state: Mutex::new(GeneratorState {
                last_ticks: 0,
                sequence: 0,
            }),
        }
    }

    /// The producer id embedded in every generated name
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Next name for a record that is ready immediately
    ///
    /// Names are strictly increasing even if the clock stalls or steps back.
    pub fn next_ready(&self) -> RecordName {
        self.next_ready_at(now_ticks())
    }

    pub(crate) fn next_ready_at(&self, now: i64) -> RecordName {
        let mut state = self.state.lock();
        if now > state.last_ticks {
            state.last_ticks = now;
            state.sequence = 0;
        } else if state.sequence >= MAX_SEQUENCE {
            state.last_ticks += 1;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }

        RecordName {
            visibility: Visibility::Ready,
            ticks: state.last_ticks,
            sequence: state.sequence,
            producer: self.producer_id.clone(),
        }
    }

    /// Next name for a record deferred until `due`
    pub fn next_deferred(&self, due: DateTime<Utc>) -> RecordName {
        let mut state = self.state.lock();
        state.sequence = if state.sequence >= MAX_SEQUENCE {
            0
        } else {
            state.sequence + 1
        };

        RecordName {
            visibility: Visibility::Deferred,
            ticks: ticks_from_datetime(due),
            sequence: state.sequence,
            producer: self.producer_id.clone(),
        }
    }
}

impl Default for FileNameGenerator {
    fn default() -> Self {
        Self::new()
    }
}
