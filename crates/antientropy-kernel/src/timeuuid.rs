//! Time-ordered identifiers (version-1 layout UUIDs).
//!
//! The upper 60 bits hold a timestamp in 100ns ticks since the Gregorian
//! reform (1582-10-15). Ordering compares the timestamp first and the raw
//! bytes second, which is the clustering order of a `timeuuid` column.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const GREGORIAN_OFFSET_TICKS: i64 = 0x01B2_1DD2_1381_4000;
const TICKS_PER_MILLI: i64 = 10_000;
const MAX_TICKS: u64 = (1 << 60) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct TimeUuid(Uuid);

/// Random clock sequence and node id of this process.
fn process_identity() -> (u16, [u8; 6]) {
    static IDENTITY: OnceLock<(u16, [u8; 6])> = OnceLock::new();
    *IDENTITY.get_or_init(random_identity)
}

fn random_identity() -> (u16, [u8; 6]) {
    let bytes = Uuid::new_v4().into_bytes();
    let clock_seq = u16::from_be_bytes([bytes[0], bytes[1]]);
    let mut node = [0u8; 6];
    node.copy_from_slice(&bytes[10..16]);
    (clock_seq, node)
}

fn millis_to_ticks(ms: i64) -> u64 {
    let ticks = ms
        .saturating_mul(TICKS_PER_MILLI)
        .saturating_add(GREGORIAN_OFFSET_TICKS);
    (ticks.max(0) as u64).min(MAX_TICKS)
}

fn now_ticks() -> u64 {
    let micros = Utc::now().timestamp_micros();
    let ticks = micros
        .saturating_mul(10)
        .saturating_add(GREGORIAN_OFFSET_TICKS);
    (ticks.max(0) as u64).min(MAX_TICKS)
}

fn build(ticks: u64, clock_seq: u16, node: [u8; 6]) -> Uuid {
    let time_low = (ticks & 0xFFFF_FFFF) as u32;
    let time_mid = ((ticks >> 32) & 0xFFFF) as u16;
    let time_hi_and_version = (((ticks >> 48) & 0x0FFF) as u16) | 0x1000;
    let clock_seq = (clock_seq & 0x3FFF) | 0x8000;
    let [seq_hi, seq_lo] = clock_seq.to_be_bytes();
    let d4 = [
        seq_hi, seq_lo, node[0], node[1], node[2], node[3], node[4], node[5],
    ];
    Uuid::from_fields(time_low, time_mid, time_hi_and_version, &d4)
}

impl TimeUuid {
    /// Mints a fresh id. Ids minted by one process are strictly increasing.
    pub fn now() -> Self {
        static LAST_TICKS: AtomicU64 = AtomicU64::new(0);
        let mut last = LAST_TICKS.load(AtomicOrdering::Relaxed);
        let ticks = loop {
            let candidate = now_ticks().max(last + 1);
            match LAST_TICKS.compare_exchange_weak(
                last,
                candidate,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(observed) => last = observed,
            }
        };
        let (clock_seq, node) = process_identity();
        Self(build(ticks, clock_seq, node))
    }

    /// Mints a unique id whose embedded timestamp is `ms` milliseconds since the unix epoch.
    pub fn from_unix_millis(ms: i64) -> Self {
        let (clock_seq, node) = random_identity();
        Self(build(millis_to_ticks(ms), clock_seq, node))
    }

    /// Smallest id carrying timestamp `ms`; an inclusive lower bound.
    pub fn min_for_millis(ms: i64) -> Self {
        Self(build(millis_to_ticks(ms), 0, [0; 6]))
    }

    /// Largest id carrying any timestamp within millisecond `ms`; an inclusive upper bound.
    pub fn max_for_millis(ms: i64) -> Self {
        let ticks = (millis_to_ticks(ms) + (TICKS_PER_MILLI as u64 - 1)).min(MAX_TICKS);
        Self(build(ticks, 0x3FFF, [0xFF; 6]))
    }

    /// Accepts only version-1 UUIDs.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        (uuid.get_version_num() == 1).then_some(Self(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Embedded timestamp in 100ns ticks since 1582-10-15.
    pub fn ticks(&self) -> u64 {
        let (time_low, time_mid, time_hi_and_version, _) = self.0.as_fields();
        (((time_hi_and_version & 0x0FFF) as u64) << 48)
            | ((time_mid as u64) << 32)
            | time_low as u64
    }

    pub fn unix_millis(&self) -> i64 {
        (self.ticks() as i64 - GREGORIAN_OFFSET_TICKS).div_euclid(TICKS_PER_MILLI)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.unix_millis())
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Ord for TimeUuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ticks()
            .cmp(&other.ticks())
            .then_with(|| self.0.as_u128().cmp(&other.0.as_u128()))
    }
}

impl PartialOrd for TimeUuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<Uuid> for TimeUuid {
    type Error = String;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        Self::from_uuid(uuid).ok_or_else(|| format!("not a time-based uuid: {uuid}"))
    }
}

impl From<TimeUuid> for Uuid {
    fn from(value: TimeUuid) -> Self {
        value.0
    }
}

impl fmt::Display for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
