//! Time-sortable message ids.
//!
//! The relational store uses UUIDv7 (`Uuid::now_v7`). The wide-column store
//! clusters message history on a CQL `timeuuid`, so its ids are RFC 4122 v1
//! UUIDs; `max_timeuuid` builds the upper bound for "every message created
//! strictly before T" scans.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use uuid::{Context, Timestamp, Uuid};

/// 100ns intervals between the gregorian epoch (1582-10-15) and 1970-01-01.
const GREGORIAN_OFFSET_100NS: u64 = 0x01B2_1DD2_1381_4000;

static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();
static CLOCK_CONTEXT: OnceLock<Context> = OnceLock::new();

fn node_id() -> &'static [u8; 6] {
    NODE_ID.get_or_init(|| {
        let mut node: [u8; 6] = rand::random();
        // Multicast bit marks the node id as non-hardware derived.
        node[0] |= 0x01;
        node
    })
}

pub fn new_timeuuid() -> Uuid {
    let context = CLOCK_CONTEXT.get_or_init(|| Context::new(rand::random()));
    let now = Utc::now();
    let ts = Timestamp::from_unix(context, now.timestamp() as u64, now.timestamp_subsec_nanos());
    Uuid::new_v1(ts, node_id())
}

/// The greatest possible v1 UUID for the given instant: its timestamp field
/// is the instant's 100ns tick and every tie-breaking byte is saturated, so
/// `id < max_timeuuid(t)` selects exactly the ids minted strictly before `t`
/// under CQL timeuuid ordering.
pub fn max_timeuuid(at: DateTime<Utc>) -> Uuid {
    let ticks = GREGORIAN_OFFSET_100NS
        + at.timestamp() as u64 * 10_000_000
        + (at.timestamp_subsec_nanos() / 100) as u64;

    let time_low = (ticks & 0xFFFF_FFFF) as u32;
    let time_mid = ((ticks >> 32) & 0xFFFF) as u16;
    let time_hi_version = (((ticks >> 48) & 0x0FFF) as u16) | 0x1000;

    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&time_low.to_be_bytes());
    bytes[4..6].copy_from_slice(&time_mid.to_be_bytes());
    bytes[6..8].copy_from_slice(&time_hi_version.to_be_bytes());
    // Variant bits 10 with the clock sequence and node saturated.
    bytes[8] = 0xBF;
    bytes[9] = 0xFF;
    bytes[10..16].copy_from_slice(&[0xFF; 6]);

    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn v1_ticks(id: Uuid) -> u64 {
        let ts = id.get_timestamp().expect("v1 uuid carries a timestamp");
        let (secs, nanos) = ts.to_unix();
        GREGORIAN_OFFSET_100NS + secs * 10_000_000 + (nanos / 100) as u64
    }

    #[test]
    fn new_timeuuid_is_version_1() {
        let id = new_timeuuid();
        assert_eq!(id.get_version_num(), 1);
    }

    #[test]
    fn max_timeuuid_is_version_1_with_expected_timestamp() {
        let now = Utc::now();
        let bound = max_timeuuid(now);
        assert_eq!(bound.get_version_num(), 1);

        let expected = GREGORIAN_OFFSET_100NS
            + now.timestamp() as u64 * 10_000_000
            + (now.timestamp_subsec_nanos() / 100) as u64;
        assert_eq!(v1_ticks(bound), expected);
    }

    #[test]
    fn bound_sits_after_earlier_ids_and_before_later_ones() {
        let past = new_timeuuid();
        let cut = Utc::now() + Duration::seconds(1);
        let bound = max_timeuuid(cut);

        assert!(v1_ticks(past) < v1_ticks(bound));

        let later = max_timeuuid(cut + Duration::seconds(1));
        assert!(v1_ticks(bound) < v1_ticks(later));
    }
}
