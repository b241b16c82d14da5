//! Property tests for the decoding and timing primitives

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use proptest::prelude::*;

use acqsrv::connection::ReconnectPolicy;
use acqsrv::converter::AlarmBand;
use acqsrv::parser::{combine_words, parse};
use acqsrv::schema::SchemaRegistry;
use acqsrv::weighing::{crc16, verify_crc16};

const BLOCK: &str = r#"
blocks:
  - id: b
    db: 1
    size: 8
    fields:
      - { name: flags, offset: "0.0", kind: bit }
      - { name: mode, offset: 1, kind: unsigned8 }
      - { name: high, offset: 2, kind: unsigned16 }
      - { name: low, offset: 4, kind: unsigned16 }
      - { name: temp, offset: 6, kind: signed16 }
    composites:
      - { name: counter, high: high, low: low }
"#;

proptest! {
    #[test]
    fn prop_parse_ignores_bytes_past_block_size(
        block in proptest::collection::vec(any::<u8>(), 8),
        trailing in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let registry = SchemaRegistry::from_yaml_str(BLOCK).unwrap();
        let schema = registry.get("b").unwrap();

        let mut raw = block.clone();
        raw.extend(trailing);
        prop_assert_eq!(parse(schema, &raw).unwrap(), parse(schema, &block).unwrap());
    }

    #[test]
    fn prop_short_buffer_is_always_an_error(raw in proptest::collection::vec(any::<u8>(), 0..8)) {
        let registry = SchemaRegistry::from_yaml_str(BLOCK).unwrap();
        let schema = registry.get("b").unwrap();
        prop_assert!(parse(schema, &raw).is_err());
    }

    #[test]
    fn prop_combine_words_is_high_times_65536_plus_low(high in any::<u16>(), low in any::<u16>()) {
        prop_assert_eq!(
            u64::from(combine_words(high, low)),
            u64::from(high) * 65_536 + u64::from(low)
        );
    }

    #[test]
    fn prop_crc_detects_any_single_bit_flip(
        body in proptest::collection::vec(any::<u8>(), 1..64),
        bit in any::<proptest::sample::Index>(),
    ) {
        let mut frame = body.clone();
        frame.extend_from_slice(&crc16(&body).to_le_bytes());
        prop_assert!(verify_crc16(&frame));

        let bit = bit.index(frame.len() * 8);
        frame[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(!verify_crc16(&frame));
    }

    #[test]
    fn prop_backoff_is_non_decreasing_and_capped(
        base_ms in 1u64..5_000,
        extra_ms in 0u64..60_000,
        n in 0u32..64,
    ) {
        let policy = ReconnectPolicy::from_config(base_ms, base_ms + extra_ms, false);
        prop_assert_eq!(policy.delay(0), Duration::from_millis(base_ms));
        prop_assert!(policy.delay(n) <= policy.delay(n + 1));
        prop_assert!(policy.delay(n + 1) <= policy.max_delay);
        // A success resets the failure count, so the next wait is the base delay again
        prop_assert_eq!(policy.retry_delay(1), policy.base_delay);
    }

    #[test]
    fn prop_alarm_band_is_inclusive(setpoint in 1.0f64..100_000.0, deadband in 0.1f64..50.0) {
        let band = AlarmBand::new(setpoint, deadband).unwrap();
        prop_assert!(!band.is_alarm(band.low));
        prop_assert!(!band.is_alarm(band.high));
        prop_assert!(!band.is_alarm(setpoint));

        let epsilon = band.high * 1e-9;
        prop_assert!(band.is_alarm(band.high + epsilon));
        prop_assert!(band.is_alarm(band.low - epsilon));
    }
}
