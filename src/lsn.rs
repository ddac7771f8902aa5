//! Parsing and formatting of Postgres-style log sequence numbers.
//!
//! Text form is two uppercase hex groups separated by `/`: `H/L`, combined
//! as `(H << 32) | L`. This is the representation `pg_replication_slots`
//! and `START_REPLICATION` use on the wire.

use crate::error::BridgeError;

/// Parse a `H/L` LSN string into its integer value.
///
/// Rejects anything other than exactly one `/`, empty halves, or non-hex
/// characters; there is no partial-credit parsing here, callers treat a
/// slot's checkpoint LSN as load-bearing.
pub fn parse(text: &str) -> Result<u64, BridgeError> {
    let (hi, lo) = text
        .split_once('/')
        .ok_or_else(|| BridgeError::MalformedLsn(text.to_string()))?;

    if hi.is_empty() || lo.is_empty() {
        return Err(BridgeError::MalformedLsn(text.to_string()));
    }

    let hi = u32::from_str_radix(hi, 16).map_err(|_| BridgeError::MalformedLsn(text.to_string()))?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| BridgeError::MalformedLsn(text.to_string()))?;

    Ok(((hi as u64) << 32) | (lo as u64))
}

/// Format an integer LSN back into its `H/L` text form, unpadded uppercase
/// hex on each side (matches upstream's own formatting style).
pub fn format(lsn: u64) -> String {
    let hi = (lsn >> 32) as u32;
    let lo = lsn as u32;
    format!("{hi:X}/{lo:X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_boundary_values() {
        for n in [0u64, 1, (1u64 << 32) - 1, 1u64 << 32, u64::MAX] {
            assert_eq!(parse(&format(n)).unwrap(), n, "round trip failed for {n}");
        }
    }

    #[test]
    fn parses_documented_example() {
        assert_eq!(parse("16/B374D848").unwrap(), 0x16_B374D848);
        assert_eq!(format(0x16_B374D848), "16/B374D848");
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(parse("16B374D848"), Err(BridgeError::MalformedLsn(_))));
    }

    #[test]
    fn rejects_empty_half() {
        assert!(matches!(parse("/B374D848"), Err(BridgeError::MalformedLsn(_))));
        assert!(matches!(parse("16/"), Err(BridgeError::MalformedLsn(_))));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(parse("16/ZZZZ"), Err(BridgeError::MalformedLsn(_))));
    }

    #[test]
    fn format_uses_unpadded_uppercase_hex() {
        assert_eq!(format(900), "0/384");
    }
}
