//! Margin target policy: maintenance count selects the margin tier.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Target margin in quote units for a given maintenance count.
///
/// Tier table: 0 and 1 map to 10U, 2 to 20U, 3 to 30U. Counts beyond 3
/// saturate back to the 10U base tier; the table never extrapolates.
pub fn target_margin(maintenance_count: u32) -> Decimal {
    match maintenance_count {
        0 | 1 => dec!(10),
        2 => dec!(20),
        3 => dec!(30),
        _ => dec!(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table() {
        assert_eq!(target_margin(0), dec!(10));
        assert_eq!(target_margin(1), dec!(10));
        assert_eq!(target_margin(2), dec!(20));
        assert_eq!(target_margin(3), dec!(30));
    }

    #[test]
    fn test_tier_saturation() {
        // Every count past the table saturates to the base tier.
        for count in 4..64 {
            assert_eq!(target_margin(count), target_margin(0));
        }
    }
}
