//! Margin deviation detector: live margin vs target, within a tolerance.

use rust_decimal::Decimal;
use serde::Serialize;

/// Classification of a live margin against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginClass {
    /// |delta| <= tolerance: no correction needed
    Within,
    /// delta > tolerance: margin above target, close part of the position
    Excess,
    /// delta < -tolerance: margin below target, add to the position
    Deficit,
}

/// Signed deviation plus its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deviation {
    /// live - target, in quote units
    pub delta: Decimal,
    pub class: MarginClass,
}

impl Deviation {
    pub fn is_within(&self) -> bool {
        self.class == MarginClass::Within
    }
}

/// Classify a live margin against a target. Pure; never touches the
/// exchange, so re-running it on an unchanged snapshot is free.
pub fn classify(live_margin: Decimal, target_margin: Decimal, tolerance: Decimal) -> Deviation {
    let delta = live_margin - target_margin;

    let class = if delta > tolerance {
        MarginClass::Excess
    } else if delta < -tolerance {
        MarginClass::Deficit
    } else {
        MarginClass::Within
    };

    Deviation { delta, class }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_within_band() {
        let tol = dec!(0.5);
        assert_eq!(classify(dec!(10), dec!(10), tol).class, MarginClass::Within);
        // Boundary: |delta| == tolerance is still within.
        assert_eq!(classify(dec!(10.5), dec!(10), tol).class, MarginClass::Within);
        assert_eq!(classify(dec!(9.5), dec!(10), tol).class, MarginClass::Within);
    }

    #[test]
    fn test_excess_and_deficit() {
        let tol = dec!(0.5);
        let excess = classify(dec!(25), dec!(20), tol);
        assert_eq!(excess.class, MarginClass::Excess);
        assert_eq!(excess.delta, dec!(5));

        let deficit = classify(dec!(7), dec!(10), tol);
        assert_eq!(deficit.class, MarginClass::Deficit);
        assert_eq!(deficit.delta, dec!(-3));
    }

    #[test]
    fn test_idempotent_on_same_snapshot() {
        let first = classify(dec!(13.2), dec!(10), dec!(0.5));
        let second = classify(dec!(13.2), dec!(10), dec!(0.5));
        assert_eq!(first, second);
    }
}
