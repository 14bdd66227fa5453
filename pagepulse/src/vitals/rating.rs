//! Vital names, thresholds and ratings.

use serde::{Deserialize, Serialize};

/// A page-performance milestone.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Vital {
    /// Largest contentful paint.
    Lcp,
    /// First input delay.
    Fid,
    /// Cumulative layout shift (unitless).
    Cls,
    /// Time to first byte.
    Ttfb,
    /// First contentful paint.
    Fcp,
}

impl Vital {
    pub const ALL: [Vital; 5] = [Vital::Lcp, Vital::Fid, Vital::Cls, Vital::Ttfb, Vital::Fcp];

    pub fn thresholds(self) -> Thresholds {
        let (good, poor) = match self {
            Vital::Lcp => (2500.0, 4000.0),
            Vital::Fid => (100.0, 300.0),
            Vital::Cls => (0.1, 0.25),
            Vital::Ttfb => (800.0, 1800.0),
            Vital::Fcp => (1800.0, 3000.0),
        };
        Thresholds { good, poor }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Vital::Cls => "",
            _ => "ms",
        }
    }

    pub fn rate(self, value: f64) -> VitalRating {
        self.thresholds().rate(value)
    }
}

/// Good ceiling and poor floor for one vital.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub good: f64,
    pub poor: f64,
}

impl Thresholds {
    /// `good` up to and including the ceiling, `poor` from the floor upwards,
    /// `needs-improvement` strictly between. Non-finite values are never
    /// good or poor.
    pub fn rate(&self, value: f64) -> VitalRating {
        if value <= self.good {
            VitalRating::Good
        } else if value >= self.poor {
            VitalRating::Poor
        } else {
            VitalRating::NeedsImprovement
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VitalRating {
    Good,
    NeedsImprovement,
    Poor,
}

/// The full threshold table.
pub fn thresholds() -> [(Vital, Thresholds); 5] {
    Vital::ALL.map(|v| (v, v.thresholds()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case(Vital::Lcp, 2500.0, VitalRating::Good)]
    #[case(Vital::Lcp, 3000.0, VitalRating::NeedsImprovement)]
    #[case(Vital::Lcp, 4000.0, VitalRating::Poor)]
    #[case(Vital::Fid, 100.0, VitalRating::Good)]
    #[case(Vital::Fid, 300.0, VitalRating::Poor)]
    #[case(Vital::Cls, 0.1, VitalRating::Good)]
    #[case(Vital::Cls, 0.2, VitalRating::NeedsImprovement)]
    #[case(Vital::Cls, 0.25, VitalRating::Poor)]
    #[case(Vital::Ttfb, 1800.1, VitalRating::Poor)]
    #[case(Vital::Fcp, 0.0, VitalRating::Good)]
    fn test_rating_boundaries(#[case] vital: Vital, #[case] value: f64, #[case] expected: VitalRating) {
        assert_eq!(vital.rate(value), expected);
    }

    #[test]
    fn test_nan_is_needs_improvement() {
        assert_eq!(Vital::Lcp.rate(f64::NAN), VitalRating::NeedsImprovement);
    }

    #[test]
    fn test_vital_names() {
        assert_eq!(Vital::Ttfb.to_string(), "TTFB");
        assert_eq!(Vital::from_str("lcp").unwrap(), Vital::Lcp);
        assert_eq!(serde_json::to_string(&Vital::Cls).unwrap(), "\"CLS\"");
        assert_eq!(VitalRating::NeedsImprovement.to_string(), "needs-improvement");
        assert!(Vital::from_str("INP").is_err());
    }

    #[test]
    fn test_threshold_table_is_ordered() {
        for (vital, t) in thresholds() {
            assert!(t.good < t.poor, "{} thresholds out of order", vital);
        }
    }

    proptest! {
        #[test]
        fn prop_rating_is_monotonic(a in 0.0f64..10_000.0, b in 0.0f64..10_000.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let rank = |r: VitalRating| match r {
                VitalRating::Good => 0,
                VitalRating::NeedsImprovement => 1,
                VitalRating::Poor => 2,
            };
            for vital in Vital::ALL {
                prop_assert!(rank(vital.rate(lo)) <= rank(vital.rate(hi)));
            }
        }
    }
}
