//! Tier classification from lifetime earned points.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SILVER_THRESHOLD: i64 = 1_000;
pub const GOLD_THRESHOLD: i64 = 5_000;
pub const PLATINUM_THRESHOLD: i64 = 15_000;

/// Coarse loyalty tier. Ordered so that `Bronze < Silver < Gold < Platinum`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    /// Lifetime earned points at which this tier starts.
    pub fn threshold(self) -> i64 {
        match self {
            Tier::Bronze => 0,
            Tier::Silver => SILVER_THRESHOLD,
            Tier::Gold => GOLD_THRESHOLD,
            Tier::Platinum => PLATINUM_THRESHOLD,
        }
    }

    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Bronze => Some(Tier::Silver),
            Tier::Silver => Some(Tier::Gold),
            Tier::Gold => Some(Tier::Platinum),
            Tier::Platinum => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bronze" => Ok(Tier::Bronze),
            "silver" => Ok(Tier::Silver),
            "gold" => Ok(Tier::Gold),
            "platinum" => Ok(Tier::Platinum),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Maps lifetime earned points to a tier. Negative input is treated as zero.
pub fn classify_tier(lifetime_earned: i64) -> Tier {
    match lifetime_earned {
        n if n >= PLATINUM_THRESHOLD => Tier::Platinum,
        n if n >= GOLD_THRESHOLD => Tier::Gold,
        n if n >= SILVER_THRESHOLD => Tier::Silver,
        _ => Tier::Bronze,
    }
}

/// Where a user stands relative to the next tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProgress {
    pub tier: Tier,
    pub next_tier: Option<Tier>,
    /// Lifetime points still needed for `next_tier`; 0 at the top tier.
    pub points_to_next: i64,
}

pub fn tier_progress(lifetime_earned: i64) -> TierProgress {
    let tier = classify_tier(lifetime_earned);
    let next_tier = tier.next();
    let points_to_next = next_tier
        .map(|next| (next.threshold() - lifetime_earned.max(0)).max(0))
        .unwrap_or(0);
    TierProgress {
        tier,
        next_tier,
        points_to_next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tier_boundaries() {
        assert_eq!(classify_tier(-5), Tier::Bronze);
        assert_eq!(classify_tier(0), Tier::Bronze);
        assert_eq!(classify_tier(999), Tier::Bronze);
        assert_eq!(classify_tier(1_000), Tier::Silver);
        assert_eq!(classify_tier(4_999), Tier::Silver);
        assert_eq!(classify_tier(5_000), Tier::Gold);
        assert_eq!(classify_tier(14_999), Tier::Gold);
        assert_eq!(classify_tier(15_000), Tier::Platinum);
        assert_eq!(classify_tier(i64::MAX), Tier::Platinum);
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(Tier::Bronze < Tier::Silver);
        assert!(Tier::Gold < Tier::Platinum);
        assert_eq!(Tier::Silver.max(Tier::Bronze), Tier::Silver);
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("GOLD".parse::<Tier>().unwrap(), Tier::Gold);
        assert!("diamond".parse::<Tier>().is_err());
        assert_eq!(serde_json::to_string(&Tier::Platinum).unwrap(), "\"platinum\"");
    }

    #[test]
    fn tier_progress_reports_distance_to_next() {
        let progress = tier_progress(750);
        assert_eq!(progress.tier, Tier::Bronze);
        assert_eq!(progress.next_tier, Some(Tier::Silver));
        assert_eq!(progress.points_to_next, 250);

        let top = tier_progress(20_000);
        assert_eq!(top.tier, Tier::Platinum);
        assert_eq!(top.next_tier, None);
        assert_eq!(top.points_to_next, 0);
    }
}
