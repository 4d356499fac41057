//! Commission and yield schedules.
//!
//! Both tables are plain data. The referral chain builder, reward arithmetic
//! and any commission display read from here and nowhere else.

use serde::Serialize;

use crate::model::LockDuration;

/// Deepest referral level that earns commission.
pub const MAX_REFERRAL_DEPTH: u8 = 25;

/// Commission per level in basis points, index 0 = level 1.
pub const COMMISSION_BPS: [u32; MAX_REFERRAL_DEPTH as usize] = [
    1_200, 800, 600, 400, 200, // levels 1-5
    100, 100, 100, 100, 100, // 6-10
    75, 75, 75, 75, 75, // 11-15
    50, 50, 50, 50, 50, // 16-20
    25, 25, 25, 25, 25, // 21-25
];

/// Rate for `level`, or `None` once past the table. `None` ends a chain walk.
pub fn commission_bps(level: u8) -> Option<u32> {
    let idx = usize::from(level).checked_sub(1)?;
    COMMISSION_BPS.get(idx).copied()
}

/// Per-period yield for a lock duration, in basis points of principal.
pub fn yield_bps(duration: LockDuration) -> u32 {
    match duration {
        LockDuration::ThreeMonths => 1_000,
        LockDuration::SixMonths => 1_200,
        LockDuration::TwelveMonths => 1_500,
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CommissionTier {
    pub level: u8,
    pub rate_bps: u32,
}

pub fn commission_schedule() -> Vec<CommissionTier> {
    (1..=MAX_REFERRAL_DEPTH)
        .filter_map(|level| {
            commission_bps(level).map(|rate_bps| CommissionTier { level, rate_bps })
        })
        .collect()
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct YieldTier {
    pub duration: LockDuration,
    pub months: u64,
    pub rate_bps: u32,
}

pub fn yield_schedule() -> Vec<YieldTier> {
    LockDuration::ALL
        .into_iter()
        .map(|duration| YieldTier {
            duration,
            months: duration.months(),
            rate_bps: yield_bps(duration),
        })
        .collect()
}

/// Formats basis points as a percentage string, e.g. `75` -> `"0.75%"`.
pub fn format_bps(bps: u32) -> String {
    let whole = bps / 100;
    let frac = bps % 100;
    if frac == 0 {
        format!("{whole}%")
    } else if frac % 10 == 0 {
        format!("{whole}.{}%", frac / 10)
    } else {
        format!("{whole}.{frac:02}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commission_table_never_increases() {
        for pair in COMMISSION_BPS.windows(2) {
            assert!(pair[0] >= pair[1], "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn commission_lookup_bounds() {
        assert_eq!(commission_bps(0), None);
        assert_eq!(commission_bps(1), Some(1_200));
        assert_eq!(commission_bps(2), Some(800));
        assert_eq!(commission_bps(5), Some(200));
        assert_eq!(commission_bps(10), Some(100));
        assert_eq!(commission_bps(11), Some(75));
        assert_eq!(commission_bps(20), Some(50));
        assert_eq!(commission_bps(25), Some(25));
        assert_eq!(commission_bps(26), None);
        assert_eq!(commission_schedule().len(), 25);
    }

    #[test]
    fn yield_tiers_rise_with_duration() {
        let tiers = yield_schedule();
        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[0].rate_bps, 1_000);
        assert_eq!(tiers[1].rate_bps, 1_200);
        assert_eq!(tiers[2].rate_bps, 1_500);
    }

    #[test]
    fn bps_formatting() {
        assert_eq!(format_bps(1_200), "12%");
        assert_eq!(format_bps(75), "0.75%");
        assert_eq!(format_bps(50), "0.5%");
        assert_eq!(format_bps(25), "0.25%");
    }
}
