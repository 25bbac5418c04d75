//! crates/plantgo_core/src/level.rs
//!
//! Maps cumulative points to a level and a progress percentage.

const MAX_PROGRESS: f64 = 100.0 - 1e-9;

/// Level and progress towards the next one, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelProgress {
    pub level: i64,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct LevelCalculator {
    points_per_level: i64,
}

impl LevelCalculator {
    /// A non-positive `points_per_level` is treated as 1.
    pub fn new(points_per_level: i64) -> Self {
        Self {
            points_per_level: points_per_level.max(1),
        }
    }

    pub fn level(&self, total: i64) -> i64 {
        1 + total.max(0) / self.points_per_level
    }

    /// Always in `[0, 100)`.
    pub fn progress(&self, total: i64) -> f64 {
        let total = total.max(0);
        let into_level = total - (self.level(total) - 1) * self.points_per_level;
        let pct = into_level as f64 / self.points_per_level as f64 * 100.0;
        // Float rounding can land on 100.0 just below a boundary for huge levels.
        pct.clamp(0.0, MAX_PROGRESS)
    }

    pub fn evaluate(&self, total: i64) -> LevelProgress {
        LevelProgress {
            level: self.level(total),
            progress: self.progress(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::POINTS_PER_LEVEL;

    fn calc() -> LevelCalculator {
        LevelCalculator::new(POINTS_PER_LEVEL)
    }

    #[test]
    fn zero_points_is_level_one() {
        assert_eq!(calc().level(0), 1);
        assert_eq!(calc().progress(0), 0.0);
    }

    #[test]
    fn progress_resets_at_each_boundary() {
        let c = calc();
        assert_eq!(c.level(POINTS_PER_LEVEL), 2);
        assert_eq!(c.progress(POINTS_PER_LEVEL), 0.0);
        assert_eq!(c.level(POINTS_PER_LEVEL * 3), 4);
        assert_eq!(c.progress(POINTS_PER_LEVEL * 3), 0.0);
        assert_eq!(c.level(POINTS_PER_LEVEL - 1), 1);
    }

    #[test]
    fn crossing_a_level_with_one_observation() {
        let c = calc();
        let total = 10_999 + 50;
        assert_eq!(total, 11_049);
        assert_eq!(c.level(total), 2);
        let progress = c.progress(total);
        assert!((progress - 0.4454).abs() < 0.001, "progress was {}", progress);
    }

    #[test]
    fn level_is_monotone_and_progress_bounded() {
        let c = LevelCalculator::new(7);
        let mut last = c.level(0);
        for total in 0..500 {
            let now = c.level(total);
            assert!(now >= 1);
            assert!(now >= last);
            last = now;
            let p = c.progress(total);
            assert!((0.0..100.0).contains(&p), "progress {} at {}", p, total);
        }
    }

    #[test]
    fn negative_totals_are_clamped() {
        assert_eq!(calc().evaluate(-10), LevelProgress { level: 1, progress: 0.0 });
    }
}
