//! Run scoring.

use serde::{Deserialize, Serialize};

/// Scoring constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Starting score
    pub base: i64,
    /// Flat bonus for finishing under the threshold
    pub speed_bonus: i64,
    /// Elapsed seconds below which the bonus applies
    pub speed_threshold_secs: u64,
    /// Commits allowed before the penalty starts
    pub free_commits: u32,
    /// Points lost per commit over the allowance
    pub penalty_per_commit: i64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            base: 100,
            speed_bonus: 10,
            speed_threshold_secs: 300,
            free_commits: 20,
            penalty_per_commit: 2,
        }
    }
}

/// Score components for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: i64,
    pub speed_bonus: i64,
    pub commit_penalty: i64,
    pub total_commits: u32,
    pub final_score: i64,
}

/// Pure scoring function over elapsed time and commit count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreCalculator {
    config: ScoreConfig,
}

impl ScoreCalculator {
    #[must_use]
    pub fn new(config: ScoreConfig) -> Self {
        Self { config }
    }

    /// Compute the breakdown. No floor or ceiling is applied to the total.
    #[must_use]
    pub fn calculate(&self, elapsed_secs: f64, commits: u32) -> ScoreBreakdown {
        let c = &self.config;
        let speed_bonus = if elapsed_secs < c.speed_threshold_secs as f64 {
            c.speed_bonus
        } else {
            0
        };
        let excess = i64::from(commits.saturating_sub(c.free_commits));
        let commit_penalty = -c.penalty_per_commit * excess;

        ScoreBreakdown {
            base: c.base,
            speed_bonus,
            commit_penalty,
            total_commits: commits,
            final_score: c.base + speed_bonus + commit_penalty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_run_over_commit_allowance() {
        let score = ScoreCalculator::default().calculate(250.0, 22);
        assert_eq!(score.speed_bonus, 10);
        assert_eq!(score.commit_penalty, -4);
        assert_eq!(score.total_commits, 22);
        assert_eq!(score.final_score, 106);
    }

    #[test]
    fn test_slow_run_within_allowance() {
        let score = ScoreCalculator::default().calculate(300.0, 20);
        assert_eq!(score.speed_bonus, 0);
        assert_eq!(score.commit_penalty, 0);
        assert_eq!(score.final_score, 100);
    }

    #[test]
    fn test_no_floor_applied() {
        let score = ScoreCalculator::default().calculate(900.0, 90);
        assert_eq!(score.commit_penalty, -140);
        assert_eq!(score.final_score, -40);
    }

    #[test]
    fn test_deterministic() {
        let calc = ScoreCalculator::new(ScoreConfig {
            speed_bonus: 25,
            ..ScoreConfig::default()
        });
        assert_eq!(calc.calculate(12.5, 3), calc.calculate(12.5, 3));
    }
}
