//! Convergence classification over replay rounds.

use serde::{Deserialize, Serialize};

/// Outcome of classifying a sequence of per-round structural change counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Convergence {
    /// The latest round reported zero structural changes.
    Converged,
    /// Change counts are non-increasing; allowed to proceed.
    Trending,
    /// Oscillation, growth, or round budget exhausted without reaching zero.
    NonConvergent { reason: String },
}

/// Classify a replay change-count sequence.
///
/// Rules, in order:
/// - latest count zero: converged
/// - repeated identical non-zero counts: non-convergent (oscillating)
/// - round budget spent without reaching zero: non-convergent
/// - strictly non-increasing: trending toward convergence
/// - otherwise (counts grew): non-convergent
pub fn classify_convergence(change_counts: &[usize], max_rounds: usize) -> Convergence {
    let Some(&last) = change_counts.last() else {
        return Convergence::NonConvergent {
            reason: "no replay rounds recorded".to_string(),
        };
    };

    if last == 0 {
        return Convergence::Converged;
    }

    let oscillating =
        change_counts.len() >= 2 && change_counts.iter().all(|&count| count == change_counts[0]);
    if oscillating {
        return Convergence::NonConvergent {
            reason: format!("oscillating at {last} changes per round"),
        };
    }

    if change_counts.len() >= max_rounds {
        return Convergence::NonConvergent {
            reason: format!("round budget of {max_rounds} spent with {last} changes remaining"),
        };
    }

    let non_increasing = change_counts
        .windows(2)
        .all(|pair| pair[0] >= pair[1]);
    if non_increasing {
        return Convergence::Trending;
    }

    Convergence::NonConvergent {
        reason: "change counts increased between rounds".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decreasing_to_zero_converges() {
        assert_eq!(classify_convergence(&[5, 2, 0], 3), Convergence::Converged);
    }

    #[test]
    fn oscillating_counts_are_non_convergent() {
        match classify_convergence(&[3, 3, 3], 5) {
            Convergence::NonConvergent { reason } => assert!(reason.contains("oscillating")),
            other => panic!("expected non-convergent, got {other:?}"),
        }
    }

    #[test]
    fn zero_in_latest_round_wins_even_after_noise() {
        assert_eq!(classify_convergence(&[4, 7, 0], 3), Convergence::Converged);
    }

    #[test]
    fn decreasing_but_nonzero_is_trending_within_budget() {
        assert_eq!(classify_convergence(&[9, 4, 1], 5), Convergence::Trending);
    }

    #[test]
    fn budget_exhaustion_without_zero_is_non_convergent() {
        match classify_convergence(&[9, 4, 1], 3) {
            Convergence::NonConvergent { reason } => assert!(reason.contains("round budget")),
            other => panic!("expected non-convergent, got {other:?}"),
        }
    }

    #[test]
    fn growth_is_non_convergent() {
        match classify_convergence(&[1, 5], 5) {
            Convergence::NonConvergent { reason } => assert!(reason.contains("increased")),
            other => panic!("expected non-convergent, got {other:?}"),
        }
    }

    #[test]
    fn empty_sequence_is_non_convergent() {
        assert!(matches!(
            classify_convergence(&[], 3),
            Convergence::NonConvergent { .. }
        ));
    }
}
