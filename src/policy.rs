//! Split decision policy
//!
//! Pure decision over the current interaction count. Kept free of any I/O so
//! the observer and the orchestrator can share it.

use serde::{Deserialize, Serialize};

use crate::model::{Thread, UserSettings, DEFAULT_SPLIT_THRESHOLD};

/// A threshold of zero disables splitting.
pub fn should_split(interaction_count: u32, threshold: u32) -> bool {
    threshold > 0 && interaction_count >= threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitReason {
    /// Interaction count reached the threshold
    Threshold,
    /// The latest assistant response was long enough to split early
    LongResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    pub threshold: u32,
    /// `None` disables the long-response heuristic
    pub adaptive_char_threshold: Option<usize>,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPLIT_THRESHOLD,
            adaptive_char_threshold: None,
        }
    }
}

impl SplitPolicy {
    pub fn from_settings(settings: &UserSettings) -> Self {
        Self {
            threshold: settings.split_threshold,
            adaptive_char_threshold: settings.adaptive_char_threshold,
        }
    }

    /// A thread's own threshold with the user's long-response setting
    pub fn for_thread(thread: &Thread, settings: &UserSettings) -> Self {
        Self {
            threshold: thread.split_threshold,
            adaptive_char_threshold: settings.adaptive_char_threshold,
        }
    }

    /// The threshold rule wins over the long-response rule. The heuristic only
    /// applies once at least one interaction has been counted.
    pub fn evaluate(&self, interaction_count: u32, last_response_chars: Option<usize>) -> Option<SplitReason> {
        if should_split(interaction_count, self.threshold) {
            return Some(SplitReason::Threshold);
        }
        match (self.adaptive_char_threshold, last_response_chars) {
            (Some(limit), Some(chars)) if limit > 0 && interaction_count > 0 && chars > limit => {
                Some(SplitReason::LongResponse)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_split_matrix() {
        let cases = [
            (0, 0, false),
            (5, 0, false),
            (0, 1, false),
            (1, 1, true),
            (1, 2, false),
            (2, 2, true),
            (3, 2, true),
            (9, 10, false),
            (10, 10, true),
        ];
        for (count, threshold, expected) in cases {
            assert_eq!(
                should_split(count, threshold),
                expected,
                "count={} threshold={}",
                count,
                threshold
            );
        }
    }

    #[test]
    fn test_boundary_threshold_minus_one() {
        for t in 1..20 {
            assert!(!should_split(t - 1, t));
            assert!(should_split(t, t));
        }
    }

    #[test]
    fn test_long_response_triggers_early() {
        let policy = SplitPolicy {
            threshold: 10,
            adaptive_char_threshold: Some(2000),
        };
        assert_eq!(policy.evaluate(1, Some(2500)), Some(SplitReason::LongResponse));
        assert_eq!(policy.evaluate(1, Some(2000)), None);
        assert_eq!(policy.evaluate(0, Some(5000)), None);
        assert_eq!(policy.evaluate(10, Some(10)), Some(SplitReason::Threshold));
    }

    #[test]
    fn test_heuristic_disabled() {
        let policy = SplitPolicy {
            threshold: 0,
            adaptive_char_threshold: None,
        };
        assert_eq!(policy.evaluate(100, Some(100_000)), None);
    }
}
