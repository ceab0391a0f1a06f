//! Dataset distribution policy and the record status state machine.
//!
//! A record starts `pending` and becomes `completed` once enough submitted
//! responses exist under the dataset's distribution strategy. The status is a
//! pure function of the submitted count, so it moves back to `pending` when
//! submitted responses are deleted or changed to draft/discarded.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::schema::{RecordStatus, ResponseStatus};

pub const DEFAULT_MIN_SUBMITTED: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("unsupported distribution strategy `{0}`")]
    UnsupportedStrategy(String),

    #[error("min_submitted must be at least 1, got {0}")]
    InvalidMinSubmitted(u32),
}

/// Strategy names are kept verbatim so that an unsupported value stored in the
/// database is only rejected when a status is evaluated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistributionStrategy {
    Overlap,
    Other(String),
}

impl DistributionStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            DistributionStrategy::Overlap => "overlap",
            DistributionStrategy::Other(name) => name,
        }
    }
}

impl From<&str> for DistributionStrategy {
    fn from(s: &str) -> Self {
        match s {
            "overlap" => DistributionStrategy::Overlap,
            other => DistributionStrategy::Other(other.to_string()),
        }
    }
}

impl Serialize for DistributionStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DistributionStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(DistributionStrategy::from(s.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub strategy: DistributionStrategy,
    #[serde(default = "default_min_submitted")]
    pub min_submitted: u32,
}

fn default_min_submitted() -> u32 {
    DEFAULT_MIN_SUBMITTED
}

impl Default for Distribution {
    fn default() -> Self {
        Self::overlap(DEFAULT_MIN_SUBMITTED)
    }
}

impl Distribution {
    pub fn overlap(min_submitted: u32) -> Self {
        Self {
            strategy: DistributionStrategy::Overlap,
            min_submitted,
        }
    }

    /// Checks a distribution before it is stored on a dataset.
    pub fn validate(&self) -> Result<(), DistributionError> {
        match &self.strategy {
            DistributionStrategy::Overlap => {
                if self.min_submitted < 1 {
                    return Err(DistributionError::InvalidMinSubmitted(self.min_submitted));
                }
                Ok(())
            }
            DistributionStrategy::Other(name) => {
                Err(DistributionError::UnsupportedStrategy(name.clone()))
            }
        }
    }

    /// Derives the record status for a given number of submitted responses.
    pub fn record_status(&self, submitted: u64) -> Result<RecordStatus, DistributionError> {
        match &self.strategy {
            DistributionStrategy::Overlap => {
                if submitted >= u64::from(self.min_submitted) {
                    Ok(RecordStatus::Completed)
                } else {
                    Ok(RecordStatus::Pending)
                }
            }
            DistributionStrategy::Other(name) => {
                Err(DistributionError::UnsupportedStrategy(name.clone()))
            }
        }
    }
}

pub fn count_submitted<'a, I>(statuses: I) -> u64
where
    I: IntoIterator<Item = &'a ResponseStatus>,
{
    statuses
        .into_iter()
        .filter(|s| **s == ResponseStatus::Submitted)
        .count() as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: RecordStatus,
    pub current: RecordStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    pub fn completed_now(&self) -> bool {
        self.previous == RecordStatus::Pending && self.current == RecordStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_completes_at_threshold() {
        let d = Distribution::overlap(2);
        assert_eq!(d.record_status(0), Ok(RecordStatus::Pending));
        assert_eq!(d.record_status(1), Ok(RecordStatus::Pending));
        assert_eq!(d.record_status(2), Ok(RecordStatus::Completed));
        assert_eq!(d.record_status(7), Ok(RecordStatus::Completed));
    }

    #[test]
    fn status_matches_invariant_for_all_thresholds() {
        for min in 1..=5u32 {
            let d = Distribution::overlap(min);
            for submitted in 0..=10u64 {
                let expected = if submitted >= u64::from(min) {
                    RecordStatus::Completed
                } else {
                    RecordStatus::Pending
                };
                assert_eq!(d.record_status(submitted), Ok(expected), "min={min} submitted={submitted}");
            }
        }
    }

    #[test]
    fn only_submitted_responses_count() {
        let statuses = [
            ResponseStatus::Submitted,
            ResponseStatus::Draft,
            ResponseStatus::Discarded,
            ResponseStatus::Submitted,
        ];
        assert_eq!(count_submitted(&statuses), 2);
    }

    #[test]
    fn unknown_strategy_always_raises() {
        let d: Distribution =
            serde_json::from_value(serde_json::json!({"strategy": "round_robin", "min_submitted": 1}))
                .unwrap();
        assert_eq!(
            d.strategy,
            DistributionStrategy::Other("round_robin".to_string())
        );
        for submitted in [0, 1, 100] {
            assert_eq!(
                d.record_status(submitted),
                Err(DistributionError::UnsupportedStrategy("round_robin".into()))
            );
        }
        assert!(d.validate().is_err());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert_eq!(
            Distribution::overlap(0).validate(),
            Err(DistributionError::InvalidMinSubmitted(0))
        );
        assert_eq!(Distribution::default().validate(), Ok(()));
    }

    #[test]
    fn missing_min_submitted_defaults_to_one() {
        let d: Distribution = serde_json::from_value(serde_json::json!({"strategy": "overlap"})).unwrap();
        assert_eq!(d, Distribution::overlap(1));
        assert_eq!(
            serde_json::to_value(&d).unwrap(),
            serde_json::json!({"strategy": "overlap", "min_submitted": 1})
        );
    }

    #[test]
    fn transition_flags() {
        let up = StatusChange { previous: RecordStatus::Pending, current: RecordStatus::Completed };
        assert!(up.changed() && up.completed_now());

        let down = StatusChange { previous: RecordStatus::Completed, current: RecordStatus::Pending };
        assert!(down.changed() && !down.completed_now());

        let same = StatusChange { previous: RecordStatus::Completed, current: RecordStatus::Completed };
        assert!(!same.changed() && !same.completed_now());
    }
}
