//! Turns identifier output into a Known / Unknown / Blacklisted verdict.

use crate::labels::LabelMap;
use crate::sink::Blacklist;
use crate::types::{Classification, IdentificationResult, Verdict};

/// Distance at or above which a candidate is rejected (lower is better).
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 70.0;

#[derive(Debug, Clone, Copy)]
pub struct ClassificationPolicy {
    threshold: f32,
}

impl ClassificationPolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classify one identification result. Never fails: anything that cannot
    /// be resolved to a confident, labelled identity is Unknown.
    pub fn classify(
        &self,
        result: &IdentificationResult,
        labels: &LabelMap,
        blacklist: &dyn Blacklist,
    ) -> Verdict {
        let Some(identity) = result.identity else {
            return Verdict::unknown(result.distance);
        };

        // NaN distances fail this comparison and fall through to Unknown.
        if !(result.distance < self.threshold) {
            return Verdict::unknown(result.distance);
        }

        let Some(name) = labels.get(&identity) else {
            tracing::debug!(%identity, "identity has no label; treating as unknown");
            return Verdict::unknown(result.distance);
        };

        let blacklisted = match blacklist.is_blacklisted(name) {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(error = %err, name = %name, "blacklist lookup failed; treating as not blacklisted");
                false
            }
        };

        Verdict {
            classification: if blacklisted {
                Classification::Blacklisted
            } else {
                Classification::Known
            },
            display_name: name.clone(),
            distance: result.distance,
            identity: Some(identity),
        }
    }
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkError, StaticBlacklist};
    use crate::types::{IdentityId, UNKNOWN_NAME};

    struct BrokenBlacklist;

    impl Blacklist for BrokenBlacklist {
        fn is_blacklisted(&self, _name: &str) -> Result<bool, SinkError> {
            Err(SinkError::Unavailable("database locked".into()))
        }
    }

    fn labels() -> LabelMap {
        [(IdentityId(0), "alice".to_string()), (IdentityId(1), "mallory".to_string())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_known_below_threshold() {
        let policy = ClassificationPolicy::default();
        let verdict = policy.classify(
            &IdentificationResult::matched(IdentityId(0), 40.0),
            &labels(),
            &StaticBlacklist::default(),
        );
        assert_eq!(verdict.classification, Classification::Known);
        assert_eq!(verdict.display_name, "alice");
        assert_eq!(verdict.distance, 40.0);
        assert_eq!(verdict.identity, Some(IdentityId(0)));
    }

    #[test]
    fn test_threshold_boundary() {
        let policy = ClassificationPolicy::new(70.0);
        let blacklist = StaticBlacklist::default();
        for epsilon in [0.001f32, 0.5, 10.0] {
            let below = policy.classify(
                &IdentificationResult::matched(IdentityId(0), 70.0 - epsilon),
                &labels(),
                &blacklist,
            );
            assert_eq!(below.classification, Classification::Known, "epsilon {epsilon}");

            let above = policy.classify(
                &IdentificationResult::matched(IdentityId(0), 70.0 + epsilon),
                &labels(),
                &blacklist,
            );
            assert_eq!(above.classification, Classification::Unknown, "epsilon {epsilon}");
            assert_eq!(above.display_name, UNKNOWN_NAME);
            assert_eq!(above.distance, 70.0 + epsilon);
        }

        let at = policy.classify(
            &IdentificationResult::matched(IdentityId(0), 70.0),
            &labels(),
            &blacklist,
        );
        assert_eq!(at.classification, Classification::Unknown);
    }

    #[test]
    fn test_absent_identity_is_unknown() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::unidentified(),
            &labels(),
            &StaticBlacklist::default(),
        );
        assert_eq!(verdict, Verdict::unknown(f32::INFINITY));
    }

    #[test]
    fn test_unlabelled_identity_is_unknown() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::matched(IdentityId(42), 10.0),
            &labels(),
            &StaticBlacklist::default(),
        );
        assert_eq!(verdict.classification, Classification::Unknown);
        assert_eq!(verdict.identity, None);
    }

    #[test]
    fn test_nan_distance_is_unknown() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::matched(IdentityId(0), f32::NAN),
            &labels(),
            &StaticBlacklist::default(),
        );
        assert_eq!(verdict.classification, Classification::Unknown);
    }

    #[test]
    fn test_blacklist_takes_precedence() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::matched(IdentityId(1), 25.0),
            &labels(),
            &StaticBlacklist::new(["mallory"]),
        );
        assert_eq!(verdict.classification, Classification::Blacklisted);
        assert_eq!(verdict.display_name, "mallory");
        assert!(verdict.is_alertable());
    }

    #[test]
    fn test_blacklist_not_consulted_for_weak_match() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::matched(IdentityId(1), 95.0),
            &labels(),
            &StaticBlacklist::new(["mallory"]),
        );
        assert_eq!(verdict.classification, Classification::Unknown);
    }

    #[test]
    fn test_blacklist_failure_degrades_to_known() {
        let verdict = ClassificationPolicy::default().classify(
            &IdentificationResult::matched(IdentityId(0), 30.0),
            &labels(),
            &BrokenBlacklist,
        );
        assert_eq!(verdict.classification, Classification::Known);
    }
}
