//! Threshold decision and confidence reporting on top of LBPH prediction.

use crate::config::{ConfidenceTiers, MatcherConfig};
use crate::lbph::{LbphError, TrainedModel};
use crate::preprocess::CanonicalFace;
use crate::types::IdentityRecord;
use serde::Serialize;

/// Reporting bucket for a match distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Excellent,
    Good,
    Fair,
    Reject,
}

impl ConfidenceTier {
    pub fn classify(distance: f64, tiers: &ConfidenceTiers) -> Self {
        if distance < tiers.excellent_below {
            Self::Excellent
        } else if distance < tiers.good_below {
            Self::Good
        } else if distance <= tiers.fair_up_to {
            Self::Fair
        } else {
            Self::Reject
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// Nearest identity was farther than the threshold.
    BelowConfidenceThreshold,
    /// There is no trained model to match against.
    ModelNotTrained,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Known {
        identity: IdentityRecord,
        label: u32,
        distance: f64,
        confidence: f64,
        tier: ConfidenceTier,
    },
    Unknown {
        distance: Option<f64>,
        reason: UnknownReason,
    },
}

/// Turns LBPH distances into identity decisions.
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &'static str {
        "lbph"
    }

    pub fn default_threshold(&self) -> f64 {
        self.config.threshold
    }

    /// `max(0, 100 * (1 - distance / max_expected_distance))`.
    pub fn confidence(&self, distance: f64) -> f64 {
        (100.0 * (1.0 - distance / self.config.max_expected_distance)).max(0.0)
    }

    pub fn tier(&self, distance: f64) -> ConfidenceTier {
        ConfidenceTier::classify(distance, &self.config.tiers)
    }

    /// Match one face. `None` for `model` yields `Unknown(ModelNotTrained)`.
    pub fn match_face(
        &self,
        face: &CanonicalFace,
        model: Option<&TrainedModel>,
        threshold: f64,
    ) -> Result<MatchOutcome, LbphError> {
        let Some(trained) = model else {
            return Ok(MatchOutcome::Unknown {
                distance: None,
                reason: UnknownReason::ModelNotTrained,
            });
        };
        let prediction = trained.model().predict(face)?;
        Ok(self.decide(trained, prediction.label, prediction.distance, threshold))
    }

    fn decide(&self, trained: &TrainedModel, label: u32, distance: f64, threshold: f64) -> MatchOutcome {
        match trained.label_map().get(label) {
            Some(identity) if distance <= threshold => MatchOutcome::Known {
                identity: identity.clone(),
                label,
                distance,
                confidence: self.confidence(distance),
                tier: self.tier(distance),
            },
            _ => MatchOutcome::Unknown {
                distance: Some(distance),
                reason: UnknownReason::BelowConfidenceThreshold,
            },
        }
    }
}
