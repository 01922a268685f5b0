//! Humor classification.
//!
//! A [`Classifier`] turns text into `P(funny)`; [`predict`] applies a
//! [`Threshold`] to get a label. [`ClassificationService`] owns the model
//! currently in service and lets it be swapped while predictions run.

mod model;
mod service;

pub use model::{HashedLinearModel, ModelConfig, MODEL_TYPE};
pub use service::{ClassificationService, ModelHandle};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::commit::HumorLabel;
use crate::error::{ClassifyError, ConfigError, Result};

/// Inference seam. Implementations must be pure: the same text always
/// yields the same probability.
pub trait Classifier: Send + Sync {
    /// Probability in `[0, 1]` that `text` is humorous.
    fn funny_probability(&self, text: &str) -> Result<f32>;
}

/// Decision boundary on `P(funny)`, validated to lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Threshold(f32);

impl Threshold {
    pub const DEFAULT: Threshold = Threshold(0.7);

    pub fn new(value: f32) -> Result<Self, ConfigError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::Invalid(format!(
                "threshold must be within [0, 1], got {value}"
            )))
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }

    pub fn label_for(&self, confidence: f32) -> HumorLabel {
        if confidence >= self.0 {
            HumorLabel::Funny
        } else {
            HumorLabel::NotFunny
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f32> for Threshold {
    type Error = ConfigError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Threshold> for f32 {
    fn from(t: Threshold) -> f32 {
        t.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of classifying one text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: HumorLabel,
    pub confidence: f32,
}

impl Prediction {
    pub fn is_funny(&self) -> bool {
        self.label.is_funny()
    }
}

/// Classify `text` with the model behind `handle`.
pub fn predict(handle: &ModelHandle, text: &str, threshold: Threshold) -> Result<Prediction> {
    let confidence = handle.model().funny_probability(text)?;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(ClassifyError::Inference(format!(
            "model {} returned out-of-range probability {confidence}",
            handle.version()
        )));
    }
    Ok(Prediction {
        label: threshold.label_for(confidence),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Fixed(f32);

    impl Classifier for Fixed {
        fn funny_probability(&self, _text: &str) -> Result<f32> {
            Ok(self.0)
        }
    }

    fn handle(p: f32) -> ModelHandle {
        ModelHandle::new("test", Arc::new(Fixed(p)))
    }

    #[test]
    fn above_threshold_is_funny() {
        let p = predict(&handle(0.730), "lol", Threshold::DEFAULT).unwrap();
        assert_eq!(p.label, HumorLabel::Funny);
        assert!(p.is_funny());
        assert_eq!(p.confidence, 0.730);
    }

    #[test]
    fn below_threshold_is_not_funny() {
        let p = predict(&handle(0.280), "refactor", Threshold::DEFAULT).unwrap();
        assert_eq!(p.label, HumorLabel::NotFunny);
        assert!(!p.is_funny());
    }

    #[test]
    fn boundary_counts_as_funny() {
        let t = Threshold::new(0.5).unwrap();
        assert_eq!(predict(&handle(0.5), "x", t).unwrap().label, HumorLabel::Funny);
    }

    #[test]
    fn non_finite_output_is_an_inference_error() {
        for bad in [f32::NAN, f32::INFINITY, 1.5, -0.1] {
            assert!(matches!(
                predict(&handle(bad), "x", Threshold::DEFAULT),
                Err(ClassifyError::Inference(_))
            ));
        }
    }

    #[test]
    fn threshold_rejects_out_of_range() {
        assert!(Threshold::new(1.01).is_err());
        assert!(Threshold::new(-0.01).is_err());
        assert!(Threshold::new(f32::NAN).is_err());
        assert!(serde_json::from_str::<Threshold>("2.0").is_err());
        assert_eq!(serde_json::from_str::<Threshold>("0.25").unwrap().value(), 0.25);
    }
}
