// src/prediction.rs
use crate::digit_model::{ClassDistribution, NUM_CLASSES};

/// Digit reported for a blank canvas.
pub const EMPTY_DIGIT: i32 = -1;

/// Outcome of one classification, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub digit: i32,
    /// Percentage with one decimal.
    pub confidence: f32,
    /// Percentages with one decimal, index i is digit i.
    pub probabilities: Vec<f32>,
}

impl PredictionResult {
    pub fn from_distribution(distribution: &ClassDistribution) -> Self {
        let digit = distribution.argmax();
        let probs = distribution.probabilities();
        Self {
            digit: digit as i32,
            confidence: to_percent(probs[digit]),
            probabilities: probs.iter().copied().map(to_percent).collect(),
        }
    }

    /// Result for a canvas with nothing drawn on it.
    pub fn empty() -> Self {
        Self {
            digit: EMPTY_DIGIT,
            confidence: 0.0,
            probabilities: vec![0.0; NUM_CLASSES],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.digit == EMPTY_DIGIT
    }
}

// probability * 100, rounded half away from zero to one decimal.
fn to_percent(probability: f32) -> f32 {
    ((f64::from(probability) * 1000.0).round() / 10.0) as f32
}
