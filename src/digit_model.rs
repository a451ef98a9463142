// src/digit_model.rs
use crate::config::{ConfigError, MODEL_FILE, ModelConfig, OutputKind};
use crate::preprocess::NormalizedTensor;
use ort::error::Error as OrtError;
use ort::inputs;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use std::path::Path;

/// Digits 0 through 9.
pub const NUM_CLASSES: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] OrtError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid path for model files: {0}")]
    InvalidPath(String),
    #[error("Model output format unexpected: expected {NUM_CLASSES} scores, got {0}")]
    OutputFormatUnexpected(usize),
    #[error("Model output is not a probability distribution")]
    OutputConversion,
}

/// Probabilities for the ten digits, non-negative and summing to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassDistribution([f32; NUM_CLASSES]);

impl ClassDistribution {
    pub fn from_logits(logits: &[f32]) -> Result<Self, ModelError> {
        Self::from_scores(&softmax(logits))
    }

    /// Accepts scores that are already probabilities, renormalising away
    /// rounding drift.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, ModelError> {
        let total: f32 = probabilities.iter().sum();
        if !total.is_finite() || total <= 0.0 || probabilities.iter().any(|p| *p < 0.0) {
            return Err(ModelError::OutputConversion);
        }
        let normalized: Vec<f32> = probabilities.iter().map(|p| p / total).collect();
        Self::from_scores(&normalized)
    }

    fn from_scores(scores: &[f32]) -> Result<Self, ModelError> {
        let scores: [f32; NUM_CLASSES] = scores
            .try_into()
            .map_err(|_| ModelError::OutputFormatUnexpected(scores.len()))?;
        if scores.iter().any(|p| !p.is_finite()) {
            return Err(ModelError::OutputConversion);
        }
        Ok(Self(scores))
    }

    pub fn probabilities(&self) -> &[f32; NUM_CLASSES] {
        &self.0
    }

    /// Most likely digit; the lowest index wins a tie.
    pub fn argmax(&self) -> usize {
        self.0
            .iter()
            .enumerate()
            .fold(0, |best, (i, p)| if *p > self.0[best] { i } else { best })
    }
}

/// Anything that can score a normalised digit.
///
/// Implementations are loaded once and shared read-only across requests.
pub trait Classifier: Send + Sync {
    fn classify(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError>;

    fn version(&self) -> &str;
}

/// The digit CNN exported to ONNX and served by ONNX Runtime.
///
/// The export is taken in eval mode, so dropout and batch-norm statistics are
/// frozen in the graph and repeated calls on the same tensor agree.
pub struct DigitModel {
    session: Session,
    config: ModelConfig,
    output_name: String,
}

impl DigitModel {
    pub fn new(model_dir: &Path) -> Result<Self, ModelError> {
        let model_path = model_dir.join(MODEL_FILE);
        tracing::info!(path = ?model_path, "loading digit model");

        if !model_path.exists() {
            return Err(ModelError::InvalidPath(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        let config = ModelConfig::load(model_dir)?;
        tracing::info!(?config, "model config loaded");

        let intra_threads = config.intra_threads.unwrap_or_else(num_cpus::get);
        let session = SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(&model_path)?;

        let output_name = match &config.output_name {
            Some(name) => name.clone(),
            None => session
                .outputs
                .first()
                .map(|output| output.name.clone())
                .ok_or(ModelError::OutputFormatUnexpected(0))?,
        };
        tracing::info!(
            input = %config.input_name,
            output = %output_name,
            intra_threads,
            "ONNX Runtime session created"
        );

        Ok(Self { session, config, output_name })
    }
}

impl Classifier for DigitModel {
    fn classify(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
        let inputs = inputs![self.config.input_name.as_str() => tensor.view()]?;
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output_value = outputs
            .get(self.output_name.as_str())
            .ok_or(ModelError::OutputFormatUnexpected(0))?;
        // Shape is [1, 10].
        let scores: Vec<f32> = output_value.try_extract_tensor::<f32>()?.iter().copied().collect();

        match self.config.output_kind {
            OutputKind::Logits => ClassDistribution::from_logits(&scores),
            OutputKind::Probabilities => ClassDistribution::from_probabilities(&scores),
        }
    }

    fn version(&self) -> &str {
        &self.config.model_version
    }
}

fn softmax(data: &[f32]) -> Vec<f32> {
    let max_val = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = data.iter().map(|&x| (x - max_val).exp()).collect();
    let sum_exps: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum_exps).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs.iter().all(|p| *p >= 0.0));
        assert!((probs[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn logits_become_probabilities() {
        let mut logits = [0.0f32; NUM_CLASSES];
        logits[7] = 5.0;
        let dist = ClassDistribution::from_logits(&logits).unwrap();

        assert_eq!(dist.argmax(), 7);
        let total: f32 = dist.probabilities().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(dist.probabilities()[7] > 0.9);
    }

    #[test]
    fn probabilities_are_renormalised() {
        let dist = ClassDistribution::from_probabilities(&[0.2, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.2]).unwrap();
        assert!((dist.probabilities()[0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(dist.argmax(), 0);
    }

    #[test]
    fn wrong_output_shapes_are_rejected() {
        assert!(matches!(
            ClassDistribution::from_logits(&[0.0; 3]),
            Err(ModelError::OutputFormatUnexpected(3))
        ));
        assert!(matches!(
            ClassDistribution::from_probabilities(&[0.0; NUM_CLASSES]),
            Err(ModelError::OutputConversion)
        ));
        assert!(matches!(
            ClassDistribution::from_probabilities(&[-0.5, 1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            Err(ModelError::OutputConversion)
        ));
    }

    #[test]
    fn missing_model_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(DigitModel::new(dir.path()), Err(ModelError::InvalidPath(_))));
    }

    #[test]
    fn unreadable_model_config_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MODEL_FILE), b"placeholder").unwrap();
        std::fs::create_dir(dir.path().join(crate::config::MODEL_CONFIG_FILE)).unwrap();
        assert!(matches!(
            DigitModel::new(dir.path()),
            Err(ModelError::Config(ConfigError::Io { .. }))
        ));
    }
}
