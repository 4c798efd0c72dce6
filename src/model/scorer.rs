use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use super::calibration::sigmoid;
use crate::features::schema::{feature_names, SCHEMA};

/// An opaque fitted model: ordered feature values in, home-win probability out.
pub trait Scorer: Send + Sync {
    fn model_version(&self) -> &str;

    /// Feature-set version the model was fitted on.
    fn feature_set_version(&self) -> &str;

    fn predict(&self, features: &[Option<f64>]) -> Result<f64>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub weight: f64,
    /// Imputed when the feature is missing
    #[serde(default)]
    pub fill: f64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default = "unit")]
    pub scale: f64,
}

fn unit() -> f64 {
    1.0
}

/// Standardised logistic regression exported as JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct LogisticScorer {
    pub model_version: String,
    pub feature_set_version: String,
    pub intercept: f64,
    pub features: Vec<Coefficient>,
}

impl LogisticScorer {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let scorer: LogisticScorer = serde_json::from_str(&text)
            .with_context(|| format!("Model file {} has unexpected shape", path.display()))?;
        scorer.validate()?;
        Ok(scorer)
    }

    /// Column names must follow the schema order exactly; a model fitted on
    /// another version is accepted here and rejected at prediction time.
    fn validate(&self) -> Result<()> {
        if self.features.len() != SCHEMA.len() {
            anyhow::bail!(
                "model {} has {} coefficients, schema has {}",
                self.model_version,
                self.features.len(),
                SCHEMA.len()
            );
        }
        for (i, (coef, name)) in self.features.iter().zip(feature_names()).enumerate() {
            if coef.name != name {
                anyhow::bail!(
                    "model {} column {} is {}, schema expects {}",
                    self.model_version,
                    i,
                    coef.name,
                    name
                );
            }
            if coef.scale == 0.0 || !coef.scale.is_finite() {
                anyhow::bail!("model {} has invalid scale for {}", self.model_version, name);
            }
        }
        Ok(())
    }
}

impl Scorer for LogisticScorer {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn feature_set_version(&self) -> &str {
        &self.feature_set_version
    }

    fn predict(&self, features: &[Option<f64>]) -> Result<f64> {
        if features.len() != self.features.len() {
            anyhow::bail!(
                "expected {} features, got {}",
                self.features.len(),
                features.len()
            );
        }
        let z = self
            .features
            .iter()
            .zip(features)
            .fold(self.intercept, |z, (coef, value)| {
                let x = value.unwrap_or(coef.fill);
                z + coef.weight * (x - coef.mean) / coef.scale
            });
        Ok(sigmoid(z))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Scorer that returns a fixed value, or fails.
    pub struct FixedScorer {
        pub version: &'static str,
        pub output: Result<f64, &'static str>,
    }

    impl Scorer for FixedScorer {
        fn model_version(&self) -> &str {
            "fixed"
        }

        fn feature_set_version(&self) -> &str {
            self.version
        }

        fn predict(&self, _features: &[Option<f64>]) -> Result<f64> {
            self.output.map_err(|e| anyhow::anyhow!(e))
        }
    }

    pub fn logistic(weights: &[(&str, f64)]) -> LogisticScorer {
        LogisticScorer {
            model_version: "logit-test".into(),
            feature_set_version: "v13".into(),
            intercept: 0.0,
            features: feature_names()
                .map(|name| Coefficient {
                    name: name.to_string(),
                    weight: weights
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, w)| *w)
                        .unwrap_or(0.0),
                    fill: 0.0,
                    mean: 0.0,
                    scale: 1.0,
                })
                .collect(),
        }
    }
}
