//! Policy Classifier
//!
//! Filters the model catalog by a request's hard constraints and scores the
//! survivors against its soft thresholds.
//!
//! # Classification
//!
//! ```text
//! 1. Drop models whose privacy tier is less strict than the policy's
//! 2. Drop models whose cost weight is below the cost threshold
//! 3. For latency, accuracy, quality: weight += sigmoid(model, threshold, k)
//! ```

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::policy::{Policy, PrivacyTier};
use crate::scheduling::priority::Priority;
use crate::scheduling::task::Candidate;

// ============================================================================
// Model Catalog
// ============================================================================

fn default_slots() -> usize {
    1
}

/// A model the router may use
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier
    pub model_id: String,
    /// Provider hosting the model
    pub provider_id: String,
    /// Where the model runs
    pub privacy: PrivacyTier,
    /// Cost weight (higher = cheaper)
    #[serde(default)]
    pub weight_cost: f64,
    /// Latency weight (higher = faster)
    #[serde(default)]
    pub weight_latency: f64,
    /// Accuracy weight
    #[serde(default)]
    pub weight_accuracy: f64,
    /// Quality weight
    #[serde(default)]
    pub weight_quality: f64,
    /// Concurrent requests the model can serve
    #[serde(default = "default_slots")]
    pub slots: usize,
}

impl ModelDescriptor {
    /// Descriptor with zero weights and one slot
    pub fn new(model_id: impl Into<String>, provider_id: impl Into<String>, privacy: PrivacyTier) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            privacy,
            weight_cost: 0.0,
            weight_latency: 0.0,
            weight_accuracy: 0.0,
            weight_quality: 0.0,
            slots: 1,
        }
    }

    /// Set all four weights
    #[must_use]
    pub fn with_weights(mut self, cost: f64, latency: f64, accuracy: f64, quality: f64) -> Self {
        self.weight_cost = cost;
        self.weight_latency = latency;
        self.weight_accuracy = accuracy;
        self.weight_quality = quality;
        self
    }
}

/// Models by id
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelCatalog {
    /// Empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model
    pub fn insert(&mut self, descriptor: ModelDescriptor) -> Option<ModelDescriptor> {
        self.models.insert(descriptor.model_id.clone(), descriptor)
    }

    /// Remove a model
    pub fn remove(&mut self, model_id: &str) -> Option<ModelDescriptor> {
        self.models.remove(model_id)
    }

    /// Remove every model of a provider; returns how many went
    pub fn remove_provider(&mut self, provider_id: &str) -> usize {
        let before = self.models.len();
        self.models.retain(|_, m| m.provider_id != provider_id);
        before - self.models.len()
    }

    /// Look up a model
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(model_id)
    }

    /// Whether the catalog knows a model
    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Models in id order
    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    /// Number of models
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl FromIterator<ModelDescriptor> for ModelCatalog {
    fn from_iter<I: IntoIterator<Item = ModelDescriptor>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for descriptor in iter {
            catalog.insert(descriptor);
        }
        catalog
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classifier configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Steepness of the soft-threshold sigmoid
    pub sigmoid_k: f64,
    /// Zero a dimension's bonus when the model is below its threshold
    pub strict: bool,
    /// Policy used when a model string says `default=true`
    pub default_policy: Policy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sigmoid_k: 0.2,
            strict: false,
            default_policy: Policy::permissive(),
        }
    }
}

/// `1 / (1 + e^(-k(x - t)))`
#[must_use]
pub fn sigmoid(x: f64, threshold: f64, k: f64) -> f64 {
    1.0 / (1.0 + (-k * (x - threshold)).exp())
}

/// A catalog model that passed the hard filters
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedModel {
    /// The model
    pub descriptor: ModelDescriptor,
    /// Cumulative soft score
    pub classification_weight: f64,
}

impl ClassifiedModel {
    /// Scheduling candidate at the given tier
    #[must_use]
    pub fn to_candidate(&self, priority: Priority) -> Candidate {
        Candidate::new(
            self.descriptor.model_id.clone(),
            self.descriptor.provider_id.clone(),
            self.classification_weight,
            priority,
        )
    }
}

/// Sort best first; ties by model id
pub fn rank(models: &mut [ClassifiedModel]) {
    models.sort_by(|a, b| {
        b.classification_weight
            .total_cmp(&a.classification_weight)
            .then_with(|| a.descriptor.model_id.cmp(&b.descriptor.model_id))
    });
}

/// Policy-driven catalog filter
#[derive(Debug)]
pub struct PolicyClassifier {
    catalog: RwLock<ModelCatalog>,
    config: ClassifierConfig,
}

impl PolicyClassifier {
    /// Classifier over a catalog
    #[must_use]
    pub fn new(catalog: ModelCatalog, config: ClassifierConfig) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            config,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Add a catalog model, or replace one from the same provider
    ///
    /// Returns `false` and leaves the catalog unchanged when the model id
    /// already belongs to another provider.
    pub fn register_model(&self, descriptor: ModelDescriptor) -> bool {
        let mut catalog = self.catalog.write();
        if let Some(existing) = catalog.get(&descriptor.model_id) {
            if existing.provider_id != descriptor.provider_id {
                tracing::warn!(
                    model_id = %descriptor.model_id,
                    provider_id = %descriptor.provider_id,
                    owner = %existing.provider_id,
                    "Model id already served by another provider; not registered"
                );
                return false;
            }
        }
        tracing::debug!(
            model_id = %descriptor.model_id,
            provider_id = %descriptor.provider_id,
            privacy = %descriptor.privacy,
            "Catalog model registered"
        );
        catalog.insert(descriptor);
        true
    }

    /// Drop a provider's models from the catalog
    pub fn remove_provider(&self, provider_id: &str) -> usize {
        self.catalog.write().remove_provider(provider_id)
    }

    /// Copy of the catalog
    #[must_use]
    pub fn catalog(&self) -> ModelCatalog {
        self.catalog.read().clone()
    }

    /// Models that satisfy the policy, with their soft scores
    ///
    /// The prompt is accepted for interface stability; classification is
    /// policy-only. An empty result is a normal outcome.
    pub fn classify(&self, prompt: &str, policy: &Policy, strict: bool) -> Vec<ClassifiedModel> {
        let k = self.config.sigmoid_k;
        let catalog = self.catalog.read();

        let survivors: Vec<ClassifiedModel> = catalog
            .iter()
            .filter(|m| m.privacy.satisfies(policy.threshold_privacy))
            .filter(|m| m.weight_cost >= policy.threshold_cost)
            .map(|m| {
                let dimensions = [
                    (m.weight_latency, policy.threshold_latency),
                    (m.weight_accuracy, policy.threshold_accuracy),
                    (m.weight_quality, policy.threshold_quality),
                ];
                let classification_weight = dimensions
                    .iter()
                    .map(|&(weight, threshold)| {
                        if strict && weight < threshold {
                            0.0
                        } else {
                            sigmoid(weight, threshold, k)
                        }
                    })
                    .sum();
                ClassifiedModel {
                    descriptor: m.clone(),
                    classification_weight,
                }
            })
            .collect();

        tracing::debug!(
            prompt_chars = prompt.chars().count(),
            catalog = catalog.len(),
            survivors = survivors.len(),
            strict,
            "Classified request"
        );
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        [
            ModelDescriptor::new("llama3", "ollama-local", PrivacyTier::Local).with_weights(90.0, 40.0, 50.0, 55.0),
            ModelDescriptor::new("mistral-eu", "azure-eu", PrivacyTier::CloudInEuByEuProvider)
                .with_weights(60.0, 70.0, 70.0, 70.0),
            ModelDescriptor::new("gpt-4o", "azure-us", PrivacyTier::CloudNotInEuByUsProvider)
                .with_weights(20.0, 80.0, 95.0, 95.0),
        ]
        .into_iter()
        .collect()
    }

    fn ids(models: &[ClassifiedModel]) -> Vec<&str> {
        models.iter().map(|m| m.descriptor.model_id.as_str()).collect()
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(10.0, 10.0, 0.2) - 0.5).abs() < 1e-12);
        assert!(sigmoid(20.0, 10.0, 0.2) > 0.5);
        assert!(sigmoid(0.0, 10.0, 0.2) < 0.5);
    }

    #[test]
    fn test_cost_threshold_excludes() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        let policy = Policy {
            threshold_cost: 50.0,
            ..Policy::permissive()
        };
        let mut result = classifier.classify("hi", &policy, false);
        rank(&mut result);
        assert!(!ids(&result).contains(&"gpt-4o"));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_privacy_threshold_excludes() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        let policy = Policy {
            threshold_privacy: PrivacyTier::CloudInEuByEuProvider,
            ..Policy::permissive()
        };
        let mut result = classifier.classify("hi", &policy, false);
        rank(&mut result);
        let mut names = ids(&result);
        names.sort_unstable();
        assert_eq!(names, vec!["llama3", "mistral-eu"]);
    }

    #[test]
    fn test_quality_monotonic() {
        let policy = Policy {
            threshold_quality: 60.0,
            threshold_latency: 50.0,
            ..Policy::permissive()
        };
        for strict in [false, true] {
            let mut previous = f64::NEG_INFINITY;
            for quality in [0.0, 30.0, 59.9, 60.0, 75.0, 100.0] {
                let catalog: ModelCatalog = [ModelDescriptor::new("m", "p", PrivacyTier::Local)
                    .with_weights(10.0, 50.0, 50.0, quality)]
                .into_iter()
                .collect();
                let classifier = PolicyClassifier::new(catalog, ClassifierConfig::default());
                let weight = classifier.classify("", &policy, strict)[0].classification_weight;
                assert!(weight >= previous, "quality {quality} strict {strict}");
                previous = weight;
            }
        }
    }

    #[test]
    fn test_strict_zeroes_dimension_without_excluding() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        let policy = Policy {
            threshold_quality: 80.0,
            ..Policy::permissive()
        };
        let lenient = classifier.classify("", &policy, false);
        let strict = classifier.classify("", &policy, true);
        assert_eq!(lenient.len(), strict.len());

        let weight = |models: &[ClassifiedModel], id: &str| {
            models
                .iter()
                .find(|m| m.descriptor.model_id == id)
                .map(|m| m.classification_weight)
                .unwrap()
        };
        assert!(weight(&strict, "llama3") < weight(&lenient, "llama3"));
        assert_eq!(weight(&strict, "gpt-4o"), weight(&lenient, "gpt-4o"));
    }

    #[test]
    fn test_rank_and_candidates() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        let policy = Policy {
            threshold_latency: 60.0,
            threshold_accuracy: 60.0,
            threshold_quality: 60.0,
            ..Policy::permissive()
        };
        let mut result = classifier.classify("", &policy, false);
        rank(&mut result);
        assert_eq!(ids(&result), vec!["gpt-4o", "mistral-eu", "llama3"]);

        let candidate = result[0].to_candidate(Priority::High);
        assert_eq!(candidate.model_id, "gpt-4o");
        assert_eq!(candidate.provider_id, "azure-us");
        assert_eq!(candidate.priority, Priority::High);
    }

    #[test]
    fn test_register_rejects_model_owned_elsewhere() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        let temp = ModelDescriptor::new("llama3", "temp-1", PrivacyTier::Local);
        assert!(!classifier.register_model(temp));
        assert_eq!(classifier.catalog().get("llama3").map(|m| m.provider_id.as_str()), Some("ollama-local"));

        assert_eq!(classifier.remove_provider("temp-1"), 0);
        assert!(classifier.catalog().contains("llama3"));

        let updated = ModelDescriptor::new("llama3", "ollama-local", PrivacyTier::Local).with_weights(1.0, 1.0, 1.0, 1.0);
        assert!(classifier.register_model(updated));
        assert_eq!(classifier.catalog().get("llama3").map(|m| m.weight_cost), Some(1.0));
    }

    #[test]
    fn test_remove_provider() {
        let classifier = PolicyClassifier::new(catalog(), ClassifierConfig::default());
        assert_eq!(classifier.remove_provider("azure-eu"), 1);
        assert!(!classifier.catalog().contains("mistral-eu"));
        assert!(classifier.classify("", &Policy::permissive(), false).len() == 2);
    }
}
