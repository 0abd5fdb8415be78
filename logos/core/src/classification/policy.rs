//! Request Policy
//!
//! Hard constraints (privacy, cost) exclude models; soft thresholds
//! (latency, accuracy, quality) only shape the ranking.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model_string::{ModelStringError, ParsedModelString};

/// Where a model runs and who operates it
///
/// Ordered by strictness: `Local` is the strictest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivacyTier {
    /// On the local machine
    Local,
    /// EU data centre run by an EU company
    CloudInEuByEuProvider,
    /// EU data centre run by a US company
    CloudInEuByUsProvider,
    /// Outside the EU, US company
    CloudNotInEuByUsProvider,
}

impl PrivacyTier {
    /// Every tier, strictest first
    pub const ALL: [PrivacyTier; 4] = [
        Self::Local,
        Self::CloudInEuByEuProvider,
        Self::CloudInEuByUsProvider,
        Self::CloudNotInEuByUsProvider,
    ];

    /// Higher is stricter
    #[must_use]
    pub fn strictness(self) -> u8 {
        match self {
            Self::Local => 3,
            Self::CloudInEuByEuProvider => 2,
            Self::CloudInEuByUsProvider => 1,
            Self::CloudNotInEuByUsProvider => 0,
        }
    }

    /// Whether a model at this tier may serve a request requiring `required`
    #[must_use]
    pub fn satisfies(self, required: PrivacyTier) -> bool {
        self.strictness() >= required.strictness()
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::CloudInEuByEuProvider => "CLOUD_IN_EU_BY_EU_PROVIDER",
            Self::CloudInEuByUsProvider => "CLOUD_IN_EU_BY_US_PROVIDER",
            Self::CloudNotInEuByUsProvider => "CLOUD_NOT_IN_EU_BY_US_PROVIDER",
        }
    }
}

impl FromStr for PrivacyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == upper)
            .ok_or_else(|| format!("unknown privacy tier '{s}'"))
    }
}

impl std::fmt::Display for PrivacyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds applied to the model catalog
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Least strict privacy tier acceptable
    pub threshold_privacy: PrivacyTier,
    /// Minimum cost weight (higher weight = cheaper)
    pub threshold_cost: f64,
    /// Latency threshold for soft scoring
    pub threshold_latency: f64,
    /// Accuracy threshold for soft scoring
    pub threshold_accuracy: f64,
    /// Quality threshold for soft scoring
    pub threshold_quality: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self::permissive()
    }
}

impl Policy {
    /// Accept every model, no soft preference
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            threshold_privacy: PrivacyTier::CloudNotInEuByUsProvider,
            threshold_cost: 0.0,
            threshold_latency: 0.0,
            threshold_accuracy: 0.0,
            threshold_quality: 0.0,
        }
    }

    /// Build the policy a parsed model string asks for
    ///
    /// `default=true` starts from `defaults`, `default=false` from
    /// [`Policy::permissive`]; explicit keys override either.
    pub fn from_parsed(parsed: &ParsedModelString, defaults: &Policy) -> Result<Self, ModelStringError> {
        let mut policy = if parsed.uses_default_policy() {
            defaults.clone()
        } else {
            Self::permissive()
        };

        for (key, value) in parsed.overrides() {
            let invalid = || ModelStringError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "privacy" => policy.threshold_privacy = value.parse().map_err(|_| invalid())?,
                "cost" => policy.threshold_cost = value.parse().map_err(|_| invalid())?,
                "latency" => policy.threshold_latency = value.parse().map_err(|_| invalid())?,
                "accuracy" => policy.threshold_accuracy = value.parse().map_err(|_| invalid())?,
                "quality" => policy.threshold_quality = value.parse().map_err(|_| invalid())?,
                _ => return Err(invalid()),
            }
        }
        Ok(policy)
    }
}
