//! Request Admission
//!
//! Turns the model field of an incoming request into scheduling candidates:
//! parse the model string, build its policy, classify the catalog and rank
//! the survivors. A plain catalog model id skips classification and pins the
//! request to that model.

use crate::classification::{rank, ClassifiedModel, Policy, PolicyClassifier};
use crate::model_string::{self, ModelStringError, ParsedModelString, MODEL_STRING_PREFIX};
use crate::scheduling::{Candidate, Priority};

/// How a request's model field was resolved
#[derive(Clone, Debug, PartialEq)]
pub enum Routing {
    /// A `logos-v..` model string, classified against the catalog
    Classified {
        /// Parsed model string
        parsed: ParsedModelString,
        /// Effective policy
        policy: Policy,
    },
    /// A catalog model id
    Direct,
}

/// Ranked candidates for one request
#[derive(Clone, Debug, PartialEq)]
pub struct AdmissionPlan {
    /// How the model field was resolved
    pub routing: Routing,
    /// Tier the request is queued at
    pub priority: Priority,
    /// Models that may serve the request, best first
    pub ranked: Vec<ClassifiedModel>,
}

impl AdmissionPlan {
    /// Scheduling candidates, best first
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.ranked.iter().map(|m| m.to_candidate(self.priority)).collect()
    }

    /// Whether no model can serve the request
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

/// Resolve a request's model field
///
/// An empty plan is not an error; the caller decides how to reject it.
pub fn admit(
    classifier: &PolicyClassifier,
    model: &str,
    prompt: &str,
    priority: Priority,
) -> Result<AdmissionPlan, ModelStringError> {
    let model = model.trim();

    if !model.starts_with(MODEL_STRING_PREFIX) {
        let descriptor = classifier
            .catalog()
            .get(model)
            .cloned()
            .ok_or_else(|| ModelStringError::Syntax(format!("unknown model '{model}'")))?;
        return Ok(AdmissionPlan {
            routing: Routing::Direct,
            priority,
            ranked: vec![ClassifiedModel {
                descriptor,
                classification_weight: 1.0,
            }],
        });
    }

    let parsed = model_string::parse(model)?;
    let policy = Policy::from_parsed(&parsed, &classifier.config().default_policy)?;
    let mut ranked = classifier.classify(prompt, &policy, classifier.config().strict);
    rank(&mut ranked);

    if ranked.is_empty() {
        tracing::info!(model, privacy = %policy.threshold_privacy, "No catalog model satisfies policy");
    }

    Ok(AdmissionPlan {
        routing: Routing::Classified { parsed, policy },
        priority,
        ranked,
    })
}
