//! Request Classification
//!
//! Turns a request policy into a ranked list of catalog models.

mod classifier;
mod policy;

pub use classifier::{
    rank, sigmoid, ClassifiedModel, ClassifierConfig, ModelCatalog, ModelDescriptor, PolicyClassifier,
};
pub use policy::{Policy, PrivacyTier};
