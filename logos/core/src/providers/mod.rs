//! Temp Providers
//!
//! Ephemeral, self-registered model servers: the registry that tracks them,
//! model discovery, and the health monitor that removes dead ones.

mod discovery;
mod health;
mod registry;

pub use discovery::{DiscoveryError, ModelDiscovery};
pub use health::{HealthConfig, HealthMonitor, HealthReport, HttpProbe, ProbeOutcome, ProviderProbe, PROBE_PATHS};
pub use registry::{ProviderRegistration, ProviderRegistry, TempProvider};
