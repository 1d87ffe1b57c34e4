//! API gateway core: request pipeline, principal correlation and error
//! translation in front of gRPC backends.

pub mod config;
pub mod correlation;
pub mod metadata;
pub mod middleware;
pub mod pipeline;
pub mod principal;
pub mod providers;
pub mod routes;
pub mod startup;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
pub use correlation::{CorrelationGuard, CorrelationStore, PrincipalBridge};
pub use metadata::{MetadataBridge, MetadataContext};
pub use middleware::{AppValidation, HeaderNames, StageName};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use principal::{AppPrincipal, Attributes, Identity, UserPrincipal};
pub use providers::{
    AppProvider, CryptProvider, PermissionProvider, ProviderError, SignProvider, SignSubject,
    SignToken, UserProvider,
};
pub use startup::Providers;
