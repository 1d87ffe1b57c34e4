//! Shared error taxonomy for the gateway and its RPC backends.
//!
//! - Error codes with project namespacing
//! - Localized message catalog
//! - `ApiError` with HTTP, gRPC and envelope conversions
//! - Gateway metadata accessors for `tonic::Request`
//! - JWT user tokens (with `jwt` feature)

pub mod code;
pub mod envelope;
pub mod error;
#[cfg(feature = "jwt")]
pub mod jwt;
pub mod messages;
pub mod request_ext;
pub mod status;

pub use code::{ErrorCode, ErrorCodeFactory, MessageResolver, Project};
pub use envelope::{ErrorEntry, ErrorEnvelope, Marshaler};
pub use error::{ApiError, BoxError, ErrorReport, RequestTag};
#[cfg(feature = "jwt")]
pub use jwt::{Claims, JwtError, JwtValidator, UserInfo};
pub use messages::{CatalogError, MessageCatalog};
pub use request_ext::GatewayRequestExt;
pub use status::HttpStatus;
