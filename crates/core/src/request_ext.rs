//! Gateway metadata accessors for `tonic::Request`.
//!
//! The gateway forwards request correlation and identity as flat metadata.
//! RPC services read it back through [`GatewayRequestExt`]:
//!
//! ```ignore
//! use gateway_core::GatewayRequestExt;
//!
//! async fn get_user(&self, request: Request<GetUserRequest>) -> Result<Response<User>, Status> {
//!     let app_id = request.require_app_id()?;
//!     tracing::info!(request_id = request.request_id(), app_id, "get_user");
//!     // ...
//! }
//! ```

use tonic::{Request, Status};

use crate::code;
use crate::error::ApiError;

pub const REQUEST_ID_KEY: &str = "rq_id";
pub const REQUEST_TYPE_KEY: &str = "rq_type";
pub const REQUEST_FROM_KEY: &str = "rq_from";
pub const APP_ID_KEY: &str = "app_id";
pub const USER_ID_KEY: &str = "user_id";

/// Extension trait for reading gateway metadata from RPC requests.
pub trait GatewayRequestExt {
    /// Raw metadata value, if present and ASCII.
    fn gateway_value(&self, key: &str) -> Option<&str>;

    fn request_id(&self) -> Option<&str> {
        self.gateway_value(REQUEST_ID_KEY)
    }

    fn request_type(&self) -> Option<&str> {
        self.gateway_value(REQUEST_TYPE_KEY)
    }

    fn request_from(&self) -> Option<&str> {
        self.gateway_value(REQUEST_FROM_KEY)
    }

    fn app_id(&self) -> Option<&str> {
        self.gateway_value(APP_ID_KEY)
    }

    fn user_id(&self) -> Option<&str> {
        self.gateway_value(USER_ID_KEY)
    }

    /// App id forwarded by the gateway.
    ///
    /// # Errors
    /// Returns the application-invalid status if the app id is missing.
    fn require_app_id(&self) -> Result<&str, Status> {
        self.app_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::unauthorized(code::APP_INVALID).to_status())
    }

    /// User id forwarded by the gateway.
    ///
    /// # Errors
    /// Returns the token-invalid status if the user id is missing.
    fn require_user_id(&self) -> Result<&str, Status> {
        self.user_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::unauthorized(code::TOKEN_INVALID).to_status())
    }
}

impl<T> GatewayRequestExt for Request<T> {
    fn gateway_value(&self, key: &str) -> Option<&str> {
        self.metadata().get(key).and_then(|value| value.to_str().ok())
    }
}
