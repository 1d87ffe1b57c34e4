//! Structured API errors.
//!
//! An [`ApiError`] pairs an [`HttpStatus`] class with an [`ErrorCode`] and an
//! optional cause chain. It converts to a `tonic::Status` for RPC callers and
//! to an HTTP response carrying an [`ErrorReport`] for the gateway renderer.
//! Internal details are logged but only exposed to clients in debug mode.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::{HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tonic::Status;
use tracing::error;

use crate::code::{self, ErrorCode};
use crate::envelope::{ErrorEntry, ErrorEnvelope, Marshaler};
use crate::messages::{self, MessageCatalog, format_message};
use crate::status::HttpStatus;

pub type BoxError = Box<dyn StdError + Send + Sync>;

const INTERNAL_MESSAGE: &str = "internal error";

/// Request classification attached to an error for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTag {
    pub kind: String,
    pub id: String,
}

/// Gateway error with a status class, a code and an optional cause.
pub struct ApiError {
    status: HttpStatus,
    code: ErrorCode,
    source: Option<BoxError>,
    message: Option<String>,
    params: Vec<String>,
    data: Option<Value>,
    /// Protobuf encoding of `data`, sent to binary clients.
    binary: Option<Vec<u8>>,
    request: Option<RequestTag>,
    http_status: Option<StatusCode>,
}

impl ApiError {
    #[must_use]
    pub fn new(status: HttpStatus, code: ErrorCode) -> Self {
        Self {
            status,
            code,
            source: None,
            message: None,
            params: Vec::new(),
            data: None,
            binary: None,
            request: None,
            http_status: None,
        }
    }

    /// Wrap `err` as the cause of a new error.
    ///
    /// If `err` already is an `ApiError` with the same status and code it is
    /// returned unchanged.
    pub fn wrap(status: HttpStatus, code: ErrorCode, err: impl Into<BoxError>) -> Self {
        let err = err.into();
        match err.downcast::<Self>() {
            Ok(api) if api.status == status && api.code == code => *api,
            Ok(api) => Self::new(status, code).with_source(*api),
            Err(err) => Self::new(status, code).with_source(err),
        }
    }

    /// Success carrying a payload rendered in place of the envelope.
    #[must_use]
    pub fn created(data: Value) -> Self {
        Self::new(HttpStatus::Created, code::SUCCESS).with_data(data)
    }

    /// Created success carrying a message, rendered as protobuf for binary
    /// clients and as JSON otherwise.
    #[must_use]
    pub fn created_message<M>(message: &M) -> Self
    where
        M: prost::Message + Serialize,
    {
        let data = serde_json::to_value(message).unwrap_or(Value::Null);
        let mut err = Self::created(data);
        err.binary = Some(message.encode_to_vec());
        err
    }

    /// Success rendered without a body.
    #[must_use]
    pub fn deleted() -> Self {
        Self::new(HttpStatus::Deleted, code::SUCCESS)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(HttpStatus::BadRequest, code::INVALID_ARGUMENTS).with_message(message)
    }

    /// Invalid argument resolved through the `2.{target}` catalog key.
    #[must_use]
    pub fn validation_target(target: impl Into<String>) -> Self {
        Self::new(
            HttpStatus::BadRequest,
            code::INVALID_ARGUMENTS.with_target(target),
        )
    }

    #[must_use]
    pub fn bad_request(code: ErrorCode) -> Self {
        Self::new(HttpStatus::BadRequest, code)
    }

    #[must_use]
    pub fn unauthorized(code: ErrorCode) -> Self {
        Self::new(HttpStatus::Unauthorized, code)
    }

    #[must_use]
    pub fn forbidden(code: ErrorCode) -> Self {
        Self::new(HttpStatus::Forbidden, code)
    }

    /// Not found, with `id` as the first message parameter.
    #[must_use]
    pub fn not_found(code: ErrorCode, id: impl fmt::Display) -> Self {
        Self::new(HttpStatus::NotFound, code).with_params([id.to_string()])
    }

    #[must_use]
    pub fn conflict() -> Self {
        Self::new(HttpStatus::Conflict, code::CONFLICT)
    }

    #[must_use]
    pub fn locked(code: ErrorCode) -> Self {
        Self::new(HttpStatus::Locked, code)
    }

    pub fn internal(err: impl Into<BoxError>) -> Self {
        Self::wrap(HttpStatus::Internal, code::INTERNAL, err)
    }

    pub fn internal_code(code: ErrorCode, err: impl Into<BoxError>) -> Self {
        Self::wrap(HttpStatus::Internal, code, err)
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Literal message used instead of the code's resolver.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_request(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.request = Some(RequestTag {
            kind: kind.into(),
            id: id.into(),
        });
        self
    }

    /// Override the HTTP status derived from the status class.
    #[must_use]
    pub fn with_http_status(mut self, status: StatusCode) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn set_locale(&mut self, locale: impl Into<String>) {
        self.code = self.code.clone().with_locale(locale);
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.code = self.code.clone().with_target(target);
    }

    pub fn set_project(&mut self, id: u32, name: impl Into<std::borrow::Cow<'static, str>>) {
        self.code = self.code.clone().with_project(id, name);
    }

    #[inline]
    #[must_use]
    pub const fn status(&self) -> HttpStatus {
        self.status
    }

    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &ErrorCode {
        &self.code
    }

    /// Wire value of the error code.
    #[must_use]
    pub fn code(&self) -> u32 {
        self.code.code()
    }

    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        self.http_status.unwrap_or_else(|| self.status.code())
    }

    /// Encode the data payload for `marshaler`.
    ///
    /// Binary clients get the protobuf encoding when one was supplied; JSON
    /// is used otherwise.
    ///
    /// # Errors
    /// Returns the JSON serializer error.
    pub fn encode_data(&self, marshaler: Marshaler) -> Result<(HeaderValue, Vec<u8>), serde_json::Error> {
        match (marshaler, &self.binary) {
            (Marshaler::Binary, Some(binary)) => Ok((marshaler.content_type(), binary.clone())),
            _ => {
                let data = self.data.as_ref().unwrap_or(&Value::Null);
                Ok((Marshaler::Json.content_type(), serde_json::to_vec(data)?))
            }
        }
    }

    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    #[must_use]
    pub const fn request(&self) -> Option<&RequestTag> {
        self.request.as_ref()
    }

    #[must_use]
    pub fn grpc_code(&self) -> tonic::Code {
        tonic::Code::from(self.code() as i32)
    }

    /// Message resolved against the process-wide catalog.
    #[must_use]
    pub fn message(&self) -> String {
        self.message_in(&messages::catalog())
    }

    #[must_use]
    pub fn message_in(&self, catalog: &MessageCatalog) -> String {
        self.localized_message(catalog, None)
    }

    /// Literal override, then the code's resolver, then a generic message.
    ///
    /// `locale` applies only when the code carries no locale of its own.
    #[must_use]
    pub fn localized_message(&self, catalog: &MessageCatalog, locale: Option<&str>) -> String {
        if let Some(message) = &self.message {
            return format_message(message, &self.params);
        }
        let message = match locale {
            Some(locale) if self.code.locale().is_none() => self
                .code
                .clone()
                .with_locale(locale)
                .message_in(catalog, &self.params),
            _ => self.code.message_in(catalog, &self.params),
        };
        if message.is_empty() {
            INTERNAL_MESSAGE.to_string()
        } else {
            message
        }
    }

    /// Flatten the cause chain into envelope entries.
    ///
    /// Nested `ApiError`s keep their code and message. Any other cause becomes
    /// a generic internal entry whose text is only included when `debug` is set.
    #[must_use]
    pub fn causes_in(
        &self,
        catalog: &MessageCatalog,
        locale: Option<&str>,
        debug: bool,
    ) -> Vec<ErrorEntry> {
        let mut entries = Vec::new();
        let mut next = self.source.as_deref().map(|e| e as &(dyn StdError + 'static));

        while let Some(err) = next {
            let entry = match err.downcast_ref::<Self>() {
                Some(api) => ErrorEntry::new(api.code(), api.localized_message(catalog, locale)),
                None if debug => {
                    ErrorEntry::new(code::INTERNAL.code(), format!("{INTERNAL_MESSAGE}:{err}"))
                }
                None => ErrorEntry::new(code::INTERNAL.code(), INTERNAL_MESSAGE),
            };
            entries.push(entry);
            next = err.source();
        }
        entries
    }

    #[must_use]
    pub fn envelope_in(
        &self,
        catalog: &MessageCatalog,
        locale: Option<&str>,
        debug: bool,
    ) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.localized_message(catalog, locale),
            errors: self.causes_in(catalog, locale, debug),
        }
    }

    #[must_use]
    pub fn envelope(&self, debug: bool) -> ErrorEnvelope {
        self.envelope_in(&messages::catalog(), None, debug)
    }

    /// Convert to an RPC status, logging server errors.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let message = self.message();
        if self.status.is_server_error() {
            error!(code = self.code(), error = %self.debug_chain(), "Internal error");
        }
        Status::new(self.grpc_code(), message)
    }

    /// Display of the whole cause chain for logs.
    #[must_use]
    pub fn debug_chain(&self) -> String {
        let mut out = self.message();
        let mut next = self.source.as_deref().map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = next {
            out.push_str(": ");
            out.push_str(&err.to_string());
            next = err.source();
        }
        out
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("status", &self.status)
            .field("code", &self.code())
            .field("message", &self.message)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl StdError for ApiError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ApiError> for Status {
    fn from(error: ApiError) -> Self {
        error.to_status()
    }
}

impl From<Status> for ApiError {
    fn from(status: Status) -> Self {
        Self::internal_code(code::RPC_FAILED, status)
    }
}

/// Response extension carrying the error for the gateway renderer.
#[derive(Debug, Clone)]
pub struct ErrorReport(pub Arc<ApiError>);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let mut response = match self.status {
            HttpStatus::Deleted => status.into_response(),
            HttpStatus::Created => {
                (status, Json(self.data.clone().unwrap_or(Value::Null))).into_response()
            }
            _ => (status, Json(self.envelope(false))).into_response(),
        };
        response.extensions_mut().insert(ErrorReport(Arc::new(self)));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::ErrorCodeFactory;

    #[test]
    fn wrap_is_idempotent_for_same_status_and_code() {
        let inner = ApiError::unauthorized(code::APP_INVALID).with_message("nope");
        let wrapped = ApiError::wrap(HttpStatus::Unauthorized, code::APP_INVALID, inner);
        assert!(wrapped.source.is_none());
        assert_eq!(wrapped.message_in(&MessageCatalog::new()), "nope");

        let rewrapped = ApiError::internal(ApiError::forbidden(code::NO_PERMISSION));
        assert!(rewrapped.source.is_some());
    }

    #[test]
    fn message_priority() {
        let catalog = MessageCatalog::new();
        assert_eq!(
            ApiError::validation("bad %s").with_params(["email"]).message_in(&catalog),
            "bad email"
        );
        assert_eq!(
            ApiError::forbidden(code::NO_PERMISSION).message_in(&catalog),
            "no permission"
        );
        let silent = ErrorCodeFactory::new(7, "").silent(3);
        assert_eq!(ApiError::bad_request(silent).message_in(&catalog), "internal error");
    }

    #[test]
    fn localized_message_falls_back_to_english() {
        let mut catalog = MessageCatalog::new();
        catalog.load(0, "en", br#"{"17": "permission denied"}"#).unwrap();
        catalog.load(0, "zh", r#"{"17": "没有权限"}"#.as_bytes()).unwrap();
        let mut err = ApiError::forbidden(code::NO_PERMISSION);
        err.set_locale("fr");
        assert_eq!(err.message_in(&catalog), "permission denied");

        let err = ApiError::forbidden(code::NO_PERMISSION);
        assert_eq!(err.localized_message(&catalog, Some("zh")), "没有权限");
        assert_eq!(err.localized_message(&catalog, Some("fr")), "permission denied");
    }

    #[test]
    fn project_binding_keeps_common_code() {
        let mut catalog = MessageCatalog::new();
        catalog.load(7, "en", br#"{"17": "orders are read only"}"#).unwrap();

        let mut err = ApiError::forbidden(code::NO_PERMISSION);
        err.set_project(7, "orders");
        assert_eq!(err.code(), 17);
        assert_eq!(err.message_in(&catalog), "orders: orders are read only");

        let mut err = ApiError::bad_request(ErrorCodeFactory::new(3, "").code(5));
        err.set_project(7, "");
        assert_eq!(err.code(), 705);
    }

    #[test]
    fn causes_hide_internal_text_unless_debug() {
        let catalog = MessageCatalog::new();
        let io = std::io::Error::other("disk full");
        let err = ApiError::internal(io);

        assert_eq!(
            err.causes_in(&catalog, None, false),
            vec![ErrorEntry::new(1, "internal error")]
        );
        assert_eq!(
            err.causes_in(&catalog, None, true),
            vec![ErrorEntry::new(1, "internal error:disk full")]
        );
    }

    #[test]
    fn causes_keep_nested_api_errors() {
        let catalog = MessageCatalog::new();
        let inner = ApiError::not_found(ErrorCodeFactory::new(7, "").literal(5, "user %s"), 42);
        let err = ApiError::internal(inner);
        let envelope = err.envelope_in(&catalog, None, false);

        assert_eq!(envelope.code, 1);
        assert_eq!(envelope.message, "internal error");
        assert_eq!(envelope.errors, vec![ErrorEntry::new(705, "user 42")]);
    }

    #[test]
    fn status_conversion_uses_code() {
        let status = Status::from(ApiError::bad_request(code::INVALID_ARGUMENTS));
        assert_eq!(status.code(), tonic::Code::from(2));

        let from_rpc = ApiError::from(Status::unavailable("down"));
        assert_eq!(from_rpc.code(), code::RPC_FAILED.code());
        assert_eq!(from_rpc.status(), HttpStatus::Internal);
    }

    #[test]
    fn custom_http_status_overrides_class() {
        let err = ApiError::conflict().with_http_status(StatusCode::PRECONDITION_FAILED);
        assert_eq!(err.http_status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(ApiError::deleted().http_status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn created_data_follows_marshaler() {
        #[derive(Clone, PartialEq, prost::Message, serde::Serialize)]
        struct Order {
            #[prost(uint32, tag = "1")]
            id: u32,
        }

        let err = ApiError::created_message(&Order { id: 9 });
        assert!(!err.status().is_failure());

        let (content_type, body) = err.encode_data(Marshaler::Json).unwrap();
        assert_eq!(content_type, "application/json");
        assert_eq!(body, br#"{"id":9}"#);

        let (content_type, body) = err.encode_data(Marshaler::Binary).unwrap();
        assert_eq!(content_type, "application/octet-stream");
        assert_eq!(<Order as prost::Message>::decode(body.as_slice()).unwrap(), Order { id: 9 });

        let (content_type, _) = ApiError::created(Value::Null).encode_data(Marshaler::Binary).unwrap();
        assert_eq!(content_type, "application/json");
    }

    #[test]
    fn into_response_attaches_report() {
        let response = ApiError::unauthorized(code::TOKEN_INVALID).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert_eq!(report.0.code(), 12);
    }
}
