//! Configuration with validation at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use gateway_core::ErrorCodeFactory;
use gateway_telemetry::{SERVICE_NAME, TelemetryConfig};
use http::HeaderName;
use secrecy::{ExposeSecret, SecretString};

use crate::middleware::{AppValidation, HeaderNames};

/// Minimum required JWT secret length for security (256 bits).
const MIN_JWT_SECRET_LEN: usize = 32;

/// API gateway configuration.
///
/// All values can be set via environment variables or CLI arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "api-gateway", about = "REST to gRPC API gateway")]
pub struct Config {
    /// Listen address
    #[arg(long, env = "GATEWAY_ADDRESS", default_value = "0.0.0.0:8080")]
    pub address: String,

    /// Mount point of the RPC routes ("/" for the root)
    #[arg(long, env = "PATH_PREFIX", default_value = "/")]
    pub path_prefix: String,

    /// Error-code project id
    #[arg(long, env = "PROJECT_ID", default_value = "0")]
    pub project_id: u32,

    /// Error-code project display name, prefixed to project messages
    #[arg(long, env = "PROJECT_NAME", default_value = "")]
    pub project_name: String,

    /// App validation mode
    #[arg(long, env = "APP_VALIDATION", value_enum, default_value_t = AppValidation::Internal)]
    pub app_validation: AppValidation,

    #[arg(long, env = "REQUEST_ID_HEADER", default_value = "X-Request-Id")]
    pub request_id_header: String,

    #[arg(long, env = "REQUEST_TYPE_HEADER", default_value = "X-Request-Type")]
    pub request_type_header: String,

    #[arg(long, env = "REQUEST_FROM_HEADER", default_value = "X-Request-From")]
    pub request_from_header: String,

    /// App id header sent by clients
    #[arg(long, env = "APP_ID_HEADER", default_value = "X-App-Id")]
    pub app_id_header: String,

    /// App id header after resolution
    #[arg(long, env = "AUTHED_APP_ID_HEADER", default_value = "X-App-Id")]
    pub authed_app_id_header: String,

    #[arg(long, env = "USER_ID_HEADER", default_value = "X-User-Id")]
    pub user_id_header: String,

    #[arg(long, env = "USER_IV_HEADER", default_value = "X-User-Iv")]
    pub user_iv_header: String,

    #[arg(long, env = "SIGNATURE_HEADER", default_value = "X-Signature")]
    pub signature_header: String,

    #[arg(long, env = "TOKEN_HEADER", default_value = "Authorization")]
    pub token_header: String,

    /// JWT secret for gateway-issued user tokens (min 32 chars)
    #[arg(long, env = "JWT_SECRET_KEY")]
    pub jwt_secret_key: Option<SecretString>,

    /// Issuer of gateway-issued user tokens
    #[arg(long, env = "JWT_ISSUER", default_value = "api-gateway")]
    pub jwt_issuer: String,

    /// Reject requests without a token
    #[arg(long, env = "REQUIRE_TOKEN", default_value = "false")]
    pub require_token: bool,

    /// Include internal error text in error envelopes
    #[arg(long, env = "DEBUG_ERRORS", default_value = "false")]
    pub debug_errors: bool,

    /// Catalog default language
    #[arg(long, env = "DEFAULT_LANGUAGE", default_value = "en")]
    pub default_language: String,

    /// Directory of `<lang>.json` message files
    #[arg(long, env = "MESSAGES_DIR")]
    pub messages_dir: Option<PathBuf>,

    /// Provider call timeout in milliseconds (0 disables)
    #[arg(long, env = "PROVIDER_TIMEOUT_MS", default_value = "5000")]
    pub provider_timeout_ms: u64,

    /// Max request/response body buffered by the crypt stage (default: 4MB)
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "4194304")]
    pub max_body_bytes: usize,

    /// Forward every inbound header as RPC metadata
    #[arg(long, env = "METADATA_ALL_HEADERS", default_value = "false")]
    pub metadata_all_headers: bool,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    /// Use JSON log format
    #[arg(long, env = "JSON_LOGS", default_value = "true")]
    pub json_logs: bool,

    /// OpenTelemetry OTLP endpoint
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Sentry DSN for error tracking
    #[arg(long, env = "SENTRY_DSN")]
    pub sentry_dsn: Option<String>,

    /// Environment name (e.g., "production", "development")
    #[arg(long, env = "ENVIRONMENT")]
    pub environment: Option<String>,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Path prefix must not be empty")]
    EmptyPathPrefix,
    #[error("Invalid {field} header name: {value:?}")]
    InvalidHeaderName { field: &'static str, value: String },
    #[error("JWT secret must be at least {MIN_JWT_SECRET_LEN} characters")]
    JwtSecretTooShort,
    #[error("Max body bytes must be > 0")]
    ZeroBodyLimit,
    #[error("Invalid listen address {address:?}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

impl Config {
    /// Parse and validate configuration.
    pub fn init() -> anyhow::Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyPathPrefix);
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        if self
            .jwt_secret_key
            .as_ref()
            .is_some_and(|secret| secret.expose_secret().len() < MIN_JWT_SECRET_LEN)
        {
            return Err(ConfigError::JwtSecretTooShort);
        }
        self.socket_addr()?;
        self.header_names()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|source| ConfigError::InvalidAddress {
                address: self.address.clone(),
                source,
            })
    }

    /// Header names with configured overrides.
    pub fn header_names(&self) -> Result<HeaderNames, ConfigError> {
        Ok(HeaderNames {
            request_id: header("request id", &self.request_id_header)?,
            request_type: header("request type", &self.request_type_header)?,
            request_from: header("request from", &self.request_from_header)?,
            app_id: header("app id", &self.app_id_header)?,
            authed_app_id: header("authed app id", &self.authed_app_id_header)?,
            user_id: header("user id", &self.user_id_header)?,
            user_iv: header("user iv", &self.user_iv_header)?,
            signature: header("signature", &self.signature_header)?,
            token: header("token", &self.token_header)?,
        })
    }

    /// Provider call bound, `None` when disabled.
    #[inline]
    pub const fn provider_timeout(&self) -> Option<Duration> {
        if self.provider_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.provider_timeout_ms))
        }
    }

    /// Factory for this deployment's project error codes.
    pub fn error_codes(&self) -> ErrorCodeFactory {
        ErrorCodeFactory::new(self.project_id, self.project_name.clone())
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: SERVICE_NAME.to_string(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
            otlp_endpoint: self.otlp_endpoint.clone(),
            sentry_dsn: self.sentry_dsn.clone(),
            environment: self.environment.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

fn header(field: &'static str, value: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::try_from(value.trim()).map_err(|_| ConfigError::InvalidHeaderName {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            address: "0.0.0.0:8080".to_string(),
            path_prefix: "/".to_string(),
            project_id: 0,
            project_name: String::new(),
            app_validation: AppValidation::Internal,
            request_id_header: "X-Request-Id".to_string(),
            request_type_header: "X-Request-Type".to_string(),
            request_from_header: "X-Request-From".to_string(),
            app_id_header: "X-App-Id".to_string(),
            authed_app_id_header: "X-App-Id".to_string(),
            user_id_header: "X-User-Id".to_string(),
            user_iv_header: "X-User-Iv".to_string(),
            signature_header: "X-Signature".to_string(),
            token_header: "Authorization".to_string(),
            jwt_secret_key: None,
            jwt_issuer: "api-gateway".to_string(),
            require_token: false,
            debug_errors: false,
            default_language: "en".to_string(),
            messages_dir: None,
            provider_timeout_ms: 5000,
            max_body_bytes: 4 * 1024 * 1024,
            metadata_all_headers: false,
            log_level: "INFO".to_string(),
            json_logs: false,
            otlp_endpoint: None,
            sentry_dsn: None,
            environment: None,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn header_names_are_lowercased() {
        let names = test_config().header_names().unwrap();
        assert_eq!(names.request_id.as_str(), "x-request-id");
        assert_eq!(names.token, http::header::AUTHORIZATION);
    }

    #[test]
    fn invalid_header_name_fails() {
        let mut config = test_config();
        config.signature_header = "X Signature".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeaderName { field: "signature", .. })
        ));
    }

    #[test]
    fn empty_prefix_and_zero_body_fail() {
        let mut config = test_config();
        config.path_prefix = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPathPrefix)));

        let mut config = test_config();
        config.max_body_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBodyLimit)));
    }

    #[test]
    fn jwt_secret_too_short_fails() {
        let mut config = test_config();
        config.jwt_secret_key = Some(SecretString::from("short"));
        assert!(matches!(config.validate(), Err(ConfigError::JwtSecretTooShort)));

        config.jwt_secret_key = Some(SecretString::from("this_is_a_very_long_secret_key_32"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn project_codes_compose_with_project_id() {
        let mut config = test_config();
        config.project_id = 7;
        config.project_name = "orders".to_string();
        assert_eq!(config.error_codes().code(5).code(), 705);
    }

    #[test]
    fn bad_address_fails() {
        let mut config = test_config();
        config.address = "localhost".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress { .. })));
    }

    #[test]
    fn zero_timeout_disables_bound() {
        let mut config = test_config();
        assert_eq!(config.provider_timeout(), Some(Duration::from_secs(5)));
        config.provider_timeout_ms = 0;
        assert_eq!(config.provider_timeout(), None);
    }
}
