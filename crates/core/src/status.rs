//! HTTP status classes carried by [`ApiError`](crate::ApiError).

use std::fmt;

use http::StatusCode;

/// Status class of an [`ApiError`](crate::ApiError).
///
/// Two classes are not failures: `Created` makes the renderer emit the error's
/// data payload instead of an envelope, and `Deleted` suppresses the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    Created,
    Deleted,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Locked,
    Internal,
}

impl HttpStatus {
    /// HTTP status code for this class.
    #[must_use]
    pub const fn code(self) -> StatusCode {
        match self {
            Self::Created => StatusCode::CREATED,
            Self::Deleted => StatusCode::NO_CONTENT,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Locked => StatusCode::LOCKED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the class reports a failure. `Created` and `Deleted` do not.
    #[inline]
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Created | Self::Deleted)
    }

    /// Whether the class reports a server-side failure.
    #[inline]
    #[must_use]
    pub const fn is_server_error(self) -> bool {
        matches!(self, Self::Internal)
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code().as_u16())
    }
}

impl From<HttpStatus> for StatusCode {
    fn from(status: HttpStatus) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_http_codes() {
        assert_eq!(HttpStatus::Created.code(), StatusCode::CREATED);
        assert_eq!(HttpStatus::Deleted.code(), StatusCode::NO_CONTENT);
        assert_eq!(HttpStatus::Locked.code(), StatusCode::LOCKED);
        assert_eq!(HttpStatus::Internal.to_string(), "500");
    }
}
