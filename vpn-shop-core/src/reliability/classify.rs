//! Mapping of HTTP outcomes onto retry decisions.

use reqwest::StatusCode;

/// How the client core treats a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx: decode the body.
    Success,
    /// 401/403: invalidate the token and re-authenticate once.
    Auth,
    /// 404: valid absence, never retried.
    NotFound,
    /// 5xx: back off and retry, token untouched.
    Retryable,
    /// Any other 4xx: fatal, returned immediately.
    Client,
}

impl StatusClass {
    /// Classifies a response status.
    ///
    /// # Examples
    ///
    /// ```
    /// use reqwest::StatusCode;
    /// use vpn_shop_core::reliability::StatusClass;
    ///
    /// assert_eq!(StatusClass::of(StatusCode::OK), StatusClass::Success);
    /// assert_eq!(StatusClass::of(StatusCode::FORBIDDEN), StatusClass::Auth);
    /// assert_eq!(StatusClass::of(StatusCode::BAD_GATEWAY), StatusClass::Retryable);
    /// assert_eq!(StatusClass::of(StatusCode::CONFLICT), StatusClass::Client);
    /// ```
    #[must_use]
    pub fn of(status: StatusCode) -> Self {
        match status {
            s if s.is_success() => Self::Success,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Auth,
            StatusCode::NOT_FOUND => Self::NotFound,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::Client,
        }
    }

    /// Short label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Retryable => "retryable",
            Self::Client => "client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        assert_eq!(StatusClass::of(StatusCode::CREATED), StatusClass::Success);
        assert_eq!(StatusClass::of(StatusCode::NO_CONTENT), StatusClass::Success);
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for code in [500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(StatusClass::of(status), StatusClass::Retryable, "{code}");
        }
    }

    #[test]
    fn test_not_found_is_not_client_error() {
        assert_eq!(StatusClass::of(StatusCode::NOT_FOUND), StatusClass::NotFound);
        assert_eq!(StatusClass::of(StatusCode::BAD_REQUEST), StatusClass::Client);
        assert_eq!(StatusClass::of(StatusCode::TOO_MANY_REQUESTS), StatusClass::Client);
    }

    #[test]
    fn test_redirect_is_fatal() {
        assert_eq!(StatusClass::of(StatusCode::MOVED_PERMANENTLY), StatusClass::Client);
    }
}
