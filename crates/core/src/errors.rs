//! Normalized error taxonomy
//!
//! Every failure crossing the daemon boundary carries a `NormalizedError`
//! beside the endpoint-specific code. Classification is a pure function of
//! the error text and captured engine stderr: case-insensitive substring
//! matching against a fixed phrase list per class.

use serde::{Deserialize, Serialize};

/// Default `Retry-After` hint (seconds) attached to rate-limited replies
/// when the upstream did not provide one.
pub const DEFAULT_RETRY_AFTER_SECS: u32 = 2;

/// Closed set of client-facing failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedCode {
    InvalidCredentials,
    AccessDenied,
    NotFound,
    RateLimited,
    NetworkError,
    InvalidConfig,
    SignatureMismatch,
    RequestTimeSkewed,
    Conflict,
    UpstreamTimeout,
    EndpointUnreachable,
    Canceled,
    Unknown,
}

impl NormalizedCode {
    pub fn as_str(self) -> &'static str {
        match self {
            NormalizedCode::InvalidCredentials => "invalid_credentials",
            NormalizedCode::AccessDenied => "access_denied",
            NormalizedCode::NotFound => "not_found",
            NormalizedCode::RateLimited => "rate_limited",
            NormalizedCode::NetworkError => "network_error",
            NormalizedCode::InvalidConfig => "invalid_config",
            NormalizedCode::SignatureMismatch => "signature_mismatch",
            NormalizedCode::RequestTimeSkewed => "request_time_skewed",
            NormalizedCode::Conflict => "conflict",
            NormalizedCode::UpstreamTimeout => "upstream_timeout",
            NormalizedCode::EndpointUnreachable => "endpoint_unreachable",
            NormalizedCode::Canceled => "canceled",
            NormalizedCode::Unknown => "unknown",
        }
    }

    /// Retryability is a property of the class, not the instance.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            NormalizedCode::RateLimited
                | NormalizedCode::NetworkError
                | NormalizedCode::UpstreamTimeout
                | NormalizedCode::EndpointUnreachable
        )
    }
}

impl std::fmt::Display for NormalizedCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{ code, retryable }` pair attached beside endpoint codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub code: NormalizedCode,
    pub retryable: bool,
}

impl From<NormalizedCode> for NormalizedError {
    fn from(code: NormalizedCode) -> Self {
        Self {
            code,
            retryable: code.retryable(),
        }
    }
}

/// Phrase tables, checked in order. The most specific classes come first so
/// that e.g. "SignatureDoesNotMatch" never falls through to access_denied.
const PHRASES: &[(NormalizedCode, &[&str])] = &[
    (
        NormalizedCode::SignatureMismatch,
        &["signaturedoesnotmatch", "signature does not match", "signature mismatch"],
    ),
    (
        NormalizedCode::RequestTimeSkewed,
        &["requesttimetooskewed", "request time too skewed", "clock skew"],
    ),
    (
        NormalizedCode::InvalidCredentials,
        &[
            "invalidaccesskeyid",
            "invalid access key",
            "invalid credentials",
            "signature we calculated",
            "authorizationheadermalformed",
            "invalid_grant",
            "authenticationfailed",
            "invalid client secret",
        ],
    ),
    (
        NormalizedCode::AccessDenied,
        &[
            "accessdenied",
            "access denied",
            "permission denied",
            "insufficient permission",
            "403 forbidden",
            "unauthorized",
        ],
    ),
    (
        NormalizedCode::RateLimited,
        &[
            "slowdown",
            "slow down",
            "too many requests",
            "rate limit",
            "ratelimit",
            "throttl",
            "429",
        ],
    ),
    (
        NormalizedCode::UpstreamTimeout,
        &[
            "requesttimeout",
            "request timeout",
            "context deadline exceeded",
            "i/o timeout",
            "timed out",
            "timeout exceeded",
        ],
    ),
    (
        NormalizedCode::EndpointUnreachable,
        &[
            "no such host",
            "connection refused",
            "could not resolve",
            "name or service not known",
            "host unreachable",
            "network is unreachable",
        ],
    ),
    (
        NormalizedCode::NetworkError,
        &[
            "connection reset",
            "broken pipe",
            "eof",
            "tls handshake",
            "certificate",
            "network error",
            "transport",
        ],
    ),
    (
        NormalizedCode::NotFound,
        &[
            "nosuchbucket",
            "nosuchkey",
            "no such bucket",
            "no such key",
            "not found",
            "404",
            "directory not found",
            "object not found",
            "blobnotfound",
            "containernotfound",
        ],
    ),
    (
        NormalizedCode::Conflict,
        &[
            "bucketalreadyexists",
            "bucketalreadyownedbyyou",
            "conflict",
            "already exists",
            "precondition failed",
        ],
    ),
    (
        NormalizedCode::InvalidConfig,
        &[
            "didn't find section in config file",
            "config file not found",
            "invalid endpoint",
            "unsupported protocol scheme",
            "invalid region",
            "malformed",
        ],
    ),
    (
        NormalizedCode::Canceled,
        &["context canceled", "operation canceled", "canceled", "cancelled"],
    ),
];

/// Classify a failure from its error text and any captured engine stderr.
pub fn classify(error_text: &str, stderr: &str) -> NormalizedCode {
    let haystack = format!("{}\n{}", error_text, stderr).to_lowercase();
    for (code, phrases) in PHRASES {
        if phrases.iter().any(|p| haystack.contains(p)) {
            return *code;
        }
    }
    NormalizedCode::Unknown
}

/// Classify and wrap with the derived retryable flag
pub fn normalize(error_text: &str, stderr: &str) -> NormalizedError {
    classify(error_text, stderr).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrases_map_to_expected_classes() {
        let cases = [
            ("SignatureDoesNotMatch: check your key", NormalizedCode::SignatureMismatch),
            ("RequestTimeTooSkewed", NormalizedCode::RequestTimeSkewed),
            ("InvalidAccessKeyId: the key does not exist", NormalizedCode::InvalidCredentials),
            ("Access Denied", NormalizedCode::AccessDenied),
            ("503 SlowDown: please reduce request rate", NormalizedCode::RateLimited),
            ("dial tcp: lookup bucket.example: no such host", NormalizedCode::EndpointUnreachable),
            ("connection refused", NormalizedCode::EndpointUnreachable),
            ("read: connection reset by peer", NormalizedCode::NetworkError),
            ("NoSuchBucket: the bucket does not exist", NormalizedCode::NotFound),
            ("i/o timeout", NormalizedCode::UpstreamTimeout),
            ("BucketAlreadyOwnedByYou", NormalizedCode::Conflict),
            ("didn't find section in config file", NormalizedCode::InvalidConfig),
            ("context canceled", NormalizedCode::Canceled),
            ("segfault in flux capacitor", NormalizedCode::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(classify(text, ""), expected, "text: {}", text);
        }
    }

    #[test]
    fn stderr_participates_in_classification() {
        assert_eq!(
            classify("exit status 1", "ERROR: AccessDenied: no permission"),
            NormalizedCode::AccessDenied
        );
    }

    #[test]
    fn specific_classes_win_over_general_ones() {
        // Mentions both a signature phrase and "forbidden"; signature is more specific.
        assert_eq!(
            classify("403 Forbidden: SignatureDoesNotMatch", ""),
            NormalizedCode::SignatureMismatch
        );
    }

    #[test]
    fn retryable_flag_follows_class() {
        assert!(NormalizedCode::RateLimited.retryable());
        assert!(NormalizedCode::NetworkError.retryable());
        assert!(NormalizedCode::UpstreamTimeout.retryable());
        assert!(NormalizedCode::EndpointUnreachable.retryable());
        assert!(!NormalizedCode::AccessDenied.retryable());
        assert!(!NormalizedCode::Canceled.retryable());
        assert!(!NormalizedCode::Unknown.retryable());
    }

    #[test]
    fn normalized_error_serializes_snake_case() {
        let err = NormalizedError::from(NormalizedCode::EndpointUnreachable);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "endpoint_unreachable");
        assert_eq!(json["retryable"], true);
    }
}
