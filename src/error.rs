//! Crate-wide error taxonomy.
//!
//! Mirrors the semantic, not type-name-driven, error kinds from the spec:
//! invalid config never fails a URL build, refresh failures propagate with
//! context, reauth is a distinct flag, usage extraction failures are
//! swallowed by callers rather than surfaced here.

use thiserror::Error;

/// Errors returned while building or preparing a request for an upstream
/// provider, or while translating its response back.
#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("token refresh failed for account {account}: {message}")]
	TokenRefreshFailed { account: String, message: String },

	#[error("account {account} requires re-authentication: {message}")]
	ReauthRequired { account: String, message: String },

	#[error("account is missing required credentials for provider {0}")]
	MissingCredentials(&'static str),

	#[error("unsupported conversion: {0}")]
	UnsupportedConversion(String),

	#[error("failed to parse upstream response: {0}")]
	ResponseParsing(#[from] serde_json::Error),

	#[error("failed to build request body: {0}")]
	RequestMarshal(serde_json::Error),

	#[error("invalid url: {0}")]
	InvalidUrl(#[from] url::ParseError),

	#[error("http error: {0}")]
	Http(#[from] http::Error),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error(transparent)]
	Bedrock(#[from] BedrockError),
}

/// OAuth / credential-resolution errors.
#[derive(Debug, Error)]
pub enum AuthError {
	#[error("oauth token endpoint returned {status}: {message}")]
	OAuth { status: u16, message: String },

	#[error("oauth response was missing required field: {0}")]
	MissingField(&'static str),

	#[error("http transport error: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("credential chain exhausted: {0}")]
	NoCredentials(String),
}

/// AWS Bedrock specific errors (credential resolution, cache population,
/// Converse transform, upstream error translation).
#[derive(Debug, Error)]
pub enum BedrockError {
	#[error("malformed custom_endpoint for bedrock account: {0}")]
	MalformedEndpoint(String),

	#[error("no non-empty message content after transform")]
	EmptyMessages,

	#[error("cache fetch failed: {0}")]
	CacheFetchFailed(String),

	#[error("credential resolution failed: {0}")]
	Credentials(String),

	#[error("sdk call failed: {0}")]
	Sdk(String),
}

/// Outcome of translating an upstream error body into a status + body for
/// the client. Never itself an error: translation always succeeds,
/// producing a best-effort status when the shape is unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatedStatus {
	BadRequest,
	Forbidden,
	NotFound,
	TooManyRequests,
	ServiceUnavailable,
	InternalServerError,
}

impl TranslatedStatus {
	pub fn as_u16(self) -> u16 {
		match self {
			TranslatedStatus::BadRequest => 400,
			TranslatedStatus::Forbidden => 403,
			TranslatedStatus::NotFound => 404,
			TranslatedStatus::TooManyRequests => 429,
			TranslatedStatus::ServiceUnavailable => 503,
			TranslatedStatus::InternalServerError => 500,
		}
	}
}
