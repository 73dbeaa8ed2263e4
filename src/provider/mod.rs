//! The provider capability set (C1/C6) and the registry that looks
//! adapters up by name (C9).
//!
//! Grounded on `llm/mod.rs`'s `Provider` trait plus the enum-dispatch
//! `process_request`/`process_response` orchestration in the teacher,
//! generalized from a closed enum over a handful of backends to an open
//! `dyn Provider` registry, since this crate's account rows name their
//! provider by a free-form string rather than a compiled-in variant set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;

use crate::account::{Account, TokenRefreshResult};
use crate::error::ProviderError;
use crate::ratelimit::{self, RateLimitInfo};
use crate::stream_util::BodyStream;

pub mod anthropic;
pub mod bedrock;
pub mod compatible;
pub mod oauth_anthropic;
pub mod openai_compatible;
pub mod vertex;

/// A request on its way upstream. `body` starts as the client's raw bytes;
/// `transform_request_body` may rewrite it in place.
pub struct ProviderRequest {
	pub path: String,
	pub query: Option<String>,
	pub headers: HeaderMap,
	pub body: Bytes,
	/// Adapter-private scratch space for values resolved in one pipeline
	/// step and needed in a later one (e.g. Bedrock's resolved model id and
	/// original client model name, set in `transform_request_body` and read
	/// back in `build_url`/`prepare_headers`/`process_response`). Never
	/// read by the host or sent upstream; unused by adapters that don't
	/// need cross-step state.
	pub provider_state: HashMap<String, String>,
}

/// An upstream response on its way back to the client.
pub struct ProviderResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: ResponseBody,
	/// Populated by adapters whose streaming `process_response` tees the
	/// body (spec.md §4.6): usage becomes known only once the accounting
	/// side of the tee drains, which happens concurrently with the client
	/// reading `body`. `None` for non-streaming responses, whose usage the
	/// host reads synchronously via `extract_usage_info` instead.
	pub usage_handle: Option<Arc<parking_lot::Mutex<Option<UsageInfo>>>>,
}

impl ProviderResponse {
	pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
		Self { status, headers, body, usage_handle: None }
	}
}

/// Either the whole body was already read (JSON / error bodies), or it's
/// still a live stream (SSE) that must be transformed incrementally.
pub enum ResponseBody {
	Buffered(Bytes),
	Streaming(BodyStream),
}

/// Token accounting extracted from a response, JSON or SSE. `prompt_tokens`/
/// `completion_tokens`/`total_tokens` are the OpenAI-shaped aggregate view
/// spec.md §8 scenario 1 requires alongside the raw Anthropic counters:
/// `prompt_tokens = input_tokens + cache_read_input_tokens +
/// cache_creation_input_tokens`, `completion_tokens = output_tokens`,
/// `total_tokens` is their sum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageInfo {
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cache_creation_input_tokens: u64,
	pub cache_read_input_tokens: u64,
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
	pub model: Option<String>,
	pub cost: Option<f64>,
}

impl UsageInfo {
	/// Builds the full struct from the four raw counters, deriving the
	/// aggregate `prompt_tokens`/`completion_tokens`/`total_tokens` view so
	/// every call site computes them the same way.
	pub fn from_counts(
		input_tokens: u64,
		output_tokens: u64,
		cache_creation_input_tokens: u64,
		cache_read_input_tokens: u64,
		model: Option<String>,
		cost: Option<f64>,
	) -> Self {
		let prompt_tokens = input_tokens + cache_read_input_tokens + cache_creation_input_tokens;
		let completion_tokens = output_tokens;
		Self {
			input_tokens,
			output_tokens,
			cache_creation_input_tokens,
			cache_read_input_tokens,
			prompt_tokens,
			completion_tokens,
			total_tokens: prompt_tokens + completion_tokens,
			model,
			cost,
		}
	}
}

/// The Anthropic OAuth dance (C8): authorize-URL construction and code
/// exchange. A provider that `supports_oauth()` exposes one of these.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
	/// `mode` selects between the `console` and `max` authorize bases
	/// (spec.md §4.9); unused by providers without that distinction.
	fn authorize_url(&self, client_id: &str, mode: &str, challenge: &str, state: &str) -> String;
	fn scopes(&self) -> &'static str;
	fn redirect_uri(&self) -> &'static str;
	fn token_url(&self) -> &'static str;

	/// Exchange a user-submitted code (possibly `code#state`) for tokens.
	async fn exchange_code(
		&self,
		client_id: &str,
		submitted_code: &str,
		verifier: &str,
	) -> Result<TokenRefreshResult, ProviderError>;
}

/// The capability set every adapter implements (spec.md §4.1). The host
/// drives these in the fixed order: `can_handle -> refresh_token (if
/// expiring) -> transform_request_body -> build_url -> prepare_headers ->
/// <transport> -> process_response -> parse_rate_limit ->
/// extract_usage_info`.
#[async_trait]
pub trait Provider: Send + Sync {
	/// Stable identifier used in the registry and to match `account.provider`.
	fn name(&self) -> &'static str;

	/// True iff this adapter should serve `path`. Base default: always.
	fn can_handle(&self, _path: &str) -> bool {
		true
	}

	async fn refresh_token(
		&self,
		account: &Account,
		client_id: &str,
	) -> Result<TokenRefreshResult, ProviderError>;

	/// Compose the upstream URL. Implementations must validate/sanitize
	/// `account.custom_endpoint` themselves; an invalid value should fall
	/// back to the provider default (and the caller logs a warning).
	/// Takes the whole request (not just path/query) because Bedrock
	/// embeds a model id resolved during `transform_request_body` into the
	/// URL; it reads that resolution back via a reserved header rather
	/// than recomputing it.
	fn build_url(&self, request: &ProviderRequest, account: Option<&Account>) -> Result<String, ProviderError>;

	/// Inject credentials and strip dangerous/irrelevant client headers.
	/// Async, and given the resolved URL plus the whole request, because
	/// Bedrock signs the entire request (method + url + headers + body)
	/// with SigV4 here, which requires awaiting the AWS credential chain.
	/// Base default: strip hop-by-hop/compression headers, set
	/// `Authorization: Bearer <access_token>` when one is supplied.
	async fn prepare_headers(
		&self,
		request: &mut ProviderRequest,
		_resolved_url: &str,
		access_token: Option<&str>,
		_api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		crate::headers::sanitize_client_headers(&mut request.headers, true);
		if let Some(token) = access_token {
			crate::headers::set_bearer(&mut request.headers, token)?;
		}
		Ok(())
	}

	/// Base default: unified-headers-then-retry-after, per spec.md §4.4.
	fn parse_rate_limit(&self, headers: &HeaderMap, status: StatusCode, now_ms: i64) -> RateLimitInfo {
		ratelimit::parse_unified(headers, status, now_ms)
	}

	/// z.ai-only escape hatch (spec.md §4.4 step 4): some providers signal
	/// rate limits in the error body rather than headers. Called by the
	/// host only when the header-based parse above found nothing and the
	/// status was an error. Base default: no body-based signal.
	fn parse_rate_limit_body(&self, _body: &[u8]) -> Option<RateLimitInfo> {
		None
	}

	/// The client-facing translation step. Takes the (already-transformed)
	/// request alongside the response because Bedrock needs to recover the
	/// client's original model name — stashed during
	/// `transform_request_body` — to put in the translated response body,
	/// since AWS's Converse response carries no model field of its own.
	/// Base default: passthrough.
	async fn process_response(
		&self,
		_request: &ProviderRequest,
		response: ProviderResponse,
		_account: Option<&Account>,
	) -> Result<ProviderResponse, ProviderError> {
		Ok(response)
	}

	/// Request-body translation step, including model mapping. Async
	/// because Bedrock's transform resolves AWS credentials and signs the
	/// request here. Base default: no-op.
	async fn transform_request_body(
		&self,
		_request: &mut ProviderRequest,
		_account: Option<&Account>,
	) -> Result<(), ProviderError> {
		Ok(())
	}

	/// For Anthropic: maps `usage.rate_limit_tokens` to a {1,5,20} tier.
	/// Base default: unknown.
	fn extract_tier_info(&self, _body: &[u8]) -> Option<i32> {
		None
	}

	/// `headers` are the upstream response headers (spec.md §4.3: Anthropic's
	/// `anthropic-billing-cost` cost figure lives there, not in the body).
	/// Base default: no usage signal.
	fn extract_usage_info(&self, _body: &[u8], _is_streaming: bool, _headers: &HeaderMap) -> Option<UsageInfo> {
		None
	}

	/// Base default: `content-type` contains `text/event-stream`.
	fn is_streaming_response(&self, headers: &HeaderMap) -> bool {
		headers
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|ct| ct.contains("text/event-stream"))
	}

	fn supports_oauth(&self) -> bool {
		false
	}

	fn oauth_provider(&self) -> Option<Arc<dyn OAuthProvider>> {
		None
	}
}

/// Thread-safe name-keyed map of adapters (spec.md §4.10). Registering a
/// provider also registers its OAuth provider, when it has one, under the
/// same name.
#[derive(Default)]
pub struct Registry {
	providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
	oauth_providers: RwLock<HashMap<String, Arc<dyn OAuthProvider>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, provider: Arc<dyn Provider>) {
		let name = provider.name().to_string();
		if provider.supports_oauth() {
			if let Some(oauth) = provider.oauth_provider() {
				self.oauth_providers.write().insert(name.clone(), oauth);
			}
		}
		self.providers.write().insert(name, provider);
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
		self.providers.read().get(name).cloned()
	}

	pub fn get_oauth(&self, name: &str) -> Option<Arc<dyn OAuthProvider>> {
		self.oauth_providers.read().get(name).cloned()
	}

	pub fn list(&self) -> Vec<String> {
		self.providers.read().keys().cloned().collect()
	}

	pub fn unregister(&self, name: &str) {
		self.providers.write().remove(name);
		self.oauth_providers.write().remove(name);
	}

	pub fn clear(&self) {
		self.providers.write().clear();
		self.oauth_providers.write().clear();
	}

	/// The adapter (if any) registered under `account.provider`'s name
	/// whose `can_handle(path)` accepts this request.
	pub fn route(&self, provider_name: &str, path: &str) -> Option<Arc<dyn Provider>> {
		let provider = self.get(provider_name)?;
		provider.can_handle(path).then_some(provider)
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;

	struct Dummy(&'static str);

	#[async_trait]
	impl Provider for Dummy {
		fn name(&self) -> &'static str {
			self.0
		}

		async fn refresh_token(
			&self,
			_account: &Account,
			_client_id: &str,
		) -> Result<TokenRefreshResult, ProviderError> {
			Err(ProviderError::MissingCredentials("dummy"))
		}

		fn build_url(&self, request: &ProviderRequest, _account: Option<&Account>) -> Result<String, ProviderError> {
			Ok(format!("https://example.test{}", request.path))
		}

		fn can_handle(&self, path: &str) -> bool {
			path.starts_with("/v1/messages")
		}
	}

	#[test]
	fn register_get_list_unregister_roundtrip() {
		let registry = Registry::new();
		registry.register(Arc::new(Dummy("dummy")));
		assert!(registry.get("dummy").is_some());
		assert_eq!(registry.list(), vec!["dummy".to_string()]);
		registry.unregister("dummy");
		assert!(registry.get("dummy").is_none());
	}

	#[test]
	fn route_respects_can_handle() {
		let registry = Registry::new();
		registry.register(Arc::new(Dummy("dummy")));
		assert!(registry.route("dummy", "/v1/messages").is_some());
		assert!(registry.route("dummy", "/v1/other").is_none());
	}

	#[test]
	fn base_is_streaming_response_checks_content_type() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
		let dummy = Dummy("dummy");
		assert!(dummy.is_streaming_response(&headers));
		headers.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
		assert!(!dummy.is_streaming_response(&headers));
	}
}
