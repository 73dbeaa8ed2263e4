//! The Anthropic-compatible family (C7): z.ai, Minimax, NanoGPT, and the
//! generic `anthropic-compatible` account type, spec.md §4.5. These share
//! everything except endpoint resolution, how the credential is carried,
//! and (Minimax) a forced model override, so one configurable adapter
//! backs all four instead of four near-duplicate structs.
//!
//! Grounded on `llm/anthropic.rs` for the shared Anthropic-shaped
//! request/response handling, generalized to parametrize the endpoint and
//! auth placement the way the spec's account-level `authHeader`/`authType`
//! fields require.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use super::{Provider, ProviderResponse, UsageInfo};
use crate::account::{Account, TokenRefreshResult};
use crate::error::ProviderError;
use crate::{headers as header_util, ratelimit, usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
	/// `Authorization: Bearer <key>`.
	Bearer,
	/// The key set verbatim, no `Bearer ` prefix.
	Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeader {
	XApiKey,
	Authorization,
}

impl AuthHeader {
	fn name(self) -> &'static str {
		match self {
			AuthHeader::XApiKey => "x-api-key",
			AuthHeader::Authorization => "authorization",
		}
	}
}

pub struct CompatibleConfig {
	pub name: &'static str,
	/// `Some(url)` for providers with a fixed endpoint (z.ai, Minimax);
	/// `None` for providers whose endpoint comes from `account.custom_endpoint`
	/// (NanoGPT, generic anthropic-compatible).
	pub fixed_endpoint: Option<&'static str>,
	/// Fallback used by `build_url` when `fixed_endpoint` is `None` and no
	/// valid `account.custom_endpoint` was configured, so URL-building never
	/// fails (spec.md §8 invariant 2). Requests that actually reach this
	/// fallback have no working credential either, and are rejected earlier,
	/// in `refresh_token`.
	pub default_endpoint: &'static str,
	pub auth_header: AuthHeader,
	pub auth_type: AuthType,
	/// Minimax forces every request onto one model regardless of input.
	pub forced_model: Option<&'static str>,
	pub stream_usage_cap_bytes: usize,
}

pub struct CompatibleProvider {
	config: CompatibleConfig,
}

impl CompatibleProvider {
	pub fn new(config: CompatibleConfig) -> Self {
		Self { config }
	}

	pub fn zai(stream_usage_cap_bytes: usize) -> Self {
		Self::new(CompatibleConfig {
			name: "zai",
			fixed_endpoint: Some("https://api.z.ai/api/anthropic"),
			default_endpoint: "https://api.z.ai/api/anthropic",
			auth_header: AuthHeader::XApiKey,
			auth_type: AuthType::Direct,
			forced_model: None,
			stream_usage_cap_bytes,
		})
	}

	pub fn minimax(stream_usage_cap_bytes: usize) -> Self {
		Self::new(CompatibleConfig {
			name: "minimax",
			fixed_endpoint: Some("https://api.minimax.io/anthropic"),
			default_endpoint: "https://api.minimax.io/anthropic",
			auth_header: AuthHeader::Authorization,
			auth_type: AuthType::Bearer,
			forced_model: Some("MiniMax-M2"),
			stream_usage_cap_bytes,
		})
	}

	pub fn nanogpt(stream_usage_cap_bytes: usize) -> Self {
		Self::new(CompatibleConfig {
			name: "nanogpt",
			fixed_endpoint: None,
			default_endpoint: "https://nano-gpt.com/api/v1",
			auth_header: AuthHeader::XApiKey,
			auth_type: AuthType::Direct,
			forced_model: None,
			stream_usage_cap_bytes,
		})
	}

	pub fn anthropic_compatible(stream_usage_cap_bytes: usize) -> Self {
		Self::new(CompatibleConfig {
			name: "anthropic-compatible",
			fixed_endpoint: None,
			default_endpoint: "https://unconfigured.anthropic-compatible.invalid",
			auth_header: AuthHeader::Authorization,
			auth_type: AuthType::Bearer,
			forced_model: None,
			stream_usage_cap_bytes,
		})
	}

	/// Never fails (spec.md §8 invariant 2): a configured, valid
	/// `account.custom_endpoint` wins; otherwise the fixed endpoint
	/// (z.ai/Minimax) or, lacking either, `default_endpoint`. A request that
	/// actually needs a configured endpoint and doesn't have one is rejected
	/// in `refresh_token`, before this URL is ever dispatched.
	fn endpoint(&self, account: Option<&Account>) -> String {
		if let Some(fixed) = self.config.fixed_endpoint {
			return fixed.to_string();
		}
		let configured = account.and_then(|a| a.custom_endpoint.as_deref());
		match configured.filter(|e| url::Url::parse(e).is_ok()) {
			Some(e) => e.trim_end_matches('/').to_string(),
			None => self.config.default_endpoint.to_string(),
		}
	}

	/// `true` for providers whose endpoint must come from
	/// `account.custom_endpoint` (no fixed upstream of their own).
	fn requires_custom_endpoint(&self) -> bool {
		self.config.fixed_endpoint.is_none()
	}
}

#[async_trait]
impl Provider for CompatibleProvider {
	fn name(&self) -> &'static str {
		self.config.name
	}

	async fn refresh_token(
		&self,
		account: &Account,
		_client_id: &str,
	) -> Result<TokenRefreshResult, ProviderError> {
		// Pure API-key providers: the key is the credential, nothing expires.
		let api_key = account
			.api_key
			.clone()
			.ok_or(ProviderError::MissingCredentials(self.config.name))?;
		if self.requires_custom_endpoint() {
			let valid = account.custom_endpoint.as_deref().is_some_and(|e| url::Url::parse(e).is_ok());
			if !valid {
				return Err(ProviderError::MissingCredentials(self.config.name));
			}
		}
		Ok(TokenRefreshResult { access_token: api_key, expires_at: i64::MAX, refresh_token: Some(String::new()) })
	}

	/// Never fails, per spec.md §8 invariant 2 — see [`Self::endpoint`].
	fn build_url(
		&self,
		request: &super::ProviderRequest,
		account: Option<&Account>,
	) -> Result<String, ProviderError> {
		let endpoint = self.endpoint(account);
		let mut url = format!("{endpoint}{}", request.path);
		if let Some(q) = request.query.as_deref().filter(|q| !q.is_empty()) {
			url.push('?');
			url.push_str(q);
		}
		Ok(url)
	}

	async fn prepare_headers(
		&self,
		request: &mut super::ProviderRequest,
		_resolved_url: &str,
		access_token: Option<&str>,
		_api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		header_util::sanitize_client_headers(&mut request.headers, true);
		if let Some(token) = access_token {
			match self.config.auth_type {
				AuthType::Bearer => header_util::set_bearer(&mut request.headers, token)?,
				AuthType::Direct => {
					header_util::set_direct(&mut request.headers, self.config.auth_header.name(), token)?
				},
			}
		}
		Ok(())
	}

	fn parse_rate_limit(&self, headers: &HeaderMap, status: StatusCode, now_ms: i64) -> ratelimit::RateLimitInfo {
		ratelimit::parse_unified(headers, status, now_ms)
	}

	fn parse_rate_limit_body(&self, body: &[u8]) -> Option<ratelimit::RateLimitInfo> {
		if self.config.name == "zai" { ratelimit::parse_zai_body(body) } else { None }
	}

	async fn process_response(
		&self,
		_request: &super::ProviderRequest,
		mut response: ProviderResponse,
		_account: Option<&Account>,
	) -> Result<ProviderResponse, ProviderError> {
		header_util::sanitize_response_headers(&mut response.headers);
		Ok(response)
	}

	async fn transform_request_body(
		&self,
		request: &mut super::ProviderRequest,
		account: Option<&Account>,
	) -> Result<(), ProviderError> {
		match self.config.forced_model {
			Some(forced) => force_model(request, forced),
			None => remap_model(request, account),
		}
	}

	fn extract_usage_info(&self, body: &[u8], is_streaming: bool, _headers: &HeaderMap) -> Option<UsageInfo> {
		if is_streaming {
			usage::from_sse_bounded(vec![Bytes::copy_from_slice(body)], self.config.stream_usage_cap_bytes)
		} else {
			usage::from_json(body)
		}
	}
}

fn remap_model(request: &mut super::ProviderRequest, account: Option<&Account>) -> Result<(), ProviderError> {
	let mut body: serde_json::Value =
		serde_json::from_slice(&request.body).map_err(ProviderError::ResponseParsing)?;
	let Some(model) = body.get("model").and_then(|m| m.as_str()).map(|s| s.to_string()) else {
		return Ok(());
	};
	let account_mappings = account.map(|a| a.string_model_mappings());
	let static_mappings: HashMap<&str, &str> = HashMap::new();
	let resolved = crate::model_map::resolve(&model, account_mappings.as_ref(), &static_mappings);
	if resolved != model {
		body["model"] = serde_json::Value::String(resolved);
		request.body = serde_json::to_vec(&body).map_err(ProviderError::RequestMarshal)?.into();
	}
	Ok(())
}

fn force_model(request: &mut super::ProviderRequest, forced: &str) -> Result<(), ProviderError> {
	let mut body: serde_json::Value =
		serde_json::from_slice(&request.body).map_err(ProviderError::ResponseParsing)?;
	body["model"] = serde_json::Value::String(forced.to_string());
	request.body = serde_json::to_vec(&body).map_err(ProviderError::RequestMarshal)?.into();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::provider::ProviderRequest;

	fn req(body: &str) -> ProviderRequest {
		ProviderRequest {
			path: "/v1/messages".into(),
			query: None,
			headers: HeaderMap::new(),
			body: Bytes::from(body.to_string()),
			provider_state: Default::default(),
		}
	}

	fn test_account() -> Account {
		Account {
			id: "a1".into(),
			name: "test".into(),
			provider: crate::account::ProviderKind::Nanogpt,
			api_key: None,
			access_token: None,
			refresh_token: None,
			expires_at: None,
			custom_endpoint: None,
			model_mappings: None,
			priority: 0,
			paused: false,
			rate_limited_until: None,
			auto_refresh_enabled: true,
			auto_fallback_enabled: true,
			cross_region_mode: crate::account::CrossRegionMode::default(),
			request_count: 0,
			total_requests: 0,
			session_start: None,
			session_request_count: 0,
			created_at: 0,
			last_used: None,
		}
	}

	#[tokio::test]
	async fn minimax_forces_model_regardless_of_input() {
		let provider = CompatibleProvider::minimax(1024);
		let mut request = req(r#"{"model":"claude-3-5-sonnet-20241022"}"#);
		provider.transform_request_body(&mut request, None).await.unwrap();
		let v: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
		assert_eq!(v["model"], "MiniMax-M2");
	}

	#[test]
	fn zai_fixed_endpoint_ignores_custom_endpoint() {
		let provider = CompatibleProvider::zai(1024);
		let url = provider.build_url(&req(""), None).unwrap();
		assert_eq!(url, "https://api.z.ai/api/anthropic/v1/messages");
	}

	#[test]
	fn nanogpt_build_url_falls_back_to_default_without_custom_endpoint() {
		let provider = CompatibleProvider::nanogpt(1024);
		let url = provider.build_url(&req(""), None).unwrap();
		assert_eq!(url, "https://nano-gpt.com/api/v1/v1/messages");
	}

	#[test]
	fn nanogpt_build_url_uses_valid_custom_endpoint() {
		let provider = CompatibleProvider::nanogpt(1024);
		let mut account = test_account();
		account.custom_endpoint = Some("https://my-nanogpt-proxy.example".to_string());
		let url = provider.build_url(&req(""), Some(&account)).unwrap();
		assert_eq!(url, "https://my-nanogpt-proxy.example/v1/messages");
	}

	#[tokio::test]
	async fn nanogpt_refresh_token_fails_without_custom_endpoint() {
		let provider = CompatibleProvider::nanogpt(1024);
		let mut account = test_account();
		account.api_key = Some("key-123".to_string());
		assert!(provider.refresh_token(&account, "client-id").await.is_err());
	}

	#[tokio::test]
	async fn nanogpt_refresh_token_succeeds_with_valid_endpoint_and_key() {
		let provider = CompatibleProvider::nanogpt(1024);
		let mut account = test_account();
		account.api_key = Some("key-123".to_string());
		account.custom_endpoint = Some("https://my-nanogpt-proxy.example".to_string());
		let result = provider.refresh_token(&account, "client-id").await.unwrap();
		assert_eq!(result.access_token, "key-123");
	}

	#[test]
	fn zai_parses_body_rate_limit_signal() {
		let provider = CompatibleProvider::zai(1024);
		let body = br#"{"type":"error","error":{"type":"1308","message":"reset at 2025-10-03 08:23:14"}}"#;
		assert!(provider.parse_rate_limit_body(body).unwrap().is_rate_limited);
		assert!(CompatibleProvider::minimax(1024).parse_rate_limit_body(body).is_none());
	}

	#[tokio::test]
	async fn direct_auth_type_skips_bearer_prefix() {
		let provider = CompatibleProvider::zai(1024);
		let mut request = req(r#"{}"#);
		provider.prepare_headers(&mut request, "https://api.z.ai/api/anthropic/v1/messages", Some("key-123"), None).await.unwrap();
		assert_eq!(request.headers.get("x-api-key").unwrap(), "key-123");
	}
}
