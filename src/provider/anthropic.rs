//! The authoritative Anthropic adapter (C7), spec.md §4.3.
//!
//! Grounded on `llm/anthropic.rs` for the provider shape/name, and on
//! `mhismail3-tron`'s refresh-token POST + reauth classification (the
//! teacher's Anthropic backend does not itself refresh OAuth tokens).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde_json::json;

use super::{OAuthProvider, Provider, ProviderResponse, UsageInfo};
use crate::account::{Account, TokenRefreshResult};
use crate::error::{AuthError, ProviderError};
use crate::provider::oauth_anthropic::AnthropicOAuth;
use crate::{headers as header_util, ratelimit, usage};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

pub struct AnthropicProvider {
	http: Client,
	oauth: Arc<AnthropicOAuth>,
	stream_usage_cap_bytes: usize,
}

impl AnthropicProvider {
	pub fn new(http: Client, stream_usage_cap_bytes: usize) -> Self {
		let oauth = Arc::new(AnthropicOAuth::new(http.clone()));
		Self { http, oauth, stream_usage_cap_bytes }
	}

	fn resolve_endpoint(account: Option<&Account>) -> String {
		account
			.and_then(|a| a.custom_endpoint.as_deref())
			.filter(|e| url::Url::parse(e).is_ok())
			.unwrap_or(DEFAULT_ENDPOINT)
			.trim_end_matches('/')
			.to_string()
	}
}

#[async_trait]
impl Provider for AnthropicProvider {
	fn name(&self) -> &'static str {
		"anthropic"
	}

	async fn refresh_token(
		&self,
		account: &Account,
		client_id: &str,
	) -> Result<TokenRefreshResult, ProviderError> {
		// API-key accounts never refresh: the key is long-lived and there is
		// nothing to write back.
		if let Some(api_key) = &account.api_key {
			return Ok(TokenRefreshResult {
				access_token: api_key.clone(),
				expires_at: i64::MAX,
				refresh_token: Some(String::new()),
			});
		}

		let refresh_token = account
			.refresh_token
			.as_deref()
			.ok_or(ProviderError::MissingCredentials("anthropic"))?;

		let resp = self
			.http
			.post(TOKEN_URL)
			.json(&json!({
				"grant_type": "refresh_token",
				"refresh_token": refresh_token,
				"client_id": client_id,
			}))
			.send()
			.await
			.map_err(AuthError::Transport)?;

		let status = resp.status();
		let body = resp.text().await.map_err(AuthError::Transport)?;

		if status == StatusCode::UNAUTHORIZED && is_fatal_reauth_message(&body) {
			return Err(ProviderError::ReauthRequired {
				account: account.id.clone(),
				message: body,
			});
		}
		if !status.is_success() {
			return Err(ProviderError::TokenRefreshFailed { account: account.id.clone(), message: body });
		}

		let parsed: serde_json::Value =
			serde_json::from_str(&body).map_err(ProviderError::ResponseParsing)?;
		let access_token = parsed
			.get("access_token")
			.and_then(|v| v.as_str())
			.ok_or(AuthError::MissingField("access_token"))?
			.to_string();
		let expires_in = parsed.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);
		let refresh_token =
			parsed.get("refresh_token").and_then(|v| v.as_str()).map(|s| s.to_string());

		Ok(TokenRefreshResult {
			access_token,
			expires_at: chrono::Utc::now().timestamp_millis() + expires_in * 1000,
			refresh_token,
		})
	}

	fn can_handle(&self, _path: &str) -> bool {
		true
	}

	fn build_url(
		&self,
		request: &super::ProviderRequest,
		account: Option<&Account>,
	) -> Result<String, ProviderError> {
		let endpoint = Self::resolve_endpoint(account);
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
		api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		header_util::sanitize_client_headers(&mut request.headers, true);
		if let Some(token) = access_token {
			header_util::set_bearer(&mut request.headers, token)?;
		} else if let Some(key) = api_key {
			header_util::set_direct(&mut request.headers, "x-api-key", key)?;
		}
		Ok(())
	}

	fn parse_rate_limit(&self, headers: &HeaderMap, status: StatusCode, now_ms: i64) -> ratelimit::RateLimitInfo {
		ratelimit::parse_unified(headers, status, now_ms)
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

	fn extract_tier_info(&self, body: &[u8]) -> Option<i32> {
		let v: serde_json::Value = serde_json::from_slice(body).ok()?;
		let tokens = v.get("usage")?.get("rate_limit_tokens")?.as_i64()?;
		Some(tier_for(tokens))
	}

	fn extract_usage_info(&self, body: &[u8], is_streaming: bool, headers: &HeaderMap) -> Option<UsageInfo> {
		let mut info = if is_streaming {
			usage::from_sse_bounded(vec![Bytes::copy_from_slice(body)], self.stream_usage_cap_bytes)
		} else {
			usage::from_json(body)
		}?;
		info.cost = usage::cost_from_header(headers);
		Some(info)
	}

	fn supports_oauth(&self) -> bool {
		true
	}

	fn oauth_provider(&self) -> Option<Arc<dyn OAuthProvider>> {
		Some(self.oauth.clone())
	}
}

/// Tier thresholds per spec.md §4.1: 200k and 800k `rate_limit_tokens`.
fn tier_for(rate_limit_tokens: i64) -> i32 {
	if rate_limit_tokens >= 800_000 {
		20
	} else if rate_limit_tokens >= 200_000 {
		5
	} else {
		1
	}
}

fn is_fatal_reauth_message(body: &str) -> bool {
	body.contains("OAuth authentication is currently not supported")
		|| body.contains("invalid_grant")
		|| body.contains("invalid_refresh_token")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tier_thresholds_match_spec() {
		assert_eq!(tier_for(0), 1);
		assert_eq!(tier_for(199_999), 1);
		assert_eq!(tier_for(200_000), 5);
		assert_eq!(tier_for(799_999), 5);
		assert_eq!(tier_for(800_000), 20);
	}

	#[test]
	fn fatal_reauth_messages_are_recognized() {
		assert!(is_fatal_reauth_message("invalid_grant: token revoked"));
		assert!(is_fatal_reauth_message("OAuth authentication is currently not supported for this account"));
		assert!(!is_fatal_reauth_message("temporary server error"));
	}

	fn req(path: &str, query: Option<&str>) -> super::super::ProviderRequest {
		super::super::ProviderRequest {
			path: path.to_string(),
			query: query.map(str::to_string),
			headers: HeaderMap::new(),
			body: Bytes::new(),
			provider_state: Default::default(),
		}
	}

	#[test]
	fn build_url_falls_back_to_default_on_malformed_endpoint() {
		let provider = AnthropicProvider::new(Client::new(), 1024);
		let mut account = test_account();
		account.custom_endpoint = Some("not a url".to_string());
		let url = provider.build_url(&req("/v1/messages", None), Some(&account)).unwrap();
		assert_eq!(url, "https://api.anthropic.com/v1/messages");
	}

	#[test]
	fn build_url_uses_valid_custom_endpoint() {
		let provider = AnthropicProvider::new(Client::new(), 1024);
		let mut account = test_account();
		account.custom_endpoint = Some("https://my-proxy.example".to_string());
		let url = provider.build_url(&req("/v1/messages", Some("beta=true")), Some(&account)).unwrap();
		assert_eq!(url, "https://my-proxy.example/v1/messages?beta=true");
	}

	#[test]
	fn extract_usage_info_reads_cost_from_billing_header() {
		let provider = AnthropicProvider::new(Client::new(), 1024);
		let body = br#"{"model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":10,"output_tokens":20}}"#;
		let mut headers = HeaderMap::new();
		headers.insert("anthropic-billing-cost", "0.042".parse().unwrap());
		let usage = provider.extract_usage_info(body, false, &headers).unwrap();
		assert_eq!(usage.cost, Some(0.042));
		assert_eq!(usage.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
	}

	#[test]
	fn extract_usage_info_cost_is_none_without_header() {
		let provider = AnthropicProvider::new(Client::new(), 1024);
		let body = br#"{"usage":{"input_tokens":10,"output_tokens":20}}"#;
		let usage = provider.extract_usage_info(body, false, &HeaderMap::new()).unwrap();
		assert_eq!(usage.cost, None);
	}

	#[test]
	fn api_key_refresh_never_touches_network() {
		let provider = AnthropicProvider::new(Client::new(), 1024);
		let mut account = test_account();
		account.api_key = Some("sk-ant-xyz".to_string());
		let result = futures::executor::block_on(provider.refresh_token(&account, "client-id")).unwrap();
		assert_eq!(result.access_token, "sk-ant-xyz");
		assert_eq!(result.refresh_token.as_deref(), Some(""));
	}

	fn test_account() -> Account {
		Account {
			id: "a1".into(),
			name: "test".into(),
			provider: crate::account::ProviderKind::Anthropic,
			api_key: None,
			access_token: None,
			refresh_token: Some("rt".into()),
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
}
