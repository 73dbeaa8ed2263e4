//! Anthropic OAuth provider (C8), spec.md §4.9.
//!
//! Grounded on `mhismail3-tron`'s OAuth module for the PKCE
//! authorize/exchange shape (its Anthropic backend is the closest thing in
//! the pack to a real OAuth client); state-equals-verifier and the
//! `console`/`max` authorize-base split are specific to spec.md and not
//! present in either teacher.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::OAuthProvider;
use crate::account::TokenRefreshResult;
use crate::error::{AuthError, ProviderError};

const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const SCOPES: &str = "org:create_api_key user:profile user:inference";

pub struct AnthropicOAuth {
	http: Client,
}

impl AnthropicOAuth {
	pub fn new(http: Client) -> Self {
		Self { http }
	}
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	refresh_token: Option<String>,
	expires_in: i64,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
	error_description: Option<String>,
	error: Option<String>,
}

#[async_trait]
impl OAuthProvider for AnthropicOAuth {
	/// `mode = "max"` wraps the authorize URL in claude.ai's login
	/// redirect; `mode = "console"` (or anything else) authorizes directly
	/// against the console.
	fn authorize_url(&self, client_id: &str, mode: &str, challenge: &str, state: &str) -> String {
		let base = if mode == "max" { "https://claude.ai" } else { "https://console.anthropic.com" };
		let params = format!(
			"code=true&client_id={client_id}&response_type=code&redirect_uri={redirect}&scope={scope}&\
			 code_challenge={challenge}&code_challenge_method=S256&state={state}",
			redirect = percent_encoding::utf8_percent_encode(REDIRECT_URI, percent_encoding::NON_ALPHANUMERIC),
			scope = percent_encoding::utf8_percent_encode(SCOPES, percent_encoding::NON_ALPHANUMERIC),
		);
		if mode == "max" {
			let inner = format!("{base}/oauth/authorize?{params}");
			format!(
				"{base}/login?selectAccount=true&returnTo={}",
				percent_encoding::utf8_percent_encode(&inner, percent_encoding::NON_ALPHANUMERIC)
			)
		} else {
			format!("{base}/oauth/authorize?{params}")
		}
	}

	fn scopes(&self) -> &'static str {
		SCOPES
	}

	fn redirect_uri(&self) -> &'static str {
		REDIRECT_URI
	}

	fn token_url(&self) -> &'static str {
		TOKEN_URL
	}

	/// `submitted_code` may be `code#state` (state possibly empty); `state`
	/// in this flow is always the PKCE verifier itself, per spec.md §4.9.
	async fn exchange_code(
		&self,
		client_id: &str,
		submitted_code: &str,
		verifier: &str,
	) -> Result<TokenRefreshResult, ProviderError> {
		let (code, state) = match submitted_code.split_once('#') {
			Some((code, state)) => (code, state),
			None => (submitted_code, ""),
		};

		let resp = self
			.http
			.post(TOKEN_URL)
			.json(&json!({
				"code": code,
				"state": state,
				"grant_type": "authorization_code",
				"client_id": client_id,
				"redirect_uri": REDIRECT_URI,
				"code_verifier": verifier,
			}))
			.send()
			.await
			.map_err(AuthError::Transport)?;

		let status = resp.status();
		let body = resp.text().await.map_err(AuthError::Transport)?;
		if !status.is_success() {
			let message = serde_json::from_str::<OAuthErrorBody>(&body)
				.ok()
				.and_then(|e| e.error_description.or(e.error))
				.unwrap_or_else(|| status.canonical_reason().unwrap_or("oauth error").to_string());
			return Err(AuthError::OAuth { status: status.as_u16(), message }.into());
		}

		let parsed: TokenResponse = serde_json::from_str(&body).map_err(ProviderError::ResponseParsing)?;
		Ok(TokenRefreshResult {
			access_token: parsed.access_token,
			expires_at: now_ms() + parsed.expires_in * 1000,
			refresh_token: parsed.refresh_token,
		})
	}
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn console_mode_authorizes_directly() {
		let oauth = AnthropicOAuth::new(Client::new());
		let url = oauth.authorize_url("client-1", "console", "chal", "state1");
		assert!(url.starts_with("https://console.anthropic.com/oauth/authorize?"));
		assert!(url.contains("client_id=client-1"));
		assert!(url.contains("code_challenge=chal"));
	}

	#[test]
	fn max_mode_wraps_in_login_redirect() {
		let oauth = AnthropicOAuth::new(Client::new());
		let url = oauth.authorize_url("client-1", "max", "chal", "state1");
		assert!(url.starts_with("https://claude.ai/login?selectAccount=true&returnTo="));
		assert!(url.contains("console.anthropic.com%2Foauth%2Fauthorize"));
	}

	#[test]
	fn exposes_fixed_config() {
		let oauth = AnthropicOAuth::new(Client::new());
		assert_eq!(oauth.redirect_uri(), REDIRECT_URI);
		assert_eq!(oauth.token_url(), TOKEN_URL);
		assert_eq!(oauth.scopes(), SCOPES);
	}
}
