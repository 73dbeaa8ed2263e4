//! Account data model (spec.md §3) and the store seam the core consumes.
//!
//! Accounts are owned by an external store (spec.md §1/§6: "the account
//! store... [is] treated only as an interface the core consumes"); this
//! module defines the row shape plus the [`AccountStore`] trait a host
//! implements against its real database.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-region inference profile selection for Bedrock accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossRegionMode {
	Geographic,
	Global,
	Regional,
}

impl Default for CrossRegionMode {
	fn default() -> Self {
		CrossRegionMode::Regional
	}
}

/// The ten provider tags spec.md enumerates in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
	Anthropic,
	AnthropicCompatible,
	Zai,
	Minimax,
	Nanogpt,
	OpenaiCompatible,
	Kilo,
	Openrouter,
	Bedrock,
	VertexAi,
}

impl ProviderKind {
	pub fn as_str(self) -> &'static str {
		match self {
			ProviderKind::Anthropic => "anthropic",
			ProviderKind::AnthropicCompatible => "anthropic-compatible",
			ProviderKind::Zai => "zai",
			ProviderKind::Minimax => "minimax",
			ProviderKind::Nanogpt => "nanogpt",
			ProviderKind::OpenaiCompatible => "openai-compatible",
			ProviderKind::Kilo => "kilo",
			ProviderKind::Openrouter => "openrouter",
			ProviderKind::Bedrock => "bedrock",
			ProviderKind::VertexAi => "vertex-ai",
		}
	}
}

/// A persisted account row, per spec.md §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub id: String,
	pub name: String,
	pub provider: ProviderKind,

	pub api_key: Option<String>,
	pub access_token: Option<String>,
	pub refresh_token: Option<String>,
	/// ms epoch
	pub expires_at: Option<i64>,

	/// Provider-interpreted: `"bedrock:<profile>:<region>"` for Bedrock,
	/// `{projectId, region}` JSON for Vertex, URL or
	/// `{endpoint, modelMappings}` for others.
	pub custom_endpoint: Option<String>,

	/// Exact client model names or pattern keys (`opus`/`sonnet`/`haiku`)
	/// mapped to provider model names. May contain a `custom` key read by
	/// Bedrock.
	pub model_mappings: Option<HashMap<String, Value>>,

	pub priority: i32,
	pub paused: bool,
	pub rate_limited_until: Option<i64>,
	pub auto_refresh_enabled: bool,
	pub auto_fallback_enabled: bool,
	pub cross_region_mode: CrossRegionMode,

	pub request_count: u64,
	pub total_requests: u64,
	pub session_start: Option<i64>,
	pub session_request_count: u64,
	pub created_at: i64,
	pub last_used: Option<i64>,
}

impl Account {
	/// Invariant from spec.md §3: an OAuth account has a refresh token and
	/// no api key; an api-key account has the reverse. Mode is derived,
	/// never stored.
	pub fn is_oauth(&self) -> bool {
		self.refresh_token.is_some() && self.api_key.is_none()
	}

	/// `model_mappings` flattened to plain string->string, skipping
	/// non-string values and the Bedrock-only `custom` key (callers that
	/// want `custom` use [`Self::bedrock_custom_model`]).
	pub fn string_model_mappings(&self) -> std::collections::HashMap<String, String> {
		self
			.model_mappings
			.iter()
			.flatten()
			.filter(|(k, _)| k.as_str() != "custom")
			.filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
			.collect()
	}

	pub fn bedrock_custom_model(&self) -> Option<String> {
		self
			.model_mappings
			.as_ref()?
			.get("custom")?
			.as_str()
			.map(|s| s.to_string())
	}
}

/// Tokens returned by a provider's credential refresh, per spec.md §3.
#[derive(Debug, Clone)]
pub struct TokenRefreshResult {
	pub access_token: String,
	pub expires_at: i64,
	/// `Some("")` means "preserve existing refresh token", `None` means
	/// "unchanged or provider-specific default" — spec.md §3.
	pub refresh_token: Option<String>,
}

/// External account store interface (spec.md §6): lookup, listing, and
/// the mutation hooks the core needs (pause/resume, priority, token
/// writeback). The core writes tokens back only when `refresh_token` is
/// non-empty and the returned tokens differ from what was read.
#[async_trait]
pub trait AccountStore: Send + Sync {
	async fn get(&self, id: &str) -> Option<Account>;
	async fn get_by_name(&self, name: &str) -> Option<Account>;
	async fn list(&self) -> Vec<Account>;
	async fn set_paused(&self, id: &str, paused: bool);
	async fn set_priority(&self, id: &str, priority: i32);
	async fn set_rate_limited_until(&self, id: &str, until_ms: Option<i64>);
	async fn write_back_tokens(&self, id: &str, result: &TokenRefreshResult);
	async fn mark_needs_reauth(&self, id: &str, reason: &str);
}

/// Should the core write the refreshed tokens back to the store? Per
/// spec.md §6: only when `refresh_token` is non-empty and something
/// actually changed.
pub fn should_write_back(
	existing_access_token: Option<&str>,
	existing_expires_at: Option<i64>,
	result: &TokenRefreshResult,
) -> bool {
	let refresh_is_empty_signal = matches!(result.refresh_token.as_deref(), Some(""));
	if refresh_is_empty_signal {
		return false;
	}
	existing_access_token != Some(result.access_token.as_str())
		|| existing_expires_at != Some(result.expires_at)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_account(provider: ProviderKind) -> Account {
		Account {
			id: "a1".into(),
			name: "test".into(),
			provider,
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
			cross_region_mode: CrossRegionMode::default(),
			request_count: 0,
			total_requests: 0,
			session_start: None,
			session_request_count: 0,
			created_at: 0,
			last_used: None,
		}
	}

	#[test]
	fn oauth_account_has_refresh_token_and_no_api_key() {
		let mut a = base_account(ProviderKind::Anthropic);
		a.refresh_token = Some("rt".into());
		assert!(a.is_oauth());
		a.api_key = Some("sk".into());
		assert!(!a.is_oauth());
	}

	#[test]
	fn write_back_skipped_on_empty_refresh_token_signal() {
		let result = TokenRefreshResult {
			access_token: "new".into(),
			expires_at: 123,
			refresh_token: Some("".into()),
		};
		assert!(!should_write_back(Some("old"), Some(1), &result));
	}

	#[test]
	fn write_back_happens_when_tokens_differ() {
		let result =
			TokenRefreshResult { access_token: "new".into(), expires_at: 123, refresh_token: None };
		assert!(should_write_back(Some("old"), Some(1), &result));
		assert!(!should_write_back(Some("new"), Some(123), &result));
	}

	#[test]
	fn bedrock_custom_model_reads_custom_key() {
		let mut a = base_account(ProviderKind::Bedrock);
		let mut mappings = HashMap::new();
		mappings.insert("custom".to_string(), Value::String("anthropic.claude-x".into()));
		a.model_mappings = Some(mappings);
		assert_eq!(a.bedrock_custom_model().as_deref(), Some("anthropic.claude-x"));
	}
}
