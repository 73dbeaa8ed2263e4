//! Provider Abstraction Layer + Request/Response Transformation Pipeline
//! for a multi-account LLM reverse proxy: the polymorphic [`provider::Provider`]
//! trait, concrete adapters for Anthropic, the Anthropic-compatible family
//! (z.ai/Minimax/NanoGPT), OpenAI-compatible (+Kilo/OpenRouter), AWS
//! Bedrock and Vertex AI, credential refresh, Anthropic⇄OpenAI translation
//! including SSE rewriting, rate-limit parsing, usage extraction, and the
//! provider [`provider::Registry`].
//!
//! This crate has no binary target and starts no HTTP server of its own
//! (spec.md §1): a host built on axum/hyper/whatever owns the request
//! loop, account persistence, and load-balancing policy, and drives these
//! types from its own dispatch code. [`build_registry`] wires the default
//! adapter set together the way a host's startup code would.

pub mod account;
pub mod config;
pub mod error;
pub mod headers;
pub mod model_map;
pub mod pkce;
pub mod provider;
pub mod ratelimit;
pub mod sse;
pub mod stream_util;
pub mod usage;
pub mod usage_fetcher;

pub use account::{Account, AccountStore, CrossRegionMode, ProviderKind, TokenRefreshResult};
pub use config::Config;
pub use error::{AuthError, BedrockError, ProviderError, TranslatedStatus};
pub use provider::{OAuthProvider, Provider, ProviderRequest, ProviderResponse, Registry, ResponseBody, UsageInfo};
pub use usage_fetcher::{UsageFetcher, UsageProviderKind};

use provider::anthropic::AnthropicProvider;
use provider::bedrock::BedrockProvider;
use provider::compatible::CompatibleProvider;
use provider::openai_compatible::OpenAiCompatibleProvider;
use provider::vertex::VertexProvider;

/// Registers the full default adapter set (every provider named in
/// spec.md §3's `provider` tag) into a fresh [`Registry`], the way a
/// host's startup code wires up the teacher's `AIProvider` set.
pub fn build_registry(http: reqwest::Client, config: &Config) -> Registry {
	let registry = Registry::new();
	registry.register(std::sync::Arc::new(AnthropicProvider::new(http.clone(), config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(CompatibleProvider::zai(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(CompatibleProvider::minimax(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(CompatibleProvider::nanogpt(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(CompatibleProvider::anthropic_compatible(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(OpenAiCompatibleProvider::openai_compatible(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(OpenAiCompatibleProvider::kilo(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(OpenAiCompatibleProvider::openrouter(config.stream_usage_cap_bytes)));
	registry.register(std::sync::Arc::new(BedrockProvider::new(http.clone(), config)));
	registry.register(std::sync::Arc::new(VertexProvider::new(config.stream_usage_cap_bytes)));
	registry
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_registry_registers_every_provider_tag() {
		let registry = build_registry(reqwest::Client::new(), &Config::default());
		let mut names = registry.list();
		names.sort();
		assert_eq!(
			names,
			vec![
				"anthropic",
				"anthropic-compatible",
				"bedrock",
				"kilo",
				"minimax",
				"nanogpt",
				"openai-compatible",
				"openrouter",
				"vertex-ai",
				"zai",
			]
		);
	}

	#[test]
	fn anthropic_provider_is_registered_with_oauth_support() {
		let registry = build_registry(reqwest::Client::new(), &Config::default());
		assert!(registry.get_oauth("anthropic").is_some());
	}
}
