//! Bedrock model cache (C10): fuzzy-match a client model name against the
//! per-region foundation-model catalog, spec.md §4.7 step 2 / §3
//! "BedrockModel (cache entry)".
//!
//! Grounded on `ScriptSmith-hadrian`'s `FoundationModelsCache` (per-region
//! TTL cache populated from `ListFoundationModels`, `is_stale()` gate) via
//! [`super::cache_common::RegionTtlCache`]; the catalog fetch itself is an
//! injected [`ModelCatalogFetcher`] per spec.md §9 ("credential resolution
//! should be treated as an injected interface so tests can substitute
//! fakes") with a real implementation signing a `GET /foundation-models`
//! call the way `signing::AwsRequestSigner` signs Converse calls.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::cache_common::{retry_with_backoff, RegionTtlCache};
use super::signing::AwsRequestSigner;
use crate::error::BedrockError;

/// One catalog entry: the raw AWS model id plus its normalized search key
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedrockModel {
	pub model_id: String,
	pub search_key: String,
}

impl BedrockModel {
	pub fn new(model_id: impl Into<String>) -> Self {
		let model_id = model_id.into();
		let search_key = normalize(&model_id);
		Self { model_id, search_key }
	}
}

static REGION_PREFIX: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^(?:us|eu|apac|au|ca|jp|global)\.").expect("valid regex"));
static VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-v\d+(:\d+)?$").expect("valid regex"));

/// Strips the cross-region prefix, the `anthropic.` vendor prefix, and a
/// trailing `-v<n>(:<n>)?` version suffix, lowercased. Idempotent: running
/// it twice yields the same string (spec.md §8 invariant 6).
pub fn normalize(raw: &str) -> String {
	let lowered = raw.to_lowercase();
	let without_region = REGION_PREFIX.replace(&lowered, "");
	let without_version = VERSION_SUFFIX.replace(&without_region, "");
	without_version.strip_prefix("anthropic.").map(str::to_string).unwrap_or_else(|| without_version.into_owned())
}

/// `exact ⇒ 1.0; substring ⇒ 0.8; else 1 − Levenshtein/maxLen` (spec.md §4.7
/// step 2).
pub fn match_score(client_model: &str, candidate_search_key: &str) -> f64 {
	let client_key = normalize(client_model);
	if client_key == candidate_search_key {
		return 1.0;
	}
	if candidate_search_key.contains(&client_key) || client_key.contains(candidate_search_key) {
		return 0.8;
	}
	let max_len = client_key.chars().count().max(candidate_search_key.chars().count());
	if max_len == 0 {
		return 1.0;
	}
	let distance = strsim::levenshtein(&client_key, candidate_search_key);
	1.0 - (distance as f64 / max_len as f64)
}

const ACCEPT_THRESHOLD: f64 = 0.70;

/// Best-scoring candidate at or above [`ACCEPT_THRESHOLD`], if any.
pub fn fuzzy_match<'a>(client_model: &str, candidates: &'a [BedrockModel]) -> Option<&'a BedrockModel> {
	candidates
		.iter()
		.map(|c| (c, match_score(client_model, &c.search_key)))
		.filter(|(_, score)| *score >= ACCEPT_THRESHOLD)
		.max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
		.map(|(c, _)| c)
}

/// Fetches the foundation-model catalog for a region. Injected so tests
/// substitute a fake instead of hitting AWS.
#[async_trait]
pub trait ModelCatalogFetcher: Send + Sync {
	async fn list_models(&self, region: &str) -> Result<Vec<BedrockModel>, BedrockError>;
}

/// Real fetcher: a SigV4-signed `GET /foundation-models` against the
/// Bedrock control plane (`bedrock.<region>.amazonaws.com`, distinct from
/// the `bedrock-runtime` host Converse calls use).
pub struct HttpModelCatalogFetcher {
	http: reqwest::Client,
}

impl HttpModelCatalogFetcher {
	pub fn new(http: reqwest::Client) -> Self {
		Self { http }
	}
}

#[async_trait]
impl ModelCatalogFetcher for HttpModelCatalogFetcher {
	async fn list_models(&self, region: &str) -> Result<Vec<BedrockModel>, BedrockError> {
		let signer = AwsRequestSigner::new(None, region);
		let url = format!("https://bedrock.{region}.amazonaws.com/foundation-models");
		let signed = signer.sign_request("GET", &url, &[], b"").await?;
		let mut builder = self.http.get(&url);
		for (name, value) in &signed {
			builder = builder.header(name, value);
		}
		let response = builder.send().await.map_err(|e| BedrockError::CacheFetchFailed(e.to_string()))?;
		if !response.status().is_success() {
			return Err(BedrockError::CacheFetchFailed(format!("status {}", response.status())));
		}
		let body: serde_json::Value =
			response.json().await.map_err(|e| BedrockError::CacheFetchFailed(e.to_string()))?;
		let models = body
			.get("modelSummaries")
			.and_then(|v| v.as_array())
			.into_iter()
			.flatten()
			.filter_map(|m| m.get("modelId").and_then(|id| id.as_str()))
			.map(BedrockModel::new)
			.collect();
		Ok(models)
	}
}

/// Per-region TTL cache of the foundation-model catalog, populated
/// on-demand through `fetcher` with exponential-backoff retries.
pub struct BedrockModelCache {
	fetcher: Box<dyn ModelCatalogFetcher>,
	cache: RegionTtlCache<Vec<BedrockModel>>,
}

impl BedrockModelCache {
	pub fn new(fetcher: Box<dyn ModelCatalogFetcher>, ttl: Duration) -> Self {
		Self { fetcher, cache: RegionTtlCache::new(ttl) }
	}

	/// Returns the catalog for `region`, refreshing through the fetcher
	/// (three retries, 1s/2s/4s backoff) if not cached or expired. On
	/// persistent fetch failure, returns an empty catalog so callers fall
	/// back to passthrough rather than failing the request (spec.md §7
	/// `CacheFetchFailed`).
	pub async fn models_for(&self, region: &str) -> Vec<BedrockModel> {
		if let Some(cached) = self.cache.get(region) {
			return cached;
		}
		let fetched = retry_with_backoff(|| self.fetcher.list_models(region)).await.unwrap_or_default();
		self.cache.put(region, fetched.clone());
		fetched
	}

	/// Resolve a client model name to a Bedrock model id for `region`:
	/// fuzzy-match the cached catalog, falling back to the client name
	/// verbatim when nothing scores high enough (spec.md §4.7 step 2).
	pub async fn resolve(&self, client_model: &str, region: &str) -> String {
		let catalog = self.models_for(region).await;
		fuzzy_match(client_model, &catalog).map(|m| m.model_id.clone()).unwrap_or_else(|| client_model.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_strips_region_vendor_and_version() {
		assert_eq!(normalize("us.anthropic.claude-3-5-sonnet-20241022-v2:0"), "claude-3-5-sonnet-20241022");
	}

	#[test]
	fn normalize_is_idempotent() {
		let once = normalize("us.anthropic.claude-3-5-sonnet-20241022-v2:0");
		let twice = normalize(&once);
		assert_eq!(once, twice);
	}

	#[test]
	fn normalize_handles_global_prefix_and_no_version() {
		assert_eq!(normalize("global.anthropic.claude-opus-4-6"), "claude-opus-4-6");
	}

	#[test]
	fn exact_match_scores_one() {
		assert_eq!(match_score("claude-3-5-sonnet-20241022", "claude-3-5-sonnet-20241022"), 1.0);
	}

	#[test]
	fn substring_match_scores_point_eight() {
		assert_eq!(match_score("sonnet-20241022", "claude-3-5-sonnet-20241022"), 0.8);
	}

	#[test]
	fn distant_strings_score_via_levenshtein() {
		let score = match_score("claude-opus-4", "claude-opus-5");
		assert!(score > 0.0 && score < 0.8);
	}

	#[test]
	fn fuzzy_match_rejects_below_threshold() {
		let candidates = vec![BedrockModel::new("us.anthropic.titan-text-v1:0")];
		assert!(fuzzy_match("claude-opus-4-6", &candidates).is_none());
	}

	#[test]
	fn fuzzy_match_picks_best_scoring_candidate() {
		let candidates = vec![
			BedrockModel::new("us.anthropic.claude-3-5-sonnet-20241022-v2:0"),
			BedrockModel::new("us.anthropic.claude-3-5-sonnet-20240620-v1:0"),
		];
		let matched = fuzzy_match("claude-3-5-sonnet-20241022", &candidates).unwrap();
		assert_eq!(matched.model_id, "us.anthropic.claude-3-5-sonnet-20241022-v2:0");
	}

	struct FakeFetcher(Vec<BedrockModel>);

	#[async_trait]
	impl ModelCatalogFetcher for FakeFetcher {
		async fn list_models(&self, _region: &str) -> Result<Vec<BedrockModel>, BedrockError> {
			Ok(self.0.clone())
		}
	}

	#[tokio::test]
	async fn resolve_falls_back_to_client_name_with_no_catalog_match() {
		let cache = BedrockModelCache::new(
			Box::new(FakeFetcher(vec![BedrockModel::new("us.anthropic.titan-text-v1:0")])),
			Duration::from_secs(60),
		);
		let resolved = cache.resolve("claude-opus-4-6", "us-east-1").await;
		assert_eq!(resolved, "claude-opus-4-6");
	}

	#[tokio::test]
	async fn resolve_caches_catalog_across_calls() {
		use std::sync::atomic::{AtomicU32, Ordering};
		use std::sync::Arc;

		struct CountingFetcher(Arc<AtomicU32>);
		#[async_trait]
		impl ModelCatalogFetcher for CountingFetcher {
			async fn list_models(&self, _region: &str) -> Result<Vec<BedrockModel>, BedrockError> {
				self.0.fetch_add(1, Ordering::SeqCst);
				Ok(vec![BedrockModel::new("us.anthropic.claude-opus-4-6-v1:0")])
			}
		}
		let calls = Arc::new(AtomicU32::new(0));
		let cache = BedrockModelCache::new(Box::new(CountingFetcher(calls.clone())), Duration::from_secs(60));
		cache.resolve("claude-opus-4-6", "us-east-1").await;
		cache.resolve("claude-opus-4-6", "us-east-1").await;
		assert_eq!(cache.models_for("us-east-1").await.len(), 1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
