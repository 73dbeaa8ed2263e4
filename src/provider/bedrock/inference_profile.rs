//! Bedrock inference-profile cache (C11): per-region, per-model knowledge
//! of which cross-region routing prefixes a model actually supports,
//! spec.md §4.7 step 3 / §3 "InferenceProfileInfo".
//!
//! Grounded on `ScriptSmith-hadrian`'s `InferenceProfileCache` (same
//! per-region TTL shape as C10, reused here via
//! [`super::cache_common::RegionTtlCache`]); the `ListInferenceProfiles`
//! call is an injected [`InferenceProfileFetcher`] per spec.md §9.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use super::cache_common::{retry_with_backoff, RegionTtlCache};
use super::model_cache::normalize;
use super::signing::AwsRequestSigner;
use crate::account::CrossRegionMode;
use crate::error::BedrockError;

/// Geographic prefixes a model's cross-region inference profiles can carry.
const GEOGRAPHIC_PREFIXES: [&str; 6] = ["us", "eu", "apac", "au", "ca", "jp"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferenceProfileInfo {
	pub model_id: String,
	pub geographic: Vec<String>,
	pub supports_global: bool,
	pub supports_regional: bool,
}

impl InferenceProfileInfo {
	fn supports(&self, mode: CrossRegionMode) -> bool {
		match mode {
			CrossRegionMode::Global => self.supports_global,
			CrossRegionMode::Regional => self.supports_regional,
			CrossRegionMode::Geographic => !self.geographic.is_empty(),
		}
	}
}

/// Builds a region's `{model -> InferenceProfileInfo}` map from the raw
/// inference-profile ids `ListInferenceProfiles` returns (e.g.
/// `us.anthropic.claude-opus-4-6-v1:0`, `global.anthropic.claude-opus-4-6-v1:0`,
/// or a bare `anthropic.claude-opus-4-6-v1:0` for direct on-demand access).
pub fn aggregate(profile_ids: &[String]) -> HashMap<String, InferenceProfileInfo> {
	let mut by_model: HashMap<String, InferenceProfileInfo> = HashMap::new();
	for id in profile_ids {
		let lowered = id.to_lowercase();
		let (prefix, rest) = match lowered.split_once('.') {
			Some((p, r)) if GEOGRAPHIC_PREFIXES.contains(&p) || p == "global" => (Some(p.to_string()), r),
			_ => (None, lowered.as_str()),
		};
		let model_key = normalize(rest);
		let entry = by_model.entry(model_key.clone()).or_insert_with(|| InferenceProfileInfo {
			model_id: model_key.clone(),
			geographic: Vec::new(),
			supports_global: false,
			supports_regional: false,
		});
		match prefix.as_deref() {
			Some("global") => entry.supports_global = true,
			Some(geo) => {
				if !entry.geographic.iter().any(|g| g == geo) {
					entry.geographic.push(geo.to_string());
				}
			},
			None => entry.supports_regional = true,
		}
	}
	for info in by_model.values_mut() {
		info.geographic.sort();
	}
	by_model
}

#[async_trait]
pub trait InferenceProfileFetcher: Send + Sync {
	async fn list_profile_ids(&self, region: &str) -> Result<Vec<String>, BedrockError>;
}

pub struct HttpInferenceProfileFetcher {
	http: reqwest::Client,
}

impl HttpInferenceProfileFetcher {
	pub fn new(http: reqwest::Client) -> Self {
		Self { http }
	}
}

#[async_trait]
impl InferenceProfileFetcher for HttpInferenceProfileFetcher {
	async fn list_profile_ids(&self, region: &str) -> Result<Vec<String>, BedrockError> {
		let signer = AwsRequestSigner::new(None, region);
		let url = format!("https://bedrock.{region}.amazonaws.com/inference-profiles");
		let signed = signer.sign_request("GET", &url, &[], b"").await?;
		let mut builder = self.http.get(&url);
		for (name, value) in &signed {
			builder = builder.header(name, value);
		}
		let response = builder.send().await.map_err(|e| BedrockError::CacheFetchFailed(e.to_string()))?;
		if is_permission_error(response.status().as_u16()) {
			tracing::warn!(
				region,
				"bedrock ListInferenceProfiles denied; grant bedrock:ListInferenceProfiles to use cross-region \
				 routing, assuming supported in the meantime"
			);
			return Err(BedrockError::CacheFetchFailed("permission denied".into()));
		}
		if !response.status().is_success() {
			return Err(BedrockError::CacheFetchFailed(format!("status {}", response.status())));
		}
		let body: serde_json::Value =
			response.json().await.map_err(|e| BedrockError::CacheFetchFailed(e.to_string()))?;
		let ids = body
			.get("inferenceProfileSummaries")
			.and_then(|v| v.as_array())
			.into_iter()
			.flatten()
			.filter_map(|p| p.get("inferenceProfileId").and_then(|id| id.as_str()))
			.map(str::to_string)
			.collect();
		Ok(ids)
	}
}

fn is_permission_error(status: u16) -> bool {
	status == 403
}

/// Optimistic placeholder returned when the catalog can't be fetched
/// (`CacheFetchFailed`, spec.md §7): every mode reads as supported so the
/// request proceeds rather than failing closed.
fn assume_supported(model_key: &str) -> InferenceProfileInfo {
	InferenceProfileInfo {
		model_id: model_key.to_string(),
		geographic: GEOGRAPHIC_PREFIXES.iter().map(|s| s.to_string()).collect(),
		supports_global: true,
		supports_regional: true,
	}
}

pub struct InferenceProfileCache {
	fetcher: Box<dyn InferenceProfileFetcher>,
	cache: RegionTtlCache<HashMap<String, InferenceProfileInfo>>,
}

impl InferenceProfileCache {
	pub fn new(fetcher: Box<dyn InferenceProfileFetcher>, ttl: Duration) -> Self {
		Self { fetcher, cache: RegionTtlCache::new(ttl) }
	}

	async fn region_map(&self, region: &str) -> HashMap<String, InferenceProfileInfo> {
		if let Some(cached) = self.cache.get(region) {
			return cached;
		}
		match retry_with_backoff(|| self.fetcher.list_profile_ids(region)).await {
			Ok(ids) => {
				let map = aggregate(&ids);
				self.cache.put(region, map.clone());
				map
			},
			Err(_) => HashMap::new(),
		}
	}

	/// `None` only distinguishes "nothing cached, had to assume" from a
	/// concrete cached answer for callers that want to log the difference;
	/// [`Self::supports`] is the one the request path actually uses.
	pub async fn info_for(&self, region: &str, normalized_model: &str) -> Option<InferenceProfileInfo> {
		self.region_map(region).await.get(normalized_model).cloned()
	}

	pub async fn supports(&self, region: &str, normalized_model: &str, mode: CrossRegionMode) -> bool {
		let map = self.region_map(region).await;
		let info = map.get(normalized_model).cloned().unwrap_or_else(|| assume_supported(normalized_model));
		info.supports(mode)
	}

	/// The mode actually used for this request: `requested` if C11 says
	/// it's supported, else try global, then geographic, then regional,
	/// else regional (spec.md §4.7 step 3).
	pub async fn resolve_mode(
		&self,
		region: &str,
		normalized_model: &str,
		requested: CrossRegionMode,
	) -> CrossRegionMode {
		let map = self.region_map(region).await;
		let info = map.get(normalized_model).cloned().unwrap_or_else(|| assume_supported(normalized_model));
		if info.supports(requested) {
			return requested;
		}
		for candidate in [CrossRegionMode::Global, CrossRegionMode::Geographic, CrossRegionMode::Regional] {
			if info.supports(candidate) {
				return candidate;
			}
		}
		CrossRegionMode::Regional
	}
}

/// Unused by [`InferenceProfileInfo::supports`] directly but kept alongside
/// it since callers often want a dedup'd view of which prefixes exist.
pub fn geographic_prefixes(info: &InferenceProfileInfo) -> HashSet<&str> {
	info.geographic.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aggregate_groups_by_normalized_model() {
		let ids = vec![
			"us.anthropic.claude-opus-4-6-v1:0".to_string(),
			"eu.anthropic.claude-opus-4-6-v1:0".to_string(),
			"global.anthropic.claude-opus-4-6-v1:0".to_string(),
			"anthropic.claude-opus-4-6-v1:0".to_string(),
		];
		let map = aggregate(&ids);
		let info = map.get("claude-opus-4-6").unwrap();
		assert_eq!(info.geographic, vec!["eu".to_string(), "us".to_string()]);
		assert!(info.supports_global);
		assert!(info.supports_regional);
	}

	#[test]
	fn aggregate_only_global_leaves_geographic_empty() {
		let ids = vec!["global.anthropic.claude-opus-4-6-v1:0".to_string()];
		let map = aggregate(&ids);
		let info = map.get("claude-opus-4-6").unwrap();
		assert!(info.geographic.is_empty());
		assert!(info.supports_global);
		assert!(!info.supports_regional);
	}

	struct FakeFetcher(Vec<String>);

	#[async_trait]
	impl InferenceProfileFetcher for FakeFetcher {
		async fn list_profile_ids(&self, _region: &str) -> Result<Vec<String>, BedrockError> {
			Ok(self.0.clone())
		}
	}

	#[tokio::test]
	async fn geographic_fallback_scenario_from_spec() {
		// eu-central-1, mode geographic, claude-opus-4-6, only global supported.
		let fetcher = FakeFetcher(vec!["global.anthropic.claude-opus-4-6-v1:0".to_string()]);
		let cache = InferenceProfileCache::new(Box::new(fetcher), Duration::from_secs(60));
		let mode = cache.resolve_mode("eu-central-1", "claude-opus-4-6", CrossRegionMode::Geographic).await;
		assert_eq!(mode, CrossRegionMode::Global);
	}

	#[tokio::test]
	async fn unknown_model_assumes_supported() {
		let cache = InferenceProfileCache::new(Box::new(FakeFetcher(vec![])), Duration::from_secs(60));
		assert!(cache.supports("us-east-1", "claude-opus-4-6", CrossRegionMode::Geographic).await);
	}

	#[tokio::test]
	async fn resolve_mode_keeps_requested_when_supported() {
		let fetcher = FakeFetcher(vec!["anthropic.claude-opus-4-6-v1:0".to_string()]);
		let cache = InferenceProfileCache::new(Box::new(fetcher), Duration::from_secs(60));
		let mode = cache.resolve_mode("us-east-1", "claude-opus-4-6", CrossRegionMode::Regional).await;
		assert_eq!(mode, CrossRegionMode::Regional);
		let info = cache.info_for("us-east-1", "claude-opus-4-6").await.unwrap();
		assert!(info.supports_regional);
		assert!(!info.supports_global);
	}
}
