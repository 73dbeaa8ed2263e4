//! Config collaborator interface (spec.md §6): OAuth client id, byte caps,
//! timeouts, polling intervals. Layered env-override-over-default the way
//! the teacher's `RawConfig` layers its settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_STREAM_USAGE_CAP_BYTES: usize = 100 * 1024;
const DEFAULT_STREAM_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STREAM_OPERATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BEDROCK_CACHE_TTL_HOURS: u64 = 6;
const DEFAULT_USAGE_POLLING_INTERVAL_MS: u64 = 90_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub anthropic_client_id: String,
	pub stream_usage_cap_bytes: usize,
	pub stream_read_timeout_ms: u64,
	pub stream_operation_timeout_ms: u64,
	pub bedrock_model_cache_ttl_hours: u64,
	pub bedrock_inference_profile_cache_ttl_hours: u64,
	pub usage_polling_interval_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			// Anthropic's public first-party CLI OAuth client id.
			anthropic_client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
			stream_usage_cap_bytes: DEFAULT_STREAM_USAGE_CAP_BYTES,
			stream_read_timeout_ms: DEFAULT_STREAM_READ_TIMEOUT_MS,
			stream_operation_timeout_ms: DEFAULT_STREAM_OPERATION_TIMEOUT_MS,
			bedrock_model_cache_ttl_hours: DEFAULT_BEDROCK_CACHE_TTL_HOURS,
			bedrock_inference_profile_cache_ttl_hours: DEFAULT_BEDROCK_CACHE_TTL_HOURS,
			usage_polling_interval_ms: DEFAULT_USAGE_POLLING_INTERVAL_MS,
		}
	}
}

impl Config {
	/// Apply the two documented environment-variable overrides
	/// (spec.md §6) on top of whatever was already set.
	pub fn with_env_overrides(mut self) -> Self {
		if let Some(hours) = env_u64("BEDROCK_MODEL_CACHE_TTL_HOURS") {
			self.bedrock_model_cache_ttl_hours = hours;
		}
		if let Some(hours) = env_u64("BEDROCK_INFERENCE_PROFILE_CACHE_TTL_HOURS") {
			self.bedrock_inference_profile_cache_ttl_hours = hours;
		}
		self
	}

	pub fn stream_read_timeout(&self) -> Duration {
		Duration::from_millis(self.stream_read_timeout_ms)
	}

	pub fn stream_operation_timeout(&self) -> Duration {
		Duration::from_millis(self.stream_operation_timeout_ms)
	}

	pub fn usage_polling_interval(&self) -> Duration {
		Duration::from_millis(self.usage_polling_interval_ms)
	}

	pub fn bedrock_model_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.bedrock_model_cache_ttl_hours * 3600)
	}

	pub fn bedrock_inference_profile_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.bedrock_inference_profile_cache_ttl_hours * 3600)
	}
}

fn env_u64(name: &str) -> Option<u64> {
	std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let c = Config::default();
		assert_eq!(c.stream_usage_cap_bytes, 100 * 1024);
		assert_eq!(c.bedrock_model_cache_ttl_hours, 6);
		assert_eq!(c.usage_polling_interval_ms, 90_000);
	}

	#[test]
	fn env_override_takes_precedence() {
		// SAFETY: single-threaded test process env mutation, restored after.
		unsafe {
			std::env::set_var("BEDROCK_MODEL_CACHE_TTL_HOURS", "12");
		}
		let c = Config::default().with_env_overrides();
		assert_eq!(c.bedrock_model_cache_ttl_hours, 12);
		unsafe {
			std::env::remove_var("BEDROCK_MODEL_CACHE_TTL_HOURS");
		}
	}
}
