//! Google Vertex AI provider (C7), spec.md §4.8: Claude models served
//! through Vertex's Anthropic publisher, addressed directly by model id
//! with no content reshaping (Vertex's `rawPredict`/`streamRawPredict`
//! already speak the Claude Messages wire format).
//!
//! Grounded on `ScriptSmith-hadrian`'s `providers/vertex/mod.rs` for ADC
//! token acquisition via `google-cloud-auth` (its `get_token` OAuth branch)
//! and its region-keyed base-URL construction, generalized from Gemini's
//! `generateContent`/`key=` query auth to Anthropic's
//! `rawPredict`/Bearer-token shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use google_cloud_token::TokenSourceProvider;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Provider, ProviderRequest, ProviderResponse, UsageInfo};
use crate::account::{Account, TokenRefreshResult};
use crate::error::{AuthError, ProviderError};
use crate::{headers as header_util, ratelimit, usage};

const VERTEX_AI_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const ANTHROPIC_VERTEX_VERSION: &str = "vertex-2023-10-16";

/// Refresh this far ahead of the assumed 1-hour Google OAuth token lifetime.
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
const TOKEN_ASSUMED_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// `claude-family-YYYYMMDD` (Anthropic's own naming) to
/// `claude-family@YYYYMMDD` (Vertex's publisher-model naming).
static DATED_MODEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)-(\d{8})$").expect("valid regex"));

struct CachedToken {
	token: String,
	expires_at: Instant,
}

#[derive(Debug, Clone)]
struct VertexEndpoint {
	project_id: String,
	region: String,
}

fn parse_endpoint(raw: &str) -> Result<VertexEndpoint, ProviderError> {
	let v: Value = serde_json::from_str(raw).map_err(|_| ProviderError::MissingCredentials("vertex-ai"))?;
	let project_id = v
		.get("projectId")
		.and_then(|p| p.as_str())
		.ok_or(ProviderError::MissingCredentials("vertex-ai"))?
		.to_string();
	let region = v
		.get("region")
		.and_then(|p| p.as_str())
		.ok_or(ProviderError::MissingCredentials("vertex-ai"))?
		.to_string();
	Ok(VertexEndpoint { project_id, region })
}

fn vertex_model_name(client_model: &str) -> String {
	match DATED_MODEL.captures(client_model) {
		Some(caps) => format!("{}@{}", &caps[1], &caps[2]),
		None => client_model.to_string(),
	}
}

pub struct VertexProvider {
	token_cache: Arc<RwLock<Option<CachedToken>>>,
	stream_usage_cap_bytes: usize,
}

impl VertexProvider {
	pub fn new(stream_usage_cap_bytes: usize) -> Self {
		Self { token_cache: Arc::new(RwLock::new(None)), stream_usage_cap_bytes }
	}

	fn endpoint(account: Option<&Account>) -> Result<VertexEndpoint, ProviderError> {
		let raw = account
			.and_then(|a| a.custom_endpoint.as_deref())
			.ok_or(ProviderError::MissingCredentials("vertex-ai"))?;
		parse_endpoint(raw)
	}

	fn base_url(region: &str) -> String {
		if region == "global" {
			"https://aiplatform.googleapis.com".to_string()
		} else {
			format!("https://{region}-aiplatform.googleapis.com")
		}
	}

	fn model_url(project_id: &str, region: &str, vertex_model: &str, streaming: bool) -> String {
		let base = Self::base_url(region);
		let op = if streaming { "streamRawPredict" } else { "rawPredict" };
		format!("{base}/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{vertex_model}:{op}")
	}

	fn is_streaming(request: &ProviderRequest, body: &Value) -> bool {
		if body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false) {
			return true;
		}
		request.path.contains("stream") || request.query.as_deref().is_some_and(|q| q.contains("stream=true"))
	}

	/// Google ADC access token (spec.md §4.8: "Google ADC chain; access
	/// tokens have 1-hour lifetime"), cached with a 5-minute refresh buffer
	/// the way `ScriptSmith-hadrian`'s Vertex provider caches its own.
	async fn access_token(&self) -> Result<String, ProviderError> {
		{
			let cache = self.token_cache.read().await;
			if let Some(cached) = cache.as_ref() {
				if cached.expires_at > Instant::now() + TOKEN_REFRESH_BUFFER {
					return Ok(cached.token.clone());
				}
			}
		}

		let config = google_cloud_auth::project::Config::default().with_scopes(&[VERTEX_AI_SCOPE]);
		let source = google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
			.await
			.map_err(|e| AuthError::NoCredentials(e.to_string()))?;
		let token = source
			.token_source()
			.token()
			.await
			.map_err(|e| AuthError::NoCredentials(e.to_string()))?;

		let mut cache = self.token_cache.write().await;
		*cache = Some(CachedToken { token: token.clone(), expires_at: Instant::now() + TOKEN_ASSUMED_LIFETIME });
		Ok(token)
	}
}

#[async_trait]
impl Provider for VertexProvider {
	fn name(&self) -> &'static str {
		"vertex-ai"
	}

	fn can_handle(&self, path: &str) -> bool {
		path.starts_with("/v1/messages")
	}

	async fn refresh_token(&self, account: &Account, _client_id: &str) -> Result<TokenRefreshResult, ProviderError> {
		Self::endpoint(Some(account))
			.map_err(|e| ProviderError::TokenRefreshFailed { account: account.id.clone(), message: e.to_string() })?;
		let access_token = self
			.access_token()
			.await
			.map_err(|e| ProviderError::TokenRefreshFailed { account: account.id.clone(), message: e.to_string() })?;
		Ok(TokenRefreshResult {
			access_token,
			expires_at: chrono::Utc::now().timestamp_millis() + TOKEN_ASSUMED_LIFETIME.as_millis() as i64,
			refresh_token: Some(String::new()),
		})
	}

	fn build_url(&self, request: &ProviderRequest, account: Option<&Account>) -> Result<String, ProviderError> {
		let endpoint = Self::endpoint(account)?;
		let vertex_model = request
			.provider_state
			.get("vertex.model")
			.cloned()
			.ok_or_else(|| ProviderError::MissingCredentials("vertex-ai"))?;
		let streaming = request.provider_state.get("vertex.stream").is_some_and(|s| s == "1");
		Ok(Self::model_url(&endpoint.project_id, &endpoint.region, &vertex_model, streaming))
	}

	async fn prepare_headers(
		&self,
		request: &mut ProviderRequest,
		_resolved_url: &str,
		access_token: Option<&str>,
		_api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		header_util::sanitize_client_headers(&mut request.headers, true);
		request.headers.remove("anthropic-beta");
		request.headers.remove("anthropic-version");
		if let Some(token) = access_token {
			header_util::set_bearer(&mut request.headers, token)?;
		}
		Ok(())
	}

	fn parse_rate_limit(&self, headers: &HeaderMap, status: StatusCode, now_ms: i64) -> ratelimit::RateLimitInfo {
		ratelimit::parse_unified(headers, status, now_ms)
	}

	async fn transform_request_body(
		&self,
		request: &mut ProviderRequest,
		_account: Option<&Account>,
	) -> Result<(), ProviderError> {
		let mut body: Value = serde_json::from_slice(&request.body).map_err(ProviderError::ResponseParsing)?;
		let client_model = body.get("model").and_then(|m| m.as_str()).unwrap_or_default().to_string();
		let streaming = Self::is_streaming(request, &body);
		let vertex_model = vertex_model_name(&client_model);

		if let Some(obj) = body.as_object_mut() {
			obj.remove("model");
			obj.insert("anthropic_version".to_string(), Value::String(ANTHROPIC_VERTEX_VERSION.to_string()));
		}
		request.body = serde_json::to_vec(&body).map_err(ProviderError::RequestMarshal)?.into();

		request.provider_state.insert("vertex.model".to_string(), vertex_model);
		request.provider_state.insert("vertex.stream".to_string(), if streaming { "1" } else { "0" }.to_string());
		request.provider_state.insert("vertex.client_model".to_string(), client_model);
		Ok(())
	}

	async fn process_response(
		&self,
		request: &ProviderRequest,
		mut response: ProviderResponse,
		_account: Option<&Account>,
	) -> Result<ProviderResponse, ProviderError> {
		header_util::sanitize_response_headers(&mut response.headers);
		let client_model = request.provider_state.get("vertex.client_model").cloned().unwrap_or_default();
		if client_model.is_empty() {
			return Ok(response);
		}

		match response.body {
			super::ResponseBody::Buffered(bytes) => {
				let mut v: Value = match serde_json::from_slice(&bytes) {
					Ok(v) => v,
					Err(_) => {
						response.body = super::ResponseBody::Buffered(bytes);
						return Ok(response);
					},
				};
				if let Some(obj) = v.as_object_mut() {
					obj.insert("model".to_string(), Value::String(client_model));
				}
				let body = serde_json::to_vec(&v).map_err(ProviderError::RequestMarshal)?;
				response.body = super::ResponseBody::Buffered(body.into());
				Ok(response)
			},
			super::ResponseBody::Streaming(upstream) => {
				let rewritten = restore_model_in_stream(upstream, client_model);
				response.body = super::ResponseBody::Streaming(rewritten);
				Ok(response)
			},
		}
	}

	fn extract_usage_info(&self, body: &[u8], is_streaming: bool, _headers: &HeaderMap) -> Option<UsageInfo> {
		if is_streaming {
			usage::from_sse_bounded(vec![bytes::Bytes::copy_from_slice(body)], self.stream_usage_cap_bytes)
		} else {
			usage::from_json(body)
		}
	}
}

/// Vertex's Anthropic publisher already emits Anthropic-shaped SSE, so the
/// only rewrite needed is swapping Vertex's dated `model` name back for the
/// client's original one; each `message_start` event repeats the model
/// field verbatim, so a plain byte substring replace per chunk is safe and
/// keeps the stream flowing without buffering it whole.
fn restore_model_in_stream(upstream: crate::stream_util::BodyStream, client_model: String) -> crate::stream_util::BodyStream {
	use futures_util::StreamExt;

	let vertex_model = vertex_model_name(&client_model);
	let needle = format!("\"model\":\"{vertex_model}\"");
	let replacement = format!("\"model\":\"{client_model}\"");

	crate::stream_util::box_stream(upstream.map(move |chunk| {
		chunk.map(|bytes| match std::str::from_utf8(&bytes) {
			Ok(text) if text.contains(&needle) => bytes::Bytes::from(text.replace(&needle, &replacement)),
			_ => bytes,
		})
	}))
}
