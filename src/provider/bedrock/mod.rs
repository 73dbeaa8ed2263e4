//! AWS Bedrock provider (C7), spec.md §4.7: resolves a Bedrock model id and
//! cross-region prefix, speaks the Converse API with SigV4-signed
//! requests, and translates between Claude Messages and Converse shapes.
//!
//! Grounded on `llm/mod.rs`'s `Provider` impls for the adapter shape and on
//! `ScriptSmith-hadrian`'s Bedrock provider for how the sub-caches and the
//! signer compose into one adapter; the submodules ([`cache_common`],
//! [`signing`], [`model_cache`], [`inference_profile`], [`transform`]) do
//! the actual work this file wires together.

pub mod cache_common;
pub mod inference_profile;
pub mod model_cache;
pub mod signing;
pub mod transform;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, CONTROLS};
use regex::Regex;
use serde_json::{json, Value};

use self::inference_profile::{HttpInferenceProfileFetcher, InferenceProfileCache};
use self::model_cache::{BedrockModelCache, HttpModelCatalogFetcher};
use self::signing::AwsRequestSigner;
use super::{Provider, ProviderRequest, ProviderResponse, ResponseBody, UsageInfo};
use crate::account::{Account, TokenRefreshResult};
use crate::config::Config;
use crate::error::{BedrockError, ProviderError, TranslatedStatus};
use crate::{headers as header_util, ratelimit, stream_util};

/// Reserved [`ProviderRequest::provider_state`] keys this adapter uses to
/// pass values resolved in `transform_request_body` on to `build_url`,
/// `prepare_headers`, and `process_response`. Private to this module: the
/// rest of the pipeline never reads or writes them.
const STATE_MODEL_ID: &str = "bedrock.model_id";
const STATE_STREAM: &str = "bedrock.stream";
const STATE_CLIENT_MODEL: &str = "bedrock.client_model";
const STATE_REGION: &str = "bedrock.region";
const STATE_PROFILE: &str = "bedrock.profile";

/// Bytes that must stay escaped in a Bedrock model id's URL path segment:
/// model ids carry a literal `:0` version suffix AWS itself percent-encodes
/// as `%3A0`. Alphanumerics, `.`, `-`, and `_` pass through unescaped.
const MODEL_ID_ENCODE_SET: &AsciiSet = &CONTROLS
	.add(b':')
	.add(b'/')
	.add(b'?')
	.add(b'#')
	.add(b'[')
	.add(b']')
	.add(b'@')
	.add(b'!')
	.add(b'$')
	.add(b'&')
	.add(b'\'')
	.add(b'(')
	.add(b')')
	.add(b'*')
	.add(b'+')
	.add(b',')
	.add(b';')
	.add(b'=')
	.add(b'%')
	.add(b' ');

static USAGE_FIELDS: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#""inputTokens"\s*:\s*(\d+).*?"outputTokens"\s*:\s*(\d+)"#).expect("valid regex"));

pub struct BedrockProvider {
	http: reqwest::Client,
	model_cache: Arc<BedrockModelCache>,
	inference_profile_cache: Arc<InferenceProfileCache>,
	stream_usage_cap_bytes: usize,
}

impl BedrockProvider {
	pub fn new(http: reqwest::Client, config: &Config) -> Self {
		let model_cache = Arc::new(BedrockModelCache::new(
			Box::new(HttpModelCatalogFetcher::new(http.clone())),
			config.bedrock_model_cache_ttl(),
		));
		let inference_profile_cache = Arc::new(InferenceProfileCache::new(
			Box::new(HttpInferenceProfileFetcher::new(http.clone())),
			config.bedrock_inference_profile_cache_ttl(),
		));
		Self { http, model_cache, inference_profile_cache, stream_usage_cap_bytes: config.stream_usage_cap_bytes }
	}

	fn endpoint(account: Option<&Account>) -> Result<signing::BedrockEndpoint, ProviderError> {
		let raw = account
			.and_then(|a| a.custom_endpoint.as_deref())
			.ok_or(ProviderError::MissingCredentials("bedrock"))?;
		Ok(signing::parse_custom_endpoint(raw)?)
	}

	fn runtime_url(region: &str, model_id: &str, streaming: bool) -> String {
		let encoded = percent_encoding::utf8_percent_encode(model_id, MODEL_ID_ENCODE_SET);
		let op = if streaming { "converse-stream" } else { "converse" };
		format!("https://bedrock-runtime.{region}.amazonaws.com/model/{encoded}/{op}")
	}

	fn state<'a>(request: &'a ProviderRequest, key: &str) -> Result<&'a str, ProviderError> {
		request
			.provider_state
			.get(key)
			.map(String::as_str)
			.ok_or_else(|| ProviderError::Bedrock(BedrockError::Sdk(format!("missing resolved {key}"))))
	}

	async fn invoke(
		&self,
		region: &str,
		profile: Option<&str>,
		model_id: &str,
		streaming: bool,
		body: &[u8],
	) -> Result<reqwest::Response, ProviderError> {
		let url = Self::runtime_url(region, model_id, streaming);
		let signer = AwsRequestSigner::new(profile.map(str::to_string), region);
		let signed = signer.sign_request("POST", &url, &[("content-type", "application/json")], body).await?;
		let mut builder = self.http.post(&url).header("content-type", "application/json");
		for (name, value) in &signed {
			builder = builder.header(name, value);
		}
		builder.body(body.to_vec()).send().await.map_err(|e| ProviderError::Bedrock(BedrockError::Sdk(e.to_string())))
	}
}

#[async_trait]
impl Provider for BedrockProvider {
	fn name(&self) -> &'static str {
		"bedrock"
	}

	fn can_handle(&self, path: &str) -> bool {
		path.starts_with("/v1/messages")
	}

	async fn refresh_token(
		&self,
		account: &Account,
		_client_id: &str,
	) -> Result<TokenRefreshResult, ProviderError> {
		let endpoint = Self::endpoint(Some(account))
			.map_err(|e| ProviderError::TokenRefreshFailed { account: account.id.clone(), message: e.to_string() })?;
		let signer = AwsRequestSigner::new(endpoint.profile, endpoint.region);
		signer
			.validate()
			.await
			.map_err(|e| ProviderError::TokenRefreshFailed { account: account.id.clone(), message: e.to_string() })?;
		// Credentials are resolved fresh per request (spec.md §4.7); this
		// placeholder only satisfies the host's "has a live token" check.
		Ok(TokenRefreshResult {
			access_token: "bedrock-sigv4".to_string(),
			expires_at: i64::MAX,
			refresh_token: Some(String::new()),
		})
	}

	fn build_url(&self, request: &ProviderRequest, _account: Option<&Account>) -> Result<String, ProviderError> {
		let region = Self::state(request, STATE_REGION)?;
		let model_id = Self::state(request, STATE_MODEL_ID)?;
		let streaming = Self::state(request, STATE_STREAM)? == "1";
		Ok(Self::runtime_url(region, model_id, streaming))
	}

	async fn prepare_headers(
		&self,
		request: &mut ProviderRequest,
		resolved_url: &str,
		_access_token: Option<&str>,
		_api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		header_util::sanitize_client_headers(&mut request.headers, true);
		request.headers.remove("anthropic-version");
		request.headers.remove("anthropic-beta");
		request.headers.remove("anthropic-dangerous-direct-browser-access");
		request.headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/json"));

		let region = Self::state(request, STATE_REGION)?.to_string();
		let profile = request.provider_state.get(STATE_PROFILE).cloned();
		let signer = AwsRequestSigner::new(profile, region);
		let signed =
			signer.sign_request("POST", resolved_url, &[("content-type", "application/json")], &request.body).await?;
		for (name, value) in signed {
			let name = http::HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
			let value = http::HeaderValue::from_str(&value).map_err(http::Error::from)?;
			request.headers.insert(name, value);
		}
		Ok(())
	}

	fn parse_rate_limit(&self, headers: &HeaderMap, status: StatusCode, now_ms: i64) -> ratelimit::RateLimitInfo {
		ratelimit::parse_unified(headers, status, now_ms)
	}

	async fn transform_request_body(
		&self,
		request: &mut ProviderRequest,
		account: Option<&Account>,
	) -> Result<(), ProviderError> {
		let body: Value = serde_json::from_slice(&request.body).map_err(ProviderError::ResponseParsing)?;
		let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
		let client_model = body.get("model").and_then(|m| m.as_str()).unwrap_or_default().to_string();

		let endpoint = Self::endpoint(account)?;

		let resolved_model = match account.and_then(|a| a.bedrock_custom_model()) {
			Some(custom) => custom,
			None => self.model_cache.resolve(&client_model, &endpoint.region).await,
		};
		let normalized = model_cache::normalize(&resolved_model);
		let requested_mode = account.map(|a| a.cross_region_mode).unwrap_or_default();
		let resolved_mode =
			self.inference_profile_cache.resolve_mode(&endpoint.region, &normalized, requested_mode).await;
		let prefixed_model = transform::apply_prefix(resolved_mode, &endpoint.region, &resolved_model);

		let converse = transform::anthropic_to_converse(&body)?;
		request.body = serde_json::to_vec(&converse).map_err(ProviderError::RequestMarshal)?.into();

		request.provider_state.insert(STATE_MODEL_ID.to_string(), prefixed_model);
		request.provider_state.insert(STATE_STREAM.to_string(), if streaming { "1" } else { "0" }.to_string());
		request.provider_state.insert(STATE_CLIENT_MODEL.to_string(), client_model);
		request.provider_state.insert(STATE_REGION.to_string(), endpoint.region);
		if let Some(profile) = endpoint.profile {
			request.provider_state.insert(STATE_PROFILE.to_string(), profile);
		}
		Ok(())
	}

	async fn process_response(
		&self,
		request: &ProviderRequest,
		mut response: ProviderResponse,
		_account: Option<&Account>,
	) -> Result<ProviderResponse, ProviderError> {
		header_util::sanitize_response_headers(&mut response.headers);
		let client_model = Self::state(request, STATE_CLIENT_MODEL).map(str::to_string).unwrap_or_default();

		if !response.status.is_success() {
			return self.translate_error_response(request, response, &client_model).await;
		}

		match response.body {
			ResponseBody::Buffered(bytes) => {
				let converse: Value = serde_json::from_slice(&bytes).map_err(ProviderError::ResponseParsing)?;
				let anthropic = transform::converse_to_anthropic(&converse, &client_model);
				let body = serde_json::to_vec(&anthropic).map_err(ProviderError::RequestMarshal)?;
				response.body = ResponseBody::Buffered(Bytes::from(body));
				Ok(response)
			},
			ResponseBody::Streaming(upstream) => {
				// Bedrock's streaming wire format is AWS's own
				// vnd.amazon.eventstream framing, not Anthropic SSE; spec.md
				// §4.7 forwards it unchanged and extracts usage separately.
				let (client, accounting) = stream_util::tee(upstream);
				let usage_handle = Arc::new(Mutex::new(None));
				spawn_eventstream_usage_collector(
					accounting,
					self.stream_usage_cap_bytes,
					client_model.clone(),
					usage_handle.clone(),
				);
				response.body = ResponseBody::Streaming(client);
				response.usage_handle = Some(usage_handle);
				Ok(response)
			},
		}
	}

	fn extract_usage_info(&self, body: &[u8], is_streaming: bool, _headers: &HeaderMap) -> Option<UsageInfo> {
		if is_streaming {
			// Derived from the tee'd accounting stream in `process_response`.
			return None;
		}
		crate::usage::from_json(body)
	}
}

impl BedrockProvider {
	/// Non-2xx upstream responses (spec.md §4.7 error table). A streaming
	/// request whose Converse command was rejected specifically for not
	/// supporting streaming gets one retry against the non-streaming
	/// command before translating whatever comes back.
	async fn translate_error_response(
		&self,
		request: &ProviderRequest,
		response: ProviderResponse,
		client_model: &str,
	) -> Result<ProviderResponse, ProviderError> {
		let status = response.status;
		let headers = response.headers.clone();
		let bytes = match response.body {
			ResponseBody::Buffered(b) => b,
			ResponseBody::Streaming(mut s) => {
				let mut buf = Vec::new();
				while let Some(chunk) = s.next().await {
					if let Ok(b) = chunk {
						buf.extend_from_slice(&b);
					}
				}
				Bytes::from(buf)
			},
		};

		let error_type = aws_error_type(&headers, &bytes);
		let message = error_message(&bytes).unwrap_or_else(|| error_type.clone());

		let streaming = Self::state(request, STATE_STREAM).map(|s| s == "1").unwrap_or(false);
		if streaming && transform::is_streaming_unsupported(&message) {
			if let Ok(retried) = self.retry_non_streaming(request).await {
				return Ok(retried);
			}
		}

		let translated = transform::translate_error(&error_type);
		let mut error_message = message;
		if translated == TranslatedStatus::NotFound {
			let region = Self::state(request, STATE_REGION).unwrap_or_default();
			let catalog = self.model_cache.models_for(region).await;
			if let Some(suggestion) = transform::did_you_mean(client_model, &catalog) {
				error_message = format!("{error_message} (did you mean \"{suggestion}\"?)");
			}
		}

		let body = json!({
			"type": "error",
			"error": {"type": error_type_label(translated), "message": error_message},
		});
		Ok(ProviderResponse {
			status: StatusCode::from_u16(translated.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			headers: HeaderMap::new(),
			body: ResponseBody::Buffered(Bytes::from(serde_json::to_vec(&body).map_err(ProviderError::RequestMarshal)?)),
			usage_handle: None,
		})
	}

	async fn retry_non_streaming(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
		let region = Self::state(request, STATE_REGION)?;
		let model_id = Self::state(request, STATE_MODEL_ID)?;
		let profile = request.provider_state.get(STATE_PROFILE).map(String::as_str);
		let client_model = Self::state(request, STATE_CLIENT_MODEL)?;

		let resp = self.invoke(region, profile, model_id, false, &request.body).await?;
		let status = resp.status();
		let bytes = resp.bytes().await.map_err(|e| ProviderError::Bedrock(BedrockError::Sdk(e.to_string())))?;
		if !status.is_success() {
			return Err(ProviderError::Bedrock(BedrockError::Sdk(format!(
				"non-streaming retry also failed: {status}"
			))));
		}
		let converse: Value = serde_json::from_slice(&bytes).map_err(ProviderError::ResponseParsing)?;
		let anthropic = transform::converse_to_anthropic(&converse, client_model);
		let body = serde_json::to_vec(&anthropic).map_err(ProviderError::RequestMarshal)?;
		Ok(ProviderResponse::new(StatusCode::OK, HeaderMap::new(), ResponseBody::Buffered(Bytes::from(body))))
	}
}

fn aws_error_type(headers: &HeaderMap, body: &[u8]) -> String {
	if let Some(v) = headers.get("x-amzn-errortype").and_then(|v| v.to_str().ok()) {
		return v.split(':').next().unwrap_or(v).to_string();
	}
	if let Ok(v) = serde_json::from_slice::<Value>(body) {
		if let Some(t) = v.get("__type").and_then(|t| t.as_str()) {
			return t.rsplit('#').next().unwrap_or(t).to_string();
		}
	}
	String::from_utf8_lossy(body).to_string()
}

fn error_message(body: &[u8]) -> Option<String> {
	let v: Value = serde_json::from_slice(body).ok()?;
	v.get("message").and_then(|m| m.as_str()).map(str::to_string)
}

fn error_type_label(status: TranslatedStatus) -> &'static str {
	match status {
		TranslatedStatus::BadRequest => "invalid_request_error",
		TranslatedStatus::Forbidden => "permission_error",
		TranslatedStatus::NotFound => "not_found_error",
		TranslatedStatus::TooManyRequests => "rate_limit_error",
		TranslatedStatus::ServiceUnavailable => "overloaded_error",
		TranslatedStatus::InternalServerError => "api_error",
	}
}

/// Drains the accounting side of the tee independently of the client and
/// scans the raw eventstream bytes for the Converse metadata event's
/// `usage.{inputTokens,outputTokens}` fields (spec.md §4.7: "usage is
/// extracted from the final event... in a separate reader"). The binary
/// eventstream framing carries its payload as embedded UTF-8 JSON, so a
/// bounded regex scan finds it without a full frame decoder.
fn spawn_eventstream_usage_collector(
	accounting: stream_util::BodyStream,
	cap_bytes: usize,
	client_model: String,
	handle: Arc<Mutex<Option<UsageInfo>>>,
) {
	tokio::spawn(async move {
		let mut accounting = accounting;
		let mut buf = Vec::new();
		while let Some(chunk) = accounting.next().await {
			if let Ok(bytes) = chunk {
				if buf.len() < cap_bytes {
					buf.extend_from_slice(&bytes);
				}
			}
		}
		if let Some(usage) = usage_from_eventstream_bytes(&buf, client_model) {
			*handle.lock() = Some(usage);
		}
	});
}

fn usage_from_eventstream_bytes(buf: &[u8], client_model: String) -> Option<UsageInfo> {
	let text = String::from_utf8_lossy(buf);
	let caps = USAGE_FIELDS.captures(&text)?;
	Some(UsageInfo::from_counts(
		caps.get(1)?.as_str().parse().ok()?,
		caps.get(2)?.as_str().parse().ok()?,
		0,
		0,
		Some(client_model),
		None,
	))
}
