//! OpenAI-compatible provider (C7), spec.md §4.6: the one adapter that
//! actually translates shapes both ways instead of passing Anthropic JSON
//! through untouched. Kilo and OpenRouter are thin derivatives configured
//! through the same struct.
//!
//! Grounded on `conversion/messages.rs::from_completions::translate_stream`
//! for the incremental, stateful-closure-over-an-SSE-decoder shape (that
//! function translates the opposite direction — Anthropic events into
//! OpenAI chunks — but the state machine pattern, including folding usage
//! into a side channel as deltas arrive, is the same one generalized here).
//! Field-level mapping tables (`finish_reason`, cost-per-model) are plain
//! `serde_json::Value` manipulation rather than the teacher's fully typed
//! request/response structs, since this crate has no use for a general
//! OpenAI Chat Completions type model beyond these handful of fields.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{Provider, ProviderRequest, ProviderResponse, ResponseBody, UsageInfo};
use crate::account::{Account, TokenRefreshResult};
use crate::error::ProviderError;
use crate::sse::SseDecoder;
use crate::stream_util::{self, BodyStream};
use crate::{headers as header_util, model_map, ratelimit};

pub struct OpenAiCompatibleConfig {
	pub name: &'static str,
	pub default_endpoint: &'static str,
	pub map_path: fn(path: &str, endpoint: &str) -> String,
	pub stream_usage_cap_bytes: usize,
}

pub struct OpenAiCompatibleProvider {
	config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleProvider {
	pub fn new(config: OpenAiCompatibleConfig) -> Self {
		Self { config }
	}

	pub fn openai_compatible(stream_usage_cap_bytes: usize) -> Self {
		Self::new(OpenAiCompatibleConfig {
			name: "openai-compatible",
			default_endpoint: "https://api.openai.com",
			map_path: map_path_generic,
			stream_usage_cap_bytes,
		})
	}

	pub fn kilo(stream_usage_cap_bytes: usize) -> Self {
		Self::new(OpenAiCompatibleConfig {
			name: "kilo",
			default_endpoint: "https://api.kilo.ai/api/gateway",
			map_path: map_path_kilo,
			stream_usage_cap_bytes,
		})
	}

	pub fn openrouter(stream_usage_cap_bytes: usize) -> Self {
		Self::new(OpenAiCompatibleConfig {
			name: "openrouter",
			default_endpoint: "https://openrouter.ai/api",
			map_path: map_path_generic,
			stream_usage_cap_bytes,
		})
	}

	fn endpoint(&self, account: Option<&Account>) -> String {
		account
			.and_then(|a| a.custom_endpoint.as_deref())
			.filter(|e| url::Url::parse(e).is_ok())
			.unwrap_or(self.config.default_endpoint)
			.trim_end_matches('/')
			.to_string()
	}
}

fn map_path_generic(path: &str, endpoint: &str) -> String {
	if path == "/v1/messages" {
		if endpoint.ends_with("/v1") { "/v1/chat/completions".to_string() } else { "/chat/completions".to_string() }
	} else {
		path.to_string()
	}
}

fn map_path_kilo(path: &str, _endpoint: &str) -> String {
	if path == "/v1/messages" {
		"/chat/completions".to_string()
	} else {
		path.strip_prefix("/v1").unwrap_or(path).to_string()
	}
}

fn strip_beta_query(query: Option<&str>) -> Option<String> {
	let q = query?;
	let kept: Vec<&str> = q.split('&').filter(|kv| *kv != "beta=true").collect();
	if kept.is_empty() { None } else { Some(kept.join("&")) }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
	fn name(&self) -> &'static str {
		self.config.name
	}

	fn can_handle(&self, path: &str) -> bool {
		path != "/v1/messages/count_tokens" && !path.starts_with("/api/event_logging")
	}

	async fn refresh_token(
		&self,
		account: &Account,
		_client_id: &str,
	) -> Result<TokenRefreshResult, ProviderError> {
		let api_key = account.api_key.clone().ok_or(ProviderError::MissingCredentials(self.config.name))?;
		Ok(TokenRefreshResult { access_token: api_key, expires_at: i64::MAX, refresh_token: Some(String::new()) })
	}

	fn build_url(
		&self,
		request: &ProviderRequest,
		account: Option<&Account>,
	) -> Result<String, ProviderError> {
		let endpoint = self.endpoint(account);
		let mapped_path = (self.config.map_path)(&request.path, &endpoint);
		let mut url = format!("{endpoint}{mapped_path}");
		if let Some(q) = strip_beta_query(request.query.as_deref()) {
			url.push('?');
			url.push_str(&q);
		}
		Ok(url)
	}

	async fn prepare_headers(
		&self,
		request: &mut ProviderRequest,
		_resolved_url: &str,
		access_token: Option<&str>,
		_api_key: Option<&str>,
	) -> Result<(), ProviderError> {
		header_util::sanitize_client_headers(&mut request.headers, true);
		request.headers.remove("anthropic-version");
		request.headers.remove("anthropic-dangerous-direct-browser-access");
		if let Some(token) = access_token {
			header_util::set_bearer(&mut request.headers, token)?;
		}
		Ok(())
	}

	fn parse_rate_limit(&self, _headers: &HeaderMap, _status: StatusCode, _now_ms: i64) -> ratelimit::RateLimitInfo {
		// Upstream handles its own limiting in-band (spec.md §4.4 step 5).
		ratelimit::openai_compatible_never_limited()
	}

	async fn transform_request_body(
		&self,
		request: &mut ProviderRequest,
		account: Option<&Account>,
	) -> Result<(), ProviderError> {
		let anthropic: Value =
			serde_json::from_slice(&request.body).map_err(ProviderError::ResponseParsing)?;
		let openai = anthropic_to_openai_request(&anthropic, account);
		request.body = serde_json::to_vec(&openai).map_err(ProviderError::RequestMarshal)?.into();
		Ok(())
	}

	async fn process_response(
		&self,
		_request: &ProviderRequest,
		mut response: ProviderResponse,
		_account: Option<&Account>,
	) -> Result<ProviderResponse, ProviderError> {
		header_util::sanitize_response_headers(&mut response.headers);
		match response.body {
			ResponseBody::Buffered(bytes) => {
				let openai: Value = serde_json::from_slice(&bytes).map_err(ProviderError::ResponseParsing)?;
				let anthropic = openai_to_anthropic_response(&openai);
				let body = serde_json::to_vec(&anthropic).map_err(ProviderError::RequestMarshal)?;
				response.body = ResponseBody::Buffered(Bytes::from(body));
				Ok(response)
			},
			ResponseBody::Streaming(upstream) => {
				let transformed = transform_stream_to_client(upstream);
				let (client, accounting) = stream_util::tee(transformed);
				let usage_handle = Arc::new(Mutex::new(None));
				spawn_usage_collector(accounting, self.config.stream_usage_cap_bytes, usage_handle.clone());
				response.body = ResponseBody::Streaming(client);
				response.usage_handle = Some(usage_handle);
				Ok(response)
			},
		}
	}

	fn extract_usage_info(&self, body: &[u8], is_streaming: bool, _headers: &HeaderMap) -> Option<UsageInfo> {
		if is_streaming {
			// Non-streaming bodies only, per spec.md §4.6; streaming usage is
			// derived in `transform_stream_to_client`'s accounting side.
			return None;
		}
		let v: Value = serde_json::from_slice(body).ok()?;
		let usage = v.get("usage")?;
		let input_tokens = usage.get("prompt_tokens")?.as_u64().unwrap_or(0);
		let output_tokens = usage.get("completion_tokens")?.as_u64().unwrap_or(0);
		let model = v.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
		let cost = Some(estimate_cost(&model, input_tokens, output_tokens));
		Some(UsageInfo::from_counts(input_tokens, output_tokens, 0, 0, Some(model), cost))
	}
}

fn anthropic_to_openai_request(anthropic: &Value, account: Option<&Account>) -> Value {
	let mut messages = Vec::new();
	if let Some(system) = anthropic.get("system") {
		let text = flatten_content(system);
		if !text.is_empty() {
			messages.push(json!({"role": "system", "content": text}));
		}
	}
	if let Some(input_messages) = anthropic.get("messages").and_then(|m| m.as_array()) {
		for msg in input_messages {
			let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
			let content = msg.get("content").map(flatten_content).unwrap_or_default();
			messages.push(json!({"role": role, "content": content}));
		}
	}

	let client_model = anthropic.get("model").and_then(|m| m.as_str()).unwrap_or("");
	let account_mappings = account.map(|a| a.string_model_mappings());
	let static_map = model_map::openai_compatible_static_map();
	let model = model_map::resolve(client_model, account_mappings.as_ref(), &static_map);

	let mut body = json!({
		"model": model,
		"messages": messages,
	});
	copy_if_present(anthropic, &mut body, "max_tokens");
	copy_if_present(anthropic, &mut body, "temperature");
	copy_if_present(anthropic, &mut body, "top_p");
	copy_if_present(anthropic, &mut body, "stream");
	if let Some(stop) = anthropic.get("stop_sequences") {
		body["stop"] = stop.clone();
	}
	body
}

fn flatten_content(content: &Value) -> String {
	match content {
		Value::String(s) => s.clone(),
		Value::Array(blocks) => blocks
			.iter()
			.filter_map(|b| b.get("text").and_then(|t| t.as_str()))
			.collect::<Vec<_>>()
			.join(""),
		_ => String::new(),
	}
}

fn copy_if_present(src: &Value, dst: &mut Value, key: &str) {
	if let Some(v) = src.get(key) {
		dst[key] = v.clone();
	}
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
	match reason {
		Some("stop") => "end_turn",
		Some("length") => "max_tokens",
		Some("function_call") | Some("tool_calls") => "tool_use",
		Some("content_filter") => "stop_sequence",
		_ => "end_turn",
	}
}

fn openai_to_anthropic_response(openai: &Value) -> Value {
	let choice = openai.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());
	let text = choice
		.and_then(|c| c.get("message"))
		.and_then(|m| m.get("content"))
		.and_then(|c| c.as_str())
		.unwrap_or("")
		.to_string();
	let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|f| f.as_str());
	let usage = openai.get("usage");
	let input_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
	let output_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
	let id = openai
		.get("id")
		.and_then(|v| v.as_str())
		.map(|s| s.to_string())
		.unwrap_or_else(|| format!("msg_{}", chrono::Utc::now().timestamp_millis()));

	json!({
		"id": id,
		"type": "message",
		"role": "assistant",
		"model": openai.get("model").cloned().unwrap_or(Value::Null),
		"content": [{"type": "text", "text": text}],
		"stop_reason": map_finish_reason(finish_reason),
		"usage": {
			"input_tokens": input_tokens,
			"output_tokens": output_tokens,
		},
	})
}

/// Cost-per-model table, spec.md §4.6: a small built-in table keyed by
/// model prefix with a default of $0.001/1k input, $0.002/1k output.
fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
	let (input_per_1k, output_per_1k) = if model.starts_with("openai/gpt-5-mini") {
		(0.00025, 0.0005)
	} else if model.starts_with("openai/gpt-5") {
		(0.00125, 0.01)
	} else {
		(0.001, 0.002)
	};
	(input_tokens as f64 / 1000.0) * input_per_1k + (output_tokens as f64 / 1000.0) * output_per_1k
}

/// Rewrite an upstream OpenAI SSE byte stream into the Anthropic event
/// envelope, incrementally and without buffering the whole response
/// (spec.md §4.6). Parse errors on individual chunks are swallowed.
fn transform_stream_to_client(upstream: BodyStream) -> BodyStream {
	use futures_util::StreamExt;

	let state = Arc::new(Mutex::new(StreamState::default()));
	let out = async_stream::stream! {
		let mut upstream = upstream;
		let mut decoder = SseDecoder::new();
		while let Some(chunk) = upstream.next().await {
			let chunk = match chunk {
				Ok(b) => b,
				Err(e) => {
					yield Err(e);
					continue;
				},
			};
			decoder.push(&chunk);
			while let Some(ev) = decoder.next_event() {
				for out_chunk in handle_openai_event(&ev.data, &state) {
					yield Ok(out_chunk);
				}
			}
		}
		if let Some(ev) = decoder.flush() {
			for out_chunk in handle_openai_event(&ev.data, &state) {
				yield Ok(out_chunk);
			}
		}
	};
	stream_util::box_stream(out)
}

#[derive(Default)]
struct StreamState {
	message_started: bool,
	content_block_started: bool,
	output_text: String,
}

fn handle_openai_event(data: &str, state: &Arc<Mutex<StreamState>>) -> Vec<Bytes> {
	if data.trim() == "[DONE]" {
		let mut s = state.lock();
		let mut out = Vec::new();
		if s.content_block_started {
			out.push(sse_frame("content_block_stop", &json!({"type": "content_block_stop", "index": 0})));
		}
		let output_tokens = count_tokens(&s.output_text);
		out.push(sse_frame(
			"message_delta",
			&json!({
				"type": "message_delta",
				"delta": {"stop_reason": "end_turn", "stop_sequence": Value::Null},
				"usage": {"output_tokens": output_tokens},
			}),
		));
		out.push(sse_frame("message_stop", &json!({"type": "message_stop"})));
		s.output_text.clear();
		return out;
	}

	let Ok(v) = serde_json::from_str::<Value>(data) else {
		return Vec::new();
	};
	let mut out = Vec::new();
	let mut s = state.lock();

	if !s.message_started {
		s.message_started = true;
		let id = v.get("id").and_then(|i| i.as_str()).unwrap_or("unknown").to_string();
		let model = v.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
		out.push(sse_frame(
			"message_start",
			&json!({
				"type": "message_start",
				"message": {
					"id": id,
					"type": "message",
					"role": "assistant",
					"content": [],
					"model": model,
					"stop_reason": Value::Null,
					"stop_sequence": Value::Null,
					"usage": {"input_tokens": 0, "output_tokens": 0},
				},
			}),
		));
		out.push(sse_frame("ping", &json!({"type": "ping"})));
	}

	let delta_text =
		v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first()).and_then(|c| c.get("delta")).and_then(|d| d.get("content")).and_then(|t| t.as_str());

	if let Some(text) = delta_text.filter(|t| !t.is_empty()) {
		if !s.content_block_started {
			s.content_block_started = true;
			out.push(sse_frame(
				"content_block_start",
				&json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
			));
		}
		s.output_text.push_str(text);
		out.push(sse_frame(
			"content_block_delta",
			&json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
		));
	}

	out
}

fn sse_frame(event: &str, payload: &Value) -> Bytes {
	let body = format!("event: {event}\ndata: {}\n\n", payload);
	Bytes::from(body)
}

/// Drain the accounting side of the tee independently of the client and
/// record final usage once the rewritten Anthropic-shaped stream ends.
/// Input-token counts are not known from an OpenAI streaming response
/// (no `prompt_tokens` until the final, often-absent, usage chunk), so
/// this reports `input_tokens: 0`; output tokens come from our own
/// `message_delta` rewrite, which always carries a real count.
fn spawn_usage_collector(
	accounting: BodyStream,
	cap_bytes: usize,
	handle: Arc<Mutex<Option<UsageInfo>>>,
) {
	use futures_util::StreamExt;
	tokio::spawn(async move {
		let mut accounting = accounting;
		let mut chunks = Vec::new();
		let mut seen = 0usize;
		while let Some(chunk) = accounting.next().await {
			if let Ok(bytes) = chunk {
				seen += bytes.len();
				chunks.push(bytes);
				if seen >= cap_bytes {
					break;
				}
			}
		}
		if let Some(usage) = crate::usage::from_sse_bounded(chunks, cap_bytes) {
			*handle.lock() = Some(usage);
		}
	});
}

fn count_tokens(text: &str) -> u64 {
	tiktoken_rs::cl100k_base_singleton().encode_ordinary(text).len() as u64
}

#[cfg(test)]
mod tests {
	use futures_util::StreamExt;

	use super::*;

	#[test]
	fn maps_path_for_generic_openai_compatible() {
		assert_eq!(map_path_generic("/v1/messages", "https://example.com"), "/chat/completions");
		assert_eq!(map_path_generic("/v1/messages", "https://example.com/v1"), "/v1/chat/completions");
		assert_eq!(map_path_generic("/v1/models", "https://example.com"), "/v1/models");
	}

	#[test]
	fn kilo_strips_v1_from_other_paths() {
		assert_eq!(map_path_kilo("/v1/messages", ""), "/chat/completions");
		assert_eq!(map_path_kilo("/v1/models", ""), "/models");
	}

	#[test]
	fn strips_beta_query_param() {
		assert_eq!(strip_beta_query(Some("beta=true")), None);
		assert_eq!(strip_beta_query(Some("a=1&beta=true")), Some("a=1".to_string()));
	}

	#[test]
	fn request_translation_flattens_system_and_maps_model() {
		let anthropic = json!({
			"model": "claude-3-5-sonnet-20241022",
			"system": "be terse",
			"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
			"max_tokens": 100,
		});
		let openai = anthropic_to_openai_request(&anthropic, None);
		assert_eq!(openai["model"], "openai/gpt-5");
		assert_eq!(openai["messages"][0]["role"], "system");
		assert_eq!(openai["messages"][0]["content"], "be terse");
		assert_eq!(openai["messages"][1]["content"], "hi");
		assert_eq!(openai["max_tokens"], 100);
	}

	#[test]
	fn response_translation_maps_finish_reason_and_usage() {
		let openai = json!({
			"id": "chatcmpl-1",
			"model": "openai/gpt-5",
			"choices": [{"message": {"content": "hello"}, "finish_reason": "length"}],
			"usage": {"prompt_tokens": 3, "completion_tokens": 7},
		});
		let anthropic = openai_to_anthropic_response(&openai);
		assert_eq!(anthropic["content"][0]["text"], "hello");
		assert_eq!(anthropic["stop_reason"], "max_tokens");
		assert_eq!(anthropic["usage"]["input_tokens"], 3);
		assert_eq!(anthropic["usage"]["output_tokens"], 7);
	}

	#[tokio::test]
	async fn stream_rewrite_produces_anthropic_envelope() {
		let chunks: Vec<std::io::Result<Bytes>> = vec![
			Ok(Bytes::from_static(
				b"data: {\"id\":\"c1\",\"model\":\"openai/gpt-5\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
			)),
			Ok(Bytes::from_static(b"data: [DONE]\n\n")),
		];
		let upstream = stream_util::box_stream(tokio_stream::iter(chunks));
		let mut out = transform_stream_to_client(upstream);
		let mut collected = Vec::new();
		while let Some(chunk) = out.next().await {
			collected.push(chunk.unwrap());
		}
		let joined = collected.iter().map(|b| String::from_utf8_lossy(b)).collect::<Vec<_>>().join("");
		assert!(joined.contains("message_start"));
		assert!(joined.contains("content_block_start"));
		assert!(joined.contains("text_delta"));
		assert!(joined.contains("content_block_stop"));
		assert!(joined.contains("message_delta"));
		assert!(joined.contains("message_stop"));
	}
}
