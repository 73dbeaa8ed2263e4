//! Claude Messages <-> Bedrock Converse transform, cross-region prefix
//! derivation, and upstream error translation (C12), spec.md §4.7 steps
//! 3-4 and the response/error-translation tables.
//!
//! Grounded on `conversion/messages.rs` for the shape of a
//! Value-to-Value request/response translator (kept here as
//! `serde_json::Value` manipulation rather than the teacher's fully typed
//! Converse structs, since this crate's Bedrock scope is text-only
//! messages with no tool calls or image content).

use serde_json::{json, Value};

use crate::account::CrossRegionMode;
use crate::error::{BedrockError, TranslatedStatus};

/// `geographic` mode's region -> prefix table, spec.md §4.7 step 3.
pub fn geographic_prefix_for_region(region: &str) -> &'static str {
	if region.starts_with("eu-") {
		"eu"
	} else if region.starts_with("ca-") {
		"ca"
	} else if region == "ap-northeast-1" || region == "ap-northeast-3" {
		"jp"
	} else if region == "ap-southeast-2" || region == "ap-southeast-4" {
		"au"
	} else if region.starts_with("ap-") || region.starts_with("me-") {
		"apac"
	} else {
		"us"
	}
}

/// Applies the resolved cross-region mode's prefix to a bare Bedrock model
/// id, spec.md §4.7 step 3.
pub fn apply_prefix(mode: CrossRegionMode, region: &str, model_id: &str) -> String {
	match mode {
		CrossRegionMode::Global => format!("global.{model_id}"),
		CrossRegionMode::Geographic => format!("{}.{model_id}", geographic_prefix_for_region(region)),
		CrossRegionMode::Regional => model_id.to_string(),
	}
}

/// Flattens Anthropic message/system content (string or array of
/// `{type:"text",text}` blocks) into trimmed, non-empty text pieces.
fn flatten_text_blocks(content: &Value) -> Vec<String> {
	match content {
		Value::String(s) => {
			let trimmed = s.trim();
			if trimmed.is_empty() {
				vec![]
			} else {
				vec![trimmed.to_string()]
			}
		},
		Value::Array(blocks) => blocks
			.iter()
			.filter_map(|b| b.get("text").and_then(|t| t.as_str()))
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.map(str::to_string)
			.collect(),
		_ => vec![],
	}
}

/// Claude Messages -> Converse `{messages, system, inferenceConfig}`,
/// spec.md §4.7 step 4. Errs with [`BedrockError::EmptyMessages`] if no
/// message has any non-empty text content after flattening.
pub fn anthropic_to_converse(body: &Value) -> Result<Value, BedrockError> {
	let messages: Vec<Value> = body
		.get("messages")
		.and_then(|m| m.as_array())
		.into_iter()
		.flatten()
		.filter_map(|msg| {
			let role = msg.get("role")?.as_str()?.to_string();
			let texts = flatten_text_blocks(msg.get("content")?);
			if texts.is_empty() {
				return None;
			}
			Some(json!({
				"role": role,
				"content": texts.into_iter().map(|t| json!({"text": t})).collect::<Vec<_>>(),
			}))
		})
		.collect();
	if messages.is_empty() {
		return Err(BedrockError::EmptyMessages);
	}

	let mut converse = json!({ "messages": messages });

	if let Some(system) = body.get("system") {
		let texts = flatten_text_blocks(system);
		if !texts.is_empty() {
			converse["system"] = json!(texts.into_iter().map(|t| json!({"text": t})).collect::<Vec<_>>());
		}
	}

	let mut inference_config = serde_json::Map::new();
	if let Some(v) = body.get("max_tokens") {
		inference_config.insert("maxTokens".into(), v.clone());
	}
	if let Some(v) = body.get("temperature") {
		inference_config.insert("temperature".into(), v.clone());
	}
	if let Some(v) = body.get("top_p") {
		inference_config.insert("topP".into(), v.clone());
	}
	if let Some(v) = body.get("stop_sequences") {
		inference_config.insert("stopSequences".into(), v.clone());
	}
	if !inference_config.is_empty() {
		converse["inferenceConfig"] = Value::Object(inference_config);
	}

	if body.get("top_k").is_some() {
		tracing::warn!("bedrock: top_k has no Converse equivalent, dropping");
	}
	if body.get("metadata").is_some() {
		tracing::warn!("bedrock: metadata has no Converse equivalent, dropping");
	}

	Ok(converse)
}

/// Converse response -> Anthropic message envelope, spec.md §4.7 response
/// transform. `content` is mapped 1:1 (`{text}` -> `{type:"text",text}`).
pub fn converse_to_anthropic(converse: &Value, model: &str) -> Value {
	let content = converse
		.pointer("/output/message/content")
		.and_then(|c| c.as_array())
		.into_iter()
		.flatten()
		.filter_map(|block| block.get("text").and_then(|t| t.as_str()))
		.map(|text| json!({"type": "text", "text": text}))
		.collect::<Vec<_>>();

	json!({
		"id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
		"type": "message",
		"role": "assistant",
		"content": content,
		"model": model,
		"stop_reason": converse.get("stopReason").cloned().unwrap_or(Value::Null),
		"usage": {
			"input_tokens": converse.pointer("/usage/inputTokens").and_then(|v| v.as_u64()).unwrap_or(0),
			"output_tokens": converse.pointer("/usage/outputTokens").and_then(|v| v.as_u64()).unwrap_or(0),
		},
	})
}

/// Case-insensitive match of a Bedrock error type (`__type`, PascalCase or
/// camelCase) to the client status it should surface as, spec.md §4.7
/// error-translation table.
pub fn translate_error(error_type: &str) -> TranslatedStatus {
	let lowered = error_type.to_lowercase();
	if ["invalidaccesskeyid", "signaturedoesnotmatch", "expiredtoken", "invalidclienttokenid", "unrecognizedclientexception"]
		.iter()
		.any(|needle| lowered.contains(needle))
	{
		TranslatedStatus::Forbidden
	} else if lowered.contains("throttling") {
		TranslatedStatus::TooManyRequests
	} else if lowered.contains("serviceunavailable") || lowered.contains("internalserver") {
		TranslatedStatus::ServiceUnavailable
	} else if lowered.contains("resourcenotfound") {
		TranslatedStatus::NotFound
	} else if lowered.contains("validation") {
		TranslatedStatus::BadRequest
	} else {
		TranslatedStatus::InternalServerError
	}
}

/// A "did you mean?" suggestion for a `ResourceNotFound` error, using the
/// same fuzzy-match scoring C10 uses for model resolution.
pub fn did_you_mean(client_model: &str, catalog: &[super::model_cache::BedrockModel]) -> Option<String> {
	super::model_cache::fuzzy_match(client_model, catalog).map(|m| m.model_id.clone())
}

/// Does a streaming-validation error mention "streaming" (spec.md §4.7
/// step 5's automatic-fallback trigger)?
pub fn is_streaming_unsupported(message: &str) -> bool {
	message.to_lowercase().contains("streaming")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn geographic_prefix_table_matches_spec() {
		assert_eq!(geographic_prefix_for_region("eu-central-1"), "eu");
		assert_eq!(geographic_prefix_for_region("ca-central-1"), "ca");
		assert_eq!(geographic_prefix_for_region("ap-northeast-1"), "jp");
		assert_eq!(geographic_prefix_for_region("ap-northeast-3"), "jp");
		assert_eq!(geographic_prefix_for_region("ap-southeast-2"), "au");
		assert_eq!(geographic_prefix_for_region("ap-southeast-4"), "au");
		assert_eq!(geographic_prefix_for_region("ap-south-1"), "apac");
		assert_eq!(geographic_prefix_for_region("me-south-1"), "apac");
		assert_eq!(geographic_prefix_for_region("us-west-2"), "us");
	}

	#[test]
	fn apply_prefix_scenario_from_spec() {
		// eu-central-1 / geographic requested but globally fallen back.
		let url = apply_prefix(CrossRegionMode::Global, "eu-central-1", "anthropic.claude-opus-4-6-v1:0");
		assert_eq!(url, "global.anthropic.claude-opus-4-6-v1:0");
	}

	#[test]
	fn messages_flatten_and_drop_empties() {
		let body = json!({
			"messages": [
				{"role": "user", "content": "  hello  "},
				{"role": "assistant", "content": [{"type": "text", "text": "  "}]},
				{"role": "user", "content": [{"type": "text", "text": "world"}]},
			]
		});
		let converse = anthropic_to_converse(&body).unwrap();
		let messages = converse["messages"].as_array().unwrap();
		assert_eq!(messages.len(), 2);
		assert_eq!(messages[0]["content"][0]["text"], "hello");
		assert_eq!(messages[1]["content"][0]["text"], "world");
	}

	#[test]
	fn all_empty_messages_is_an_error() {
		let body = json!({"messages": [{"role": "user", "content": "   "}]});
		assert!(matches!(anthropic_to_converse(&body), Err(BedrockError::EmptyMessages)));
	}

	#[test]
	fn system_string_becomes_text_block_array() {
		let body = json!({
			"messages": [{"role": "user", "content": "hi"}],
			"system": "be terse",
		});
		let converse = anthropic_to_converse(&body).unwrap();
		assert_eq!(converse["system"], json!([{"text": "be terse"}]));
	}

	#[test]
	fn inference_config_maps_renamed_fields() {
		let body = json!({
			"messages": [{"role": "user", "content": "hi"}],
			"max_tokens": 512,
			"temperature": 0.5,
			"top_p": 0.9,
			"stop_sequences": ["STOP"],
		});
		let converse = anthropic_to_converse(&body).unwrap();
		assert_eq!(converse["inferenceConfig"]["maxTokens"], 512);
		assert_eq!(converse["inferenceConfig"]["topP"], 0.9);
		assert_eq!(converse["inferenceConfig"]["stopSequences"], json!(["STOP"]));
	}

	#[test]
	fn converse_response_maps_to_anthropic_envelope() {
		let converse = json!({
			"output": {"message": {"content": [{"text": "hi there"}]}},
			"stopReason": "end_turn",
			"usage": {"inputTokens": 10, "outputTokens": 4},
		});
		let anthropic = converse_to_anthropic(&converse, "claude-opus-4-6");
		assert_eq!(anthropic["content"], json!([{"type": "text", "text": "hi there"}]));
		assert_eq!(anthropic["stop_reason"], "end_turn");
		assert_eq!(anthropic["usage"]["input_tokens"], 10);
		assert_eq!(anthropic["usage"]["output_tokens"], 4);
	}

	#[test]
	fn error_translation_table_matches_spec() {
		assert_eq!(translate_error("InvalidAccessKeyId"), TranslatedStatus::Forbidden);
		assert_eq!(translate_error("signatureDoesNotMatch"), TranslatedStatus::Forbidden);
		assert_eq!(translate_error("ThrottlingException"), TranslatedStatus::TooManyRequests);
		assert_eq!(translate_error("ServiceUnavailableException"), TranslatedStatus::ServiceUnavailable);
		assert_eq!(translate_error("InternalServerException"), TranslatedStatus::ServiceUnavailable);
		assert_eq!(translate_error("ResourceNotFoundException"), TranslatedStatus::NotFound);
		assert_eq!(translate_error("ValidationException"), TranslatedStatus::BadRequest);
		assert_eq!(translate_error("SomethingWeirdException"), TranslatedStatus::InternalServerError);
	}

	#[test]
	fn streaming_unsupported_detection_is_case_insensitive() {
		assert!(is_streaming_unsupported("This model does not support STREAMING responses"));
		assert!(!is_streaming_unsupported("totally unrelated validation failure"));
	}
}
