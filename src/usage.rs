//! Anthropic-format usage extraction (C5), shared by the Anthropic adapter
//! and the Anthropic-compatible family (z.ai, Minimax, NanoGPT): identical
//! event schema per spec.md §4.5.
//!
//! Grounded on the teacher's `llm/anthropic.rs` usage-merging logic
//! (`message_start` seeds counts, `message_delta` overrides them) and the
//! byte-capped scan pattern in `llm/mod.rs`'s streaming usage collector.

use serde_json::Value;

use crate::provider::UsageInfo;
use crate::sse::SseDecoder;

/// Read `usage.{input_tokens, output_tokens, cache_creation_input_tokens,
/// cache_read_input_tokens}` and the top-level `model` out of a
/// non-streaming Anthropic Messages response body.
pub fn from_json(body: &[u8]) -> Option<UsageInfo> {
	let v: Value = serde_json::from_slice(body).ok()?;
	let model = v.get("model").and_then(|m| m.as_str()).map(str::to_string);
	usage_from_value(v.get("usage")?, model)
}

fn usage_from_value(usage: &Value, model: Option<String>) -> Option<UsageInfo> {
	Some(UsageInfo::from_counts(
		usage.get("input_tokens")?.as_u64().unwrap_or(0),
		usage.get("output_tokens")?.as_u64().unwrap_or(0),
		usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
		usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
		model,
		None,
	))
}

/// Scan a (possibly partial) SSE byte buffer for `message_start` and
/// `message_delta` events, bounded to `cap_bytes` of input so a
/// pathologically long or stalled stream never grows memory unbounded.
/// `message_delta`'s usage, when present, authoritatively overrides
/// `message_start`'s for every field it carries (spec.md §4.3).
pub fn from_sse_bounded(chunks: impl IntoIterator<Item = Bytes>, cap_bytes: usize) -> Option<UsageInfo> {
	let mut decoder = SseDecoder::new();
	let mut seen = 0usize;
	let mut usage: Option<UsageInfo> = None;

	'outer: for chunk in chunks {
		if seen >= cap_bytes {
			break;
		}
		seen += chunk.len();
		decoder.push(&chunk);
		while let Some(ev) = decoder.next_event() {
			match ev.event.as_deref() {
				Some("message_start") => {
					if let Ok(v) = serde_json::from_str::<Value>(&ev.data) {
						let message = v.get("message");
						let model = message.and_then(|m| m.get("model")).and_then(|m| m.as_str()).map(str::to_string);
						if let Some(u) = message.and_then(|m| m.get("usage")).and_then(|u| usage_from_value(u, model)) {
							usage = Some(u);
						}
					}
				},
				Some("message_delta") => {
					if let Ok(v) = serde_json::from_str::<Value>(&ev.data) {
						if let Some(delta_usage) = v.get("usage") {
							let base = usage.unwrap_or_default();
							usage = Some(merge_delta(base, delta_usage));
						}
					}
				},
				Some("message_stop") => break 'outer,
				_ => {},
			}
		}
		if seen >= cap_bytes {
			break;
		}
	}
	usage
}

fn merge_delta(base: UsageInfo, delta: &Value) -> UsageInfo {
	UsageInfo::from_counts(
		delta.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(base.input_tokens),
		delta.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(base.output_tokens),
		delta.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(base.cache_creation_input_tokens),
		delta.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(base.cache_read_input_tokens),
		base.model,
		base.cost,
	)
}

use bytes::Bytes;

/// `anthropic-billing-cost` header, parsed as float when present.
pub fn cost_from_header(headers: &http::HeaderMap) -> Option<f64> {
	headers.get("anthropic-billing-cost")?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn json_usage_reads_all_four_fields() {
		let body = br#"{"model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":10,"output_tokens":20,"cache_creation_input_tokens":1,"cache_read_input_tokens":2}}"#;
		let u = from_json(body).unwrap();
		assert_eq!(u.input_tokens, 10);
		assert_eq!(u.output_tokens, 20);
		assert_eq!(u.cache_creation_input_tokens, 1);
		assert_eq!(u.cache_read_input_tokens, 2);
		assert_eq!(u.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
		assert_eq!(u.prompt_tokens, 13);
		assert_eq!(u.completion_tokens, 20);
		assert_eq!(u.total_tokens, 33);
	}

	#[test]
	fn json_usage_missing_returns_none() {
		assert!(from_json(br#"{"foo":1}"#).is_none());
	}

	#[test]
	fn sse_message_delta_overrides_message_start() {
		let stream = concat!(
			"event: message_start\n",
			"data: {\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
			"event: content_block_delta\n",
			"data: {}\n\n",
			"event: message_delta\n",
			"data: {\"usage\":{\"output_tokens\":42}}\n\n",
			"event: message_stop\n",
			"data: {}\n\n",
		);
		let chunks = vec![Bytes::from_static(stream.as_bytes())];
		let usage = from_sse_bounded(chunks, 1024 * 100).unwrap();
		assert_eq!(usage.input_tokens, 5);
		assert_eq!(usage.output_tokens, 42);
	}

	/// spec.md §8 scenario 1, verbatim: `extractUsageInfo` on this exact SSE
	/// body returns the literal counters and aggregate token view quoted in
	/// the spec.
	#[test]
	fn streaming_usage_matches_the_documented_scenario() {
		let stream = concat!(
			"event: message_start\n",
			"data: {\"message\":{\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":10,\"output_tokens\":2,\"cache_read_input_tokens\":3,\"cache_creation_input_tokens\":4}}}\n\n",
			"event: message_delta\n",
			"data: {\"usage\":{\"output_tokens\":42}}\n\n",
		);
		let chunks = vec![Bytes::from_static(stream.as_bytes())];
		let usage = from_sse_bounded(chunks, 1024 * 100).unwrap();
		assert_eq!(usage.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
		assert_eq!(usage.input_tokens, 10);
		assert_eq!(usage.cache_read_input_tokens, 3);
		assert_eq!(usage.cache_creation_input_tokens, 4);
		assert_eq!(usage.output_tokens, 42);
		assert_eq!(usage.prompt_tokens, 17);
		assert_eq!(usage.completion_tokens, 42);
		assert_eq!(usage.total_tokens, 59);
	}

	#[test]
	fn sse_scan_stops_at_byte_cap() {
		let filler = "event: noop\ndata: ".to_string() + &"x".repeat(200) + "\n\n";
		let chunks = vec![Bytes::from(filler.into_bytes())];
		// cap smaller than the single chunk: scan must not panic and may
		// simply find no usage.
		assert!(from_sse_bounded(chunks, 10).is_none());
	}

	#[test]
	fn cost_header_parses_float() {
		let mut h = http::HeaderMap::new();
		h.insert("anthropic-billing-cost", "0.0123".parse().unwrap());
		assert_eq!(cost_from_header(&h), Some(0.0123));
	}
}
