//! Rate-limit parsing (C4): converts response headers/bodies into a
//! [`RateLimitInfo`] value, per spec.md §4.4.

use http::{HeaderMap, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct RateLimitInfo {
	pub is_rate_limited: bool,
	pub reset_time_ms: Option<i64>,
	pub status_header: Option<String>,
	pub remaining: Option<i64>,
}

const HARD_STATUSES: &[&str] = &["rate_limited", "blocked", "queueing_hard", "payment_required"];
const SOFT_STATUSES: &[&str] = &["allowed_warning", "queueing_soft"];

/// The default / Anthropic rate-limit parser (base provider behavior,
/// C6 + C7/4.3). `now_ms` is injected so tests can pin "now".
pub fn parse_unified(headers: &HeaderMap, status: StatusCode, now_ms: i64) -> RateLimitInfo {
	let unified_status = header_str(headers, "anthropic-ratelimit-unified-status");
	let unified_reset = header_str(headers, "anthropic-ratelimit-unified-reset");

	if unified_status.is_some() || unified_reset.is_some() {
		let is_rate_limited = match unified_status.as_deref() {
			Some(s) if SOFT_STATUSES.contains(&s) => false,
			Some(s) => HARD_STATUSES.contains(&s) || status.as_u16() == 429,
			None => status.as_u16() == 429,
		};
		let reset_time_ms = unified_reset
			.as_deref()
			.and_then(|s| s.parse::<i64>().ok())
			.map(|secs| secs * 1000)
			.or_else(|| {
				header_str(headers, "x-ratelimit-reset")
					.and_then(|s| s.parse::<i64>().ok())
					.map(|secs| now_ms + secs * 1000)
			});
		let remaining = header_str(headers, "anthropic-ratelimit-unified-remaining")
			.and_then(|s| s.parse::<i64>().ok());
		return RateLimitInfo {
			is_rate_limited,
			reset_time_ms,
			status_header: unified_status,
			remaining,
		};
	}

	if status != StatusCode::TOO_MANY_REQUESTS {
		return RateLimitInfo { is_rate_limited: false, ..Default::default() };
	}

	let reset_time_ms = parse_retry_after(headers, now_ms);
	RateLimitInfo { is_rate_limited: true, reset_time_ms, status_header: None, remaining: None }
}

/// Parse `retry-after` as either an integer number of seconds or an
/// HTTP-date, per spec.md §4.4 step 3.
fn parse_retry_after(headers: &HeaderMap, now_ms: i64) -> Option<i64> {
	let raw = header_str(headers, "retry-after")?;
	if let Ok(secs) = raw.parse::<i64>() {
		return Some(now_ms + secs * 1000);
	}
	httpdate_to_ms(&raw)
}

fn httpdate_to_ms(raw: &str) -> Option<i64> {
	chrono::DateTime::parse_from_rfc2822(raw)
		.ok()
		.map(|dt| dt.timestamp_millis())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
	headers.get(name)?.to_str().ok().map(|s| s.to_string())
}

/// OpenAI-compatible providers never report themselves rate-limited; the
/// upstream handles its own limiting in-band (spec.md §4.4 step 5).
pub fn openai_compatible_never_limited() -> RateLimitInfo {
	RateLimitInfo::default()
}

/// z.ai's body-based rate-limit signal (spec.md §4.4 step 4 / §8
/// scenario 5): `{"type":"error","error":{"type":"1308","message":"...
/// reset at YYYY-MM-DD HH:MM:SS"}}`, timestamp in UTC+8 (Singapore).
pub fn parse_zai_body(body: &[u8]) -> Option<RateLimitInfo> {
	let v: serde_json::Value = serde_json::from_slice(body).ok()?;
	if v.get("type")?.as_str()? != "error" {
		return None;
	}
	let error = v.get("error")?;
	if error.get("type")?.as_str()? != "1308" {
		return None;
	}
	let message = error.get("message")?.as_str()?;
	let reset_time_ms = extract_zai_reset_time(message);
	Some(RateLimitInfo {
		is_rate_limited: true,
		reset_time_ms,
		status_header: Some("1308".to_string()),
		remaining: None,
	})
}

fn extract_zai_reset_time(message: &str) -> Option<i64> {
	// "...reset at 2025-10-03 08:23:14" — naive datetime in UTC+8.
	let re = regex::Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})").ok()?;
	let caught = re.captures(message)?;
	let naive = chrono::NaiveDateTime::parse_from_str(&caught[1], "%Y-%m-%d %H:%M:%S").ok()?;
	let offset = chrono::FixedOffset::east_opt(8 * 3600)?;
	let with_offset = offset.from_local_datetime(&naive).single()?;
	Some(with_offset.with_timezone(&chrono::Utc).timestamp_millis())
}

use chrono::TimeZone;

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut h = HeaderMap::new();
		for (k, v) in pairs {
			h.insert(
				http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
				HeaderValue::from_str(v).unwrap(),
			);
		}
		h
	}

	#[test]
	fn unified_hard_status_is_rate_limited() {
		let h = headers_with(&[
			("anthropic-ratelimit-unified-status", "rate_limited"),
			("anthropic-ratelimit-unified-reset", "1000"),
		]);
		let info = parse_unified(&h, StatusCode::OK, 0);
		assert!(info.is_rate_limited);
		assert_eq!(info.reset_time_ms, Some(1_000_000));
	}

	#[test]
	fn unified_soft_status_is_not_rate_limited() {
		let h = headers_with(&[("anthropic-ratelimit-unified-status", "allowed_warning")]);
		let info = parse_unified(&h, StatusCode::OK, 0);
		assert!(!info.is_rate_limited);
	}

	#[test]
	fn non_429_without_unified_headers_is_not_limited() {
		let h = HeaderMap::new();
		let info = parse_unified(&h, StatusCode::OK, 0);
		assert!(!info.is_rate_limited);
	}

	#[test]
	fn retry_after_seconds_sets_reset_time() {
		let h = headers_with(&[("retry-after", "30")]);
		let info = parse_unified(&h, StatusCode::TOO_MANY_REQUESTS, 1_000_000);
		assert!(info.is_rate_limited);
		assert_eq!(info.reset_time_ms, Some(1_030_000));
	}

	#[test]
	fn retry_after_absent_leaves_reset_time_unset() {
		let h = HeaderMap::new();
		let info = parse_unified(&h, StatusCode::TOO_MANY_REQUESTS, 0);
		assert!(info.is_rate_limited);
		assert_eq!(info.reset_time_ms, None);
	}

	#[test]
	fn zai_body_scenario_from_spec() {
		let body = br#"{"type":"error","error":{"type":"1308","message":"Your limit will reset at 2025-10-03 08:23:14"}}"#;
		let info = parse_zai_body(body).unwrap();
		assert!(info.is_rate_limited);
		let expected = chrono::Utc.with_ymd_and_hms(2025, 10, 3, 0, 23, 14).unwrap().timestamp_millis();
		assert_eq!(info.reset_time_ms, Some(expected));
	}

	#[test]
	fn zai_body_non_matching_shape_returns_none() {
		let body = br#"{"type":"ok"}"#;
		assert!(parse_zai_body(body).is_none());
	}

	#[test]
	fn openai_compatible_always_reports_not_limited() {
		assert!(!openai_compatible_never_limited().is_rate_limited);
	}
}
