//! Model-name resolution (C2): exact + pattern + forced rules.
//!
//! Precedence, per spec.md §7/§8 invariant 7:
//! exact account key > known-pattern account key > static provider
//! mapping > identity.

use std::collections::HashMap;

/// The fixed set of pattern keys every provider's static mapping and every
/// account's `model_mappings` may use, matched case-insensitively as a
/// substring of the client model name.
pub const PATTERN_KEYS: &[&str] = &["opus", "sonnet", "haiku"];

/// Resolve `client_model` against an account's mapping table first, then a
/// provider's static fallback table, then identity.
///
/// `account_mappings` and `static_mappings` are both "exact or pattern key
/// -> provider model name" tables; exact keys take precedence within each
/// table, and the account table takes precedence over the static one.
pub fn resolve(
	client_model: &str,
	account_mappings: Option<&HashMap<String, String>>,
	static_mappings: &HashMap<&str, &str>,
) -> String {
	if let Some(m) = account_mappings {
		if let Some(exact) = m.get(client_model) {
			return exact.clone();
		}
		if let Some(v) = pattern_lookup_owned(client_model, m) {
			return v;
		}
	}
	if let Some(exact) = static_mappings.get(client_model) {
		return (*exact).to_string();
	}
	if let Some(v) = pattern_lookup_borrowed(client_model, static_mappings) {
		return v.to_string();
	}
	client_model.to_string()
}

fn pattern_lookup_owned(client_model: &str, table: &HashMap<String, String>) -> Option<String> {
	let lower = client_model.to_ascii_lowercase();
	for key in PATTERN_KEYS {
		if lower.contains(key) {
			if let Some(v) = table.get(*key) {
				return Some(v.clone());
			}
		}
	}
	None
}

fn pattern_lookup_borrowed<'a>(
	client_model: &str,
	table: &HashMap<&'a str, &'a str>,
) -> Option<&'a str> {
	let lower = client_model.to_ascii_lowercase();
	for key in PATTERN_KEYS {
		if lower.contains(key) {
			if let Some(v) = table.get(*key) {
				return Some(*v);
			}
		}
	}
	None
}

/// Static fallback table for the OpenAI-compatible family, per spec.md §4.6.
pub fn openai_compatible_static_map() -> HashMap<&'static str, &'static str> {
	HashMap::from([
		("opus", "openai/gpt-5"),
		("sonnet", "openai/gpt-5"),
		("haiku", "openai/gpt-5-mini"),
	])
}

#[cfg(test)]
mod tests {
	use super::*;

	fn acct(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn exact_account_key_wins_over_everything() {
		let account = acct(&[("claude-3-5-sonnet-20241022", "account-exact")]);
		let static_map = HashMap::from([("sonnet", "static-pattern")]);
		let resolved = resolve("claude-3-5-sonnet-20241022", Some(&account), &static_map);
		assert_eq!(resolved, "account-exact");
	}

	#[test]
	fn pattern_key_matches_case_insensitive_substring() {
		let account = acct(&[("sonnet", "account-pattern")]);
		let static_map = HashMap::new();
		let resolved = resolve("Claude-3-5-Sonnet-20241022", Some(&account), &static_map);
		assert_eq!(resolved, "account-pattern");
	}

	#[test]
	fn falls_back_to_static_mapping_when_no_account_match() {
		let static_map = openai_compatible_static_map();
		assert_eq!(resolve("claude-3-opus-20240229", None, &static_map), "openai/gpt-5");
		assert_eq!(resolve("claude-3-5-haiku-latest", None, &static_map), "openai/gpt-5-mini");
	}

	#[test]
	fn identity_when_nothing_matches() {
		let static_map = HashMap::new();
		assert_eq!(resolve("some-custom-model", None, &static_map), "some-custom-model");
	}

	#[test]
	fn account_pattern_beats_static_exact() {
		// Precedence per spec.md §7: exact account > pattern account >
		// static mapping > identity — pattern account outranks even an
		// exact match in the static table.
		let account = acct(&[("opus", "account-wins")]);
		let static_map = HashMap::from([("claude-3-opus-20240229", "static-exact")]);
		assert_eq!(
			resolve("claude-3-opus-20240229", Some(&account), &static_map),
			"account-wins"
		);
	}
}
