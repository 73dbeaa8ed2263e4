//! Header sanitization shared by every provider (C3), plus the base
//! credential-injection template (part of C6).
//!
//! Grounded on `llm/mod.rs::set_required_fields` (strip client auth, set
//! provider-specific credential header) and spec.md §4.2/§8 invariant 1.

use http::{HeaderMap, HeaderName, HeaderValue};

/// Headers stripped from every request before it is proxied upstream, and
/// from every response before it is returned to the client: hop-by-hop
/// and compression headers the client should never see re-applied or that
/// would mismatch the (possibly re-encoded) body.
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &["host", "accept-encoding", "content-encoding"];

/// Remove the stripped set and clear `authorization` when the core is
/// about to inject its own credentials.
pub fn sanitize_client_headers(headers: &mut HeaderMap, clearing_authorization: bool) {
	for name in STRIPPED_REQUEST_HEADERS {
		headers.remove(*name);
	}
	if clearing_authorization {
		headers.remove(http::header::AUTHORIZATION);
	}
}

/// Inject a bearer token as `Authorization: Bearer <token>`.
pub fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<(), http::Error> {
	let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
	value.set_sensitive(true);
	headers.insert(http::header::AUTHORIZATION, value);
	Ok(())
}

/// Inject a raw (non-"Bearer "-prefixed) credential under an arbitrary
/// header name — used by `authType: direct` providers and `x-api-key`.
pub fn set_direct(headers: &mut HeaderMap, name: &str, token: &str) -> Result<(), http::Error> {
	let header_name = HeaderName::from_bytes(name.as_bytes())?;
	let mut value = HeaderValue::from_str(token)?;
	value.set_sensitive(true);
	headers.insert(header_name, value);
	Ok(())
}

/// Headers stripped from upstream *responses* before returning them to the
/// client: hop-by-hop plus `content-encoding` (the proxy may have already
/// decoded the body, or re-encodes it separately).
pub const STRIPPED_RESPONSE_HEADERS: &[&str] =
	&["connection", "keep-alive", "transfer-encoding", "content-encoding", "content-length"];

pub fn sanitize_response_headers(headers: &mut HeaderMap) {
	for name in STRIPPED_RESPONSE_HEADERS {
		headers.remove(*name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitize_strips_hop_by_hop_and_compression() {
		let mut h = HeaderMap::new();
		h.insert("host", HeaderValue::from_static("evil.example"));
		h.insert("accept-encoding", HeaderValue::from_static("gzip"));
		h.insert("content-encoding", HeaderValue::from_static("gzip"));
		h.insert("authorization", HeaderValue::from_static("Bearer client-token"));
		sanitize_client_headers(&mut h, true);
		assert!(!h.contains_key("host"));
		assert!(!h.contains_key("accept-encoding"));
		assert!(!h.contains_key("content-encoding"));
		assert!(!h.contains_key("authorization"));
	}

	#[test]
	fn sanitize_preserves_authorization_when_not_clearing() {
		let mut h = HeaderMap::new();
		h.insert("authorization", HeaderValue::from_static("Bearer client-token"));
		sanitize_client_headers(&mut h, false);
		assert!(h.contains_key("authorization"));
	}

	#[test]
	fn set_bearer_overwrites_existing_authorization() {
		let mut h = HeaderMap::new();
		h.insert("authorization", HeaderValue::from_static("Bearer old"));
		set_bearer(&mut h, "new-token").unwrap();
		assert_eq!(h.get("authorization").unwrap(), "Bearer new-token");
	}

	#[test]
	fn set_direct_does_not_prefix_bearer() {
		let mut h = HeaderMap::new();
		set_direct(&mut h, "x-api-key", "raw-key").unwrap();
		assert_eq!(h.get("x-api-key").unwrap(), "raw-key");
	}
}
