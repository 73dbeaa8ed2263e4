//! PKCE (Proof Key for Code Exchange, RFC 7636) utility used by the
//! Anthropic OAuth provider (C1).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A single-use PKCE verifier/challenge pair. Lifetime is one OAuth
/// attempt — generate a fresh one per `authorization_url` call.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
	pub verifier: String,
	pub challenge: String,
}

/// Generate a cryptographically random verifier (32 random bytes,
/// base64url-no-pad encoded) and its S256 challenge.
pub fn generate() -> PkceChallenge {
	let mut bytes = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut bytes);
	let verifier = URL_SAFE_NO_PAD.encode(bytes);
	let challenge = challenge_for(&verifier);
	PkceChallenge { verifier, challenge }
}

/// Compute the S256 challenge for an existing verifier. Exposed
/// separately so tests can assert the transform without depending on
/// `generate`'s randomness.
pub fn challenge_for(verifier: &str) -> String {
	let digest = Sha256::digest(verifier.as_bytes());
	URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verifier_is_url_safe_no_pad() {
		let pkce = generate();
		assert!(
			pkce
				.verifier
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
		);
		assert!(!pkce.verifier.contains('='));
	}

	#[test]
	fn challenge_is_deterministic_for_a_verifier() {
		let a = challenge_for("abc123");
		let b = challenge_for("abc123");
		assert_eq!(a, b);
		assert_ne!(a, "abc123");
	}

	#[test]
	fn distinct_calls_yield_distinct_verifiers() {
		let a = generate();
		let b = generate();
		assert_ne!(a.verifier, b.verifier);
	}

	#[test]
	fn challenge_matches_known_vector() {
		// RFC 7636 Appendix B example verifier/challenge pair.
		let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
		assert_eq!(challenge_for(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
	}
}
