//! Periodic per-account usage poller + TTL cache (C13), spec.md §4.11.
//!
//! No direct teacher equivalent (the teacher has no usage-subscription
//! concept); the lock discipline is grounded on
//! [`crate::provider::bedrock::cache_common`]'s "one lock guards the map
//! and its refresh timestamps together" pattern, generalized per spec.md
//! §5 to also guard the poller handle and token provider under that same
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const JITTER_SECS: i64 = 5;
const EVICT_EVERY_N_WRITES: u64 = 100;

/// Which of the three documented usage endpoints to poll (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageProviderKind {
	Anthropic,
	Nanogpt,
	Zai,
}

/// Supplies a fresh token on each poll. May wrap a constant for accounts
/// whose credential never changes (spec.md §4.11: "it may be constant").
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

struct Entry {
	kind: UsageProviderKind,
	endpoint: Option<String>,
	token_provider: TokenProvider,
	data: Option<Value>,
	cached_at: Instant,
	handle: JoinHandle<()>,
}

/// Process-wide usage cache + poller registry. Must be held in an `Arc`:
/// [`start_polling`](Self::start_polling) spawns a task that outlives the
/// call and needs its own handle back to `self`.
pub struct UsageFetcher {
	http: Client,
	entries: Mutex<HashMap<String, Entry>>,
	writes: AtomicU64,
}

impl UsageFetcher {
	pub fn new(http: Client) -> Self {
		Self { http, entries: Mutex::new(HashMap::new()), writes: AtomicU64::new(0) }
	}

	/// Start (or restart) polling `account_id`. Starting polling for an id
	/// that already has a poller cancels the existing one first (spec.md
	/// §4.11).
	pub fn start_polling(
		self: &Arc<Self>,
		account_id: &str,
		kind: UsageProviderKind,
		endpoint: Option<String>,
		token_provider: TokenProvider,
		interval: Duration,
	) {
		self.stop_polling(account_id);

		let fetcher = Arc::clone(self);
		let id = account_id.to_string();
		let poll_endpoint = endpoint.clone();
		let poll_token_provider = token_provider.clone();
		let handle = tokio::spawn(async move {
			loop {
				tokio::time::sleep(next_interval(interval)).await;
				fetcher.fetch_and_store(&id, kind, poll_endpoint.as_deref(), &poll_token_provider).await;
			}
		});

		self.entries.lock().insert(
			account_id.to_string(),
			// `cached_at` starts already-expired so a read before the first
			// successful poll correctly reports "no usage yet" rather than a
			// false cache hit on default data.
			Entry { kind, endpoint, token_provider, data: None, cached_at: Instant::now() - CACHE_TTL, handle },
		);
	}

	/// Aborts the poller and deletes the cache entry (spec.md §4.11:
	/// "Stopping polling also deletes the cache entry").
	pub fn stop_polling(&self, account_id: &str) {
		if let Some(entry) = self.entries.lock().remove(account_id) {
			entry.handle.abort();
		}
	}

	/// Forces an immediate fetch outside the poller's own schedule.
	pub async fn refresh_now(&self, account_id: &str) -> Option<Value> {
		let (kind, endpoint, token_provider) = {
			let entries = self.entries.lock();
			let entry = entries.get(account_id)?;
			(entry.kind, entry.endpoint.clone(), entry.token_provider.clone())
		};
		self.fetch_and_store(account_id, kind, endpoint.as_deref(), &token_provider).await
	}

	/// `None` if nothing has been fetched yet or the cached entry is past
	/// its 10-minute TTL (lazy eviction on read, per spec.md §4.11).
	pub fn get(&self, account_id: &str) -> Option<Value> {
		let mut entries = self.entries.lock();
		let entry = entries.get_mut(account_id)?;
		if entry.cached_at.elapsed() > CACHE_TTL {
			entry.data = None;
			return None;
		}
		entry.data.clone()
	}

	async fn fetch_and_store(
		&self,
		account_id: &str,
		kind: UsageProviderKind,
		endpoint: Option<&str>,
		token_provider: &TokenProvider,
	) -> Option<Value> {
		let token = token_provider();
		let value = self.fetch(account_id, kind, endpoint, &token).await;

		if let Some(v) = &value {
			let mut entries = self.entries.lock();
			if let Some(entry) = entries.get_mut(account_id) {
				entry.data = Some(v.clone());
				entry.cached_at = Instant::now();
			}
		}

		let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
		if writes % EVICT_EVERY_N_WRITES == 0 {
			self.evict_stale();
		}
		value
	}

	async fn fetch(&self, account_id: &str, kind: UsageProviderKind, endpoint: Option<&str>, token: &str) -> Option<Value> {
		let request = match kind {
			UsageProviderKind::Anthropic => self
				.http
				.get("https://api.anthropic.com/api/oauth/usage")
				.header("anthropic-beta", "oauth-2025-04-20")
				.header("authorization", format!("Bearer {token}")),
			UsageProviderKind::Nanogpt => {
				let Some(base) = endpoint else {
					warn!(account_id, "nanogpt usage poll skipped: no custom_endpoint configured");
					return None;
				};
				self.http.get(format!("{}/subscription/v1/usage", base.trim_end_matches('/'))).header("x-api-key", token)
			},
			UsageProviderKind::Zai => {
				self.http.get("https://api.z.ai/api/monitor/usage/quota/limit").header("x-api-key", token)
			},
		};

		match request.send().await {
			Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
				Ok(v) => Some(v),
				Err(e) => {
					warn!(account_id, error = %e, "usage poll response was not valid JSON");
					None
				},
			},
			Ok(resp) => {
				warn!(account_id, status = %resp.status(), "usage poll returned an error status");
				None
			},
			Err(e) => {
				warn!(account_id, error = %e, "usage poll transport error");
				None
			},
		}
	}

	/// Proactive sweep run every [`EVICT_EVERY_N_WRITES`] writes (spec.md
	/// §4.11), clearing data whose TTL has lapsed since the last read.
	fn evict_stale(&self) {
		let mut entries = self.entries.lock();
		for entry in entries.values_mut() {
			if entry.cached_at.elapsed() > CACHE_TTL {
				entry.data = None;
			}
		}
	}
}

/// `interval` jittered by ±[`JITTER_SECS`], floored at one second.
fn next_interval(interval: Duration) -> Duration {
	let jitter = rand::thread_rng().gen_range(-JITTER_SECS..=JITTER_SECS);
	let secs = (interval.as_secs() as i64 + jitter).max(1);
	Duration::from_secs(secs as u64)
}

/// Representative utilization + window label for whichever provider `data`
/// came from (spec.md §4.11's three extraction rules). The core treats
/// the snapshot as opaque beyond this.
pub fn representative_utilization(kind: UsageProviderKind, data: &Value) -> Option<(f64, String)> {
	match kind {
		UsageProviderKind::Anthropic => anthropic_representative(data),
		UsageProviderKind::Nanogpt => nanogpt_representative(data),
		UsageProviderKind::Zai => zai_representative(data),
	}
}

/// Walks every nested object in the response and returns the maximum
/// `utilization` found, labeled by its immediate parent key — Anthropic's
/// usage windows aren't named by a fixed schema (spec.md §4.11).
fn anthropic_representative(data: &Value) -> Option<(f64, String)> {
	let mut best: Option<(f64, String)> = None;
	walk_for_utilization(data, "root", &mut best);
	best
}

fn walk_for_utilization(value: &Value, key: &str, best: &mut Option<(f64, String)>) {
	if let Value::Object(map) = value {
		if let Some(u) = map.get("utilization").and_then(|v| v.as_f64()) {
			if best.as_ref().is_none_or(|(b, _)| u > *b) {
				*best = Some((u, key.to_string()));
			}
		}
		for (k, v) in map {
			walk_for_utilization(v, k, best);
		}
	}
}

fn nanogpt_representative(data: &Value) -> Option<(f64, String)> {
	let daily = data.get("daily").and_then(|d| d.get("percent")).and_then(|v| v.as_f64());
	let monthly = data.get("monthly").and_then(|d| d.get("percent")).and_then(|v| v.as_f64());
	match (daily, monthly) {
		(Some(d), Some(m)) if d >= m => Some((d, "daily".to_string())),
		(Some(_), Some(m)) => Some((m, "monthly".to_string())),
		(Some(d), None) => Some((d, "daily".to_string())),
		(None, Some(m)) => Some((m, "monthly".to_string())),
		(None, None) => None,
	}
}

/// z.ai only ever reports `tokens_limit`, mapped to the `five_hour` window
/// label regardless of the raw field name (spec.md §4.11).
fn zai_representative(data: &Value) -> Option<(f64, String)> {
	let percentage = data.get("tokens_limit").and_then(|t| t.get("percentage")).and_then(|v| v.as_f64())?;
	Some((percentage, "five_hour".to_string()))
}

/// NanoGPT's subscription "usable" flag is inconsistent across snapshots
/// (spec.md §9); fail-safe true both when no data has been fetched yet and
/// when the field is present but not a bool, so a flaky upstream never
/// cascades into account exhaustion.
pub fn nanogpt_is_usable(data: Option<&Value>) -> bool {
	match data.and_then(|d| d.get("usable")) {
		Some(Value::Bool(usable)) => *usable,
		_ => true,
	}
}
