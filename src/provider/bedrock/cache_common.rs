//! Shared TTL-cache-with-eviction shape for C10/C11: a map plus a
//! `last_refresh` map behind a single lock (spec.md §9 design note), keyed
//! by AWS region, evicting the oldest region once more than
//! `MAX_REGIONS` are cached.
//!
//! Grounded on `ScriptSmith-hadrian`'s `InferenceProfileCache`/
//! `FoundationModelsCache` (`is_stale()` over a per-entry timestamp), here
//! generalized to a region-keyed map since this crate caches per-region,
//! not a single global snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_REGIONS: usize = 20;

struct Entry<V> {
	value: V,
	refreshed_at: Instant,
}

/// A per-region cache with a wall-clock TTL and a capacity-bounded
/// eviction policy (oldest `last_refresh` wins when full).
pub struct RegionTtlCache<V> {
	ttl: Duration,
	entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> RegionTtlCache<V> {
	pub fn new(ttl: Duration) -> Self {
		Self { ttl, entries: Mutex::new(HashMap::new()) }
	}

	/// `None` if the region isn't cached or its entry is older than the TTL.
	pub fn get(&self, region: &str) -> Option<V> {
		let entries = self.entries.lock();
		let entry = entries.get(region)?;
		if entry.refreshed_at.elapsed() > self.ttl {
			return None;
		}
		Some(entry.value.clone())
	}

	/// Insert/refresh a region's entry, evicting the least-recently-refreshed
	/// region first if this insert would exceed [`MAX_REGIONS`].
	pub fn put(&self, region: &str, value: V) {
		let mut entries = self.entries.lock();
		if !entries.contains_key(region) && entries.len() >= MAX_REGIONS {
			if let Some(oldest) = entries
				.iter()
				.min_by_key(|(_, e)| e.refreshed_at)
				.map(|(k, _)| k.clone())
			{
				entries.remove(&oldest);
			}
		}
		entries.insert(region.to_string(), Entry { value, refreshed_at: Instant::now() });
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

/// Exponential backoff retry for the AWS catalog calls C10/C11 make:
/// 1s, 2s, 4s... capped at 10s, three attempts, per spec.md §4.7.
pub async fn retry_with_backoff<T, E, F, Fut>(mut attempt: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
{
	const MAX_ATTEMPTS: u32 = 3;
	const BASE: Duration = Duration::from_secs(1);
	const CAP: Duration = Duration::from_secs(10);

	let mut last_err = None;
	for attempt_no in 0..MAX_ATTEMPTS {
		match attempt().await {
			Ok(v) => return Ok(v),
			Err(e) => {
				last_err = Some(e);
				if attempt_no + 1 < MAX_ATTEMPTS {
					let backoff = std::cmp::min(BASE * 2u32.pow(attempt_no), CAP);
					tokio::time::sleep(backoff).await;
				}
			},
		}
	}
	Err(last_err.expect("loop runs at least once"))
}
