#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::util::time::unix_secs_now;

/// Token ids revoked before their natural expiry.
///
/// Each entry lives until the token's own `exp`; after that the signature
/// check rejects the token anyway, so the entry is dropped.
#[derive(Debug, Default)]
pub struct RevocationSet {
	entries: DashMap<String, u64>,
}

impl RevocationSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Revoke `token_id` until `expires_at` (unix seconds).
	pub fn revoke(&self, token_id: &str, expires_at: u64) {
		if token_id.is_empty() || expires_at <= unix_secs_now() {
			return;
		}
		self.entries
			.entry(token_id.to_string())
			.and_modify(|exp| *exp = (*exp).max(expires_at))
			.or_insert(expires_at);
		metrics::counter!("classchat_tokens_revoked_total").increment(1);
	}

	pub fn is_revoked(&self, token_id: &str) -> bool {
		self.is_revoked_at(token_id, unix_secs_now())
	}

	pub fn is_revoked_at(&self, token_id: &str, now: u64) -> bool {
		let Some(exp) = self.entries.get(token_id).map(|e| *e.value()) else {
			return false;
		};
		if exp > now {
			return true;
		}
		self.entries.remove_if(token_id, |_, exp| *exp <= now);
		false
	}

	/// Remove entries whose token has expired naturally.
	pub fn sweep_expired(&self, now: u64) -> usize {
		let before = self.entries.len();
		self.entries.retain(|_, exp| *exp > now);
		before.saturating_sub(self.entries.len())
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

pub fn spawn_revocation_sweeper(set: Arc<RevocationSet>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let removed = set.sweep_expired(unix_secs_now());
			if removed > 0 {
				debug!(removed, remaining = set.len(), "revocation set: dropped expired entries");
			}
		}
	})
}
