#![forbid(unsafe_code)]

//! Keyed sliding-window admission control.
//!
//! Keys look like `subject-or-ip:endpoint` (the hub uses
//! `subject:room:message.send`). Each key owns an exact window of admission
//! timestamps behind its own lock; there is no lock shared across keys on the
//! admission path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_IDLE_HORIZON: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
	pub limit: u32,
	pub window: Duration,
}

impl RateLimitRule {
	pub const fn new(limit: u32, window: Duration) -> Self {
		Self { limit, window }
	}

	pub const fn per_minute(limit: u32) -> Self {
		Self::new(limit, Duration::from_secs(60))
	}
}

/// Pattern table; the longest pattern contained in the key wins.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
	rules: Vec<(String, RateLimitRule)>,
	default_rule: RateLimitRule,
}

impl RateLimitPolicy {
	pub fn new(default_rule: RateLimitRule) -> Self {
		Self {
			rules: Vec::new(),
			default_rule,
		}
	}

	pub fn defaults() -> Self {
		Self::new(RateLimitRule::per_minute(100))
			.with_rule("login", RateLimitRule::per_minute(5))
			.with_rule("register", RateLimitRule::per_minute(5))
			.with_rule("rooms.create", RateLimitRule::per_minute(5))
			.with_rule("rooms.join", RateLimitRule::per_minute(10))
			.with_rule("message.send", RateLimitRule::per_minute(30))
			.with_rule("typing", RateLimitRule::per_minute(120))
			.with_rule("upload", RateLimitRule::new(10, Duration::from_secs(60 * 60)))
	}

	/// Add or replace the rule for `pattern`.
	pub fn with_rule(mut self, pattern: impl Into<String>, rule: RateLimitRule) -> Self {
		let pattern = pattern.into();
		match self.rules.iter_mut().find(|(p, _)| *p == pattern) {
			Some((_, existing)) => *existing = rule,
			None => self.rules.push((pattern, rule)),
		}
		self
	}

	pub fn with_default(mut self, rule: RateLimitRule) -> Self {
		self.default_rule = rule;
		self
	}

	pub fn rule_for(&self, key: &str) -> RateLimitRule {
		self.rules
			.iter()
			.filter(|(pattern, _)| key.contains(pattern.as_str()))
			.max_by_key(|(pattern, _)| pattern.len())
			.map(|(_, rule)| *rule)
			.unwrap_or(self.default_rule)
	}
}

impl Default for RateLimitPolicy {
	fn default() -> Self {
		Self::defaults()
	}
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
	pub allowed: bool,
	/// Seconds until the oldest admission leaves the window; 0 when allowed.
	pub retry_after_secs: u64,
}

impl Admission {
	const fn allowed() -> Self {
		Self {
			allowed: true,
			retry_after_secs: 0,
		}
	}
}

#[derive(Debug)]
struct Window {
	hits: VecDeque<Instant>,
	last_seen: Instant,
	/// Set by the sweeper, under this lock, as the window leaves the map.
	retired: bool,
}

impl Window {
	fn new(now: Instant) -> Self {
		Self {
			hits: VecDeque::new(),
			last_seen: now,
			retired: false,
		}
	}
}

#[derive(Debug)]
pub struct RateLimiter {
	policy: RateLimitPolicy,
	windows: DashMap<String, Arc<Mutex<Window>>>,
	idle_horizon: Duration,
}

fn lock(window: &Mutex<Window>) -> MutexGuard<'_, Window> {
	window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn admit(w: &mut Window, rule: RateLimitRule, now: Instant) -> Admission {
	w.last_seen = now;

	while w
		.hits
		.front()
		.is_some_and(|oldest| now.saturating_duration_since(*oldest) >= rule.window)
	{
		w.hits.pop_front();
	}

	if w.hits.len() < rule.limit as usize {
		w.hits.push_back(now);
		return Admission::allowed();
	}

	let retry_after = w
		.hits
		.front()
		.map(|oldest| rule.window.saturating_sub(now.saturating_duration_since(*oldest)))
		.unwrap_or(rule.window);
	let mut secs = retry_after.as_secs();
	if retry_after.subsec_nanos() > 0 {
		secs += 1;
	}

	metrics::counter!("classchat_rate_limited_total").increment(1);
	Admission {
		allowed: false,
		retry_after_secs: secs.max(1),
	}
}

impl RateLimiter {
	pub fn new(policy: RateLimitPolicy) -> Self {
		Self {
			policy,
			windows: DashMap::new(),
			idle_horizon: DEFAULT_IDLE_HORIZON,
		}
	}

	pub fn with_idle_horizon(mut self, horizon: Duration) -> Self {
		self.idle_horizon = horizon;
		self
	}

	pub fn policy(&self) -> &RateLimitPolicy {
		&self.policy
	}

	pub fn try_admit(&self, key: &str) -> Admission {
		self.try_admit_at(key, Instant::now())
	}

	pub fn try_admit_at(&self, key: &str, now: Instant) -> Admission {
		let rule = self.policy.rule_for(key);
		loop {
			let window = self.window(key, now);
			let mut w = lock(&window);
			// Swept between lookup and lock; the next lookup finds or creates the live one.
			if w.retired {
				continue;
			}
			return admit(&mut w, rule, now);
		}
	}

	fn window(&self, key: &str, now: Instant) -> Arc<Mutex<Window>> {
		if let Some(existing) = self.windows.get(key) {
			return Arc::clone(existing.value());
		}
		Arc::clone(
			self.windows
				.entry(key.to_string())
				.or_insert_with(|| Arc::new(Mutex::new(Window::new(now))))
				.value(),
		)
	}

	/// Drop keys not touched within the idle horizon. Returns how many were removed.
	pub fn sweep_idle(&self, now: Instant) -> usize {
		let before = self.windows.len();
		self.windows.retain(|_, window| match window.try_lock() {
			Ok(mut w) => {
				let keep = now.saturating_duration_since(w.last_seen) < self.idle_horizon;
				if !keep {
					w.retired = true;
				}
				keep
			}
			Err(_) => true,
		});
		let removed = before.saturating_sub(self.windows.len());
		metrics::gauge!("classchat_rate_limit_keys").set(self.windows.len() as f64);
		removed
	}

	pub fn tracked_keys(&self) -> usize {
		self.windows.len()
	}
}

/// Periodically evict idle windows. Abort the handle to stop.
pub fn spawn_rate_limit_sweeper(limiter: Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let removed = limiter.sweep_idle(Instant::now());
			if removed > 0 {
				debug!(removed, remaining = limiter.tracked_keys(), "rate limiter: evicted idle keys");
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
		RateLimiter::new(RateLimitPolicy::new(RateLimitRule::new(
			limit,
			Duration::from_secs(window_secs),
		)))
	}

	#[test]
	fn exactly_limit_admissions_per_window() {
		let rl = limiter(5, 60);
		let t0 = Instant::now();

		for i in 0..5 {
			let a = rl.try_admit_at("alice:login", t0 + Duration::from_secs(i));
			assert!(a.allowed, "admission {i} should pass");
		}

		let sixth = rl.try_admit_at("alice:login", t0 + Duration::from_secs(10));
		assert!(!sixth.allowed);
		assert!(sixth.retry_after_secs > 0 && sixth.retry_after_secs <= 60);
		assert_eq!(sixth.retry_after_secs, 50);
	}

	#[test]
	fn window_slides_instead_of_resetting() {
		let rl = limiter(2, 60);
		let t0 = Instant::now();

		assert!(rl.try_admit_at("k", t0).allowed);
		assert!(rl.try_admit_at("k", t0 + Duration::from_secs(59)).allowed);
		assert!(!rl.try_admit_at("k", t0 + Duration::from_secs(59)).allowed);

		// First hit has aged out; second is still inside the window.
		assert!(rl.try_admit_at("k", t0 + Duration::from_secs(60)).allowed);
		assert!(!rl.try_admit_at("k", t0 + Duration::from_secs(61)).allowed);
	}

	#[test]
	fn rejected_attempts_are_not_recorded() {
		let rl = limiter(1, 10);
		let t0 = Instant::now();

		assert!(rl.try_admit_at("k", t0).allowed);
		for s in 1..10 {
			assert!(!rl.try_admit_at("k", t0 + Duration::from_secs(s)).allowed);
		}
		assert!(rl.try_admit_at("k", t0 + Duration::from_secs(10)).allowed);
	}

	#[test]
	fn keys_are_independent() {
		let rl = limiter(1, 60);
		let t0 = Instant::now();

		assert!(rl.try_admit_at("alice:message.send", t0).allowed);
		assert!(rl.try_admit_at("bob:message.send", t0).allowed);
		assert!(!rl.try_admit_at("alice:message.send", t0).allowed);
	}

	#[test]
	fn longest_matching_pattern_wins() {
		let policy = RateLimitPolicy::defaults().with_rule("rooms", RateLimitRule::per_minute(50));

		assert_eq!(policy.rule_for("alice:rooms.create").limit, 5);
		assert_eq!(policy.rule_for("alice:rooms.list").limit, 50);
		assert_eq!(policy.rule_for("alice:r1:message.send").limit, 30);
		assert_eq!(policy.rule_for("10.0.0.1:upload").window, Duration::from_secs(3600));
		assert_eq!(policy.rule_for("alice:whatever").limit, 100);
	}

	#[test]
	fn with_rule_replaces_existing_pattern() {
		let policy = RateLimitPolicy::defaults().with_rule("login", RateLimitRule::per_minute(1));
		assert_eq!(policy.rule_for("ip:login").limit, 1);
	}

	#[test]
	fn sweep_evicts_only_idle_keys() {
		let rl = limiter(5, 60).with_idle_horizon(Duration::from_secs(3600));
		let t0 = Instant::now();

		rl.try_admit_at("old", t0);
		rl.try_admit_at("fresh", t0 + Duration::from_secs(3000));
		assert_eq!(rl.tracked_keys(), 2);

		let removed = rl.sweep_idle(t0 + Duration::from_secs(3601));
		assert_eq!(removed, 1);
		assert_eq!(rl.tracked_keys(), 1);

		// Evicted keys come back lazily with a clean window.
		assert!(rl.try_admit_at("old", t0 + Duration::from_secs(3602)).allowed);
	}

	#[test]
	fn admission_after_a_sweep_lands_in_the_live_window() {
		let rl = limiter(1, 60).with_idle_horizon(Duration::from_secs(3600));
		let t0 = Instant::now();
		rl.try_admit_at("k", t0);

		// A caller that looked the window up just before the sweep.
		let stale = rl.window("k", t0);
		assert_eq!(rl.sweep_idle(t0 + Duration::from_secs(3601)), 1);
		assert!(lock(&stale).retired);

		let later = t0 + Duration::from_secs(3602);
		assert!(rl.try_admit_at("k", later).allowed);
		assert_eq!(rl.tracked_keys(), 1);
		assert!(!rl.try_admit_at("k", later).allowed);
		let retired = lock(&stale);
		assert_eq!(retired.hits, VecDeque::from([t0]));
	}

	#[test]
	fn concurrent_callers_never_exceed_limit() {
		let rl = Arc::new(limiter(30, 60));
		let t0 = Instant::now();

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let rl = Arc::clone(&rl);
				std::thread::spawn(move || (0..10).filter(|_| rl.try_admit_at("hot", t0).allowed).count())
			})
			.collect();

		let admitted: usize = handles.into_iter().map(|h| h.join().expect("thread")).sum();
		assert_eq!(admitted, 30);
	}
}
