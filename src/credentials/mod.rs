//! Credential pool with per-credential health tracking and cooldowns.
//!
//! Tracks availability, failure counts, in-flight slots, and cooldown
//! deadlines for each service credential. Selection is round-robin over
//! healthy credentials; a credential enters cooldown after a rate limit or
//! after repeated failures, and returns to rotation lazily once the deadline
//! elapses (checked at selection time, no background timer).
//!
//! All mutable state lives behind a single lock. This is the only structure
//! in the orchestrator touched by multiple tasks concurrently.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ErrorKind;

/// One service access key plus a short display tag for logs.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: String,
}

impl Credential {
    /// Build a credential with a safe log tag like `k2:***abcd`.
    pub fn new(index: usize, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let suffix: String = secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Self {
            id: format!("k{}:***{}", index + 1, suffix),
            secret,
        }
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent in-flight calls allowed per credential.
    pub per_credential_limit: usize,
    /// Short cooldown applied on a rate-limit failure to encourage rotation.
    pub rate_limit_cooldown: Duration,
    /// Long cooldown applied after `failure_threshold` consecutive failures.
    pub failure_cooldown: Duration,
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_credential_limit: 1,
            rate_limit_cooldown: Duration::from_secs(30),
            failure_cooldown: Duration::from_secs(600),
            failure_threshold: 3,
        }
    }
}

impl PoolConfig {
    /// Apply environment overrides.
    ///
    /// `ANALYSIS_PER_KEY_CONCURRENCY` and `ANALYSIS_RATE_LIMIT_COOLDOWN_SECS`
    /// mirror the CLI-facing knobs; invalid values fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("ANALYSIS_PER_KEY_CONCURRENCY") {
            if let Ok(n) = val.parse::<usize>() {
                config.per_credential_limit = n.max(1);
            }
        }
        if let Ok(val) = std::env::var("ANALYSIS_RATE_LIMIT_COOLDOWN_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.rate_limit_cooldown = Duration::from_secs(secs);
            }
        }
        config
    }
}

/// Internal per-credential state.
#[derive(Debug)]
struct CredentialState {
    id: String,
    available: bool,
    consecutive_failures: u32,
    total_failures: u64,
    success_count: u64,
    cooldown_until: Option<Instant>,
    last_error: Option<ErrorKind>,
    in_flight: usize,
}

impl CredentialState {
    fn new(id: String) -> Self {
        Self {
            id,
            available: true,
            consecutive_failures: 0,
            total_failures: 0,
            success_count: 0,
            cooldown_until: None,
            last_error: None,
            in_flight: 0,
        }
    }

    /// Lazily end an elapsed cooldown. Returns current availability.
    fn refresh(&mut self, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.available = true;
                self.cooldown_until = None;
                self.consecutive_failures = 0;
                tracing::info!("Credential {} cooldown ended", self.id);
            }
        }
        self.available
    }
}

/// Public snapshot of one credential's state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CredentialStatus {
    pub id: String,
    pub available: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub success_count: u64,
    pub last_error: Option<ErrorKind>,
    /// Remaining cooldown in seconds, if cooling.
    pub cooldown_remaining_secs: Option<u64>,
}

struct PoolState {
    credentials: Vec<CredentialState>,
    cursor: usize,
}

/// Round-robin credential pool with cooldown handling and slot gating.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    notify: Notify,
    config: PoolConfig,
}

impl CredentialPool {
    pub fn new(ids: Vec<String>, config: PoolConfig) -> Self {
        let credentials = ids.into_iter().map(CredentialState::new).collect();
        Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
            }),
            notify: Notify::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Never held across an await point.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Try to select and reserve a slot on the next available credential.
    ///
    /// Scans round-robin from the cursor, skipping credentials that are
    /// cooling, at their concurrency limit, or in `exclude`.
    pub fn try_select(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let now = Instant::now();
        let mut state = self.lock();
        let n = state.credentials.len();
        for _ in 0..n {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % n;
            if exclude.contains(&idx) {
                continue;
            }
            let cred = &mut state.credentials[idx];
            if cred.refresh(now) && cred.in_flight < self.config.per_credential_limit {
                cred.in_flight += 1;
                tracing::debug!("Selected credential {} ({} in flight)", cred.id, cred.in_flight);
                return Some(idx);
            }
        }
        None
    }

    /// Select a credential, waiting up to `wait` for a slot to free or a
    /// cooldown to elapse. Returns `None` when the pool stays exhausted.
    pub async fn select(&self, exclude: &HashSet<usize>, wait: Duration) -> Option<usize> {
        if exclude.len() >= self.len() {
            return None;
        }
        let deadline = Instant::now() + wait;
        loop {
            if let Some(idx) = self.try_select(exclude) {
                return Some(idx);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // Wake on release/cooldown notifications, but re-scan at least
            // every 500ms so lazily-expiring cooldowns are observed.
            let slice = (deadline - now).min(Duration::from_millis(500));
            let _ = tokio::time::timeout(slice, self.notify.notified()).await;
        }
    }

    /// Release the in-flight slot reserved by a previous selection.
    pub fn release(&self, idx: usize) {
        {
            let mut state = self.lock();
            if let Some(cred) = state.credentials.get_mut(idx) {
                cred.in_flight = cred.in_flight.saturating_sub(1);
            }
        }
        self.notify.notify_waiters();
    }

    /// Record a successful call on a credential.
    pub fn mark_success(&self, idx: usize) {
        let mut state = self.lock();
        if let Some(cred) = state.credentials.get_mut(idx) {
            cred.consecutive_failures = 0;
            cred.success_count += 1;
            cred.last_error = None;
        }
    }

    /// Record a failed call and apply the cooldown policy.
    ///
    /// Rate limits cool the credential immediately. Content blocks count in
    /// the totals but not toward consecutive failures, since the input and
    /// not the credential is at fault. Reaching the consecutive-failure
    /// threshold applies the long cooldown.
    pub fn mark_failure(&self, idx: usize, kind: ErrorKind) {
        let now = Instant::now();
        {
            let mut state = self.lock();
            let Some(cred) = state.credentials.get_mut(idx) else {
                return;
            };
            cred.total_failures += 1;
            cred.last_error = Some(kind);

            if kind != ErrorKind::ContentBlocked {
                cred.consecutive_failures += 1;
            }

            if kind == ErrorKind::RateLimited {
                cred.cooldown_until = Some(now + self.config.rate_limit_cooldown);
                cred.available = false;
                tracing::warn!(
                    "Credential {} rate limited, cooling for {:?}",
                    cred.id,
                    self.config.rate_limit_cooldown
                );
            }

            if cred.consecutive_failures >= self.config.failure_threshold {
                cred.cooldown_until = Some(now + self.config.failure_cooldown);
                cred.available = false;
                tracing::warn!(
                    "Credential {} entering cooldown after {} consecutive failures",
                    cred.id,
                    cred.consecutive_failures
                );
            }
        }
        self.notify.notify_waiters();
    }

    /// Count credentials currently selectable (ignoring slot occupancy).
    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let mut count = 0;
        for c in state.credentials.iter_mut() {
            if c.refresh(now) {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of every credential's state for status reporting.
    pub fn status_report(&self) -> Vec<CredentialStatus> {
        let now = Instant::now();
        let state = self.lock();
        state
            .credentials
            .iter()
            .map(|c| CredentialStatus {
                id: c.id.clone(),
                available: c.cooldown_until.map_or(c.available, |u| now >= u),
                consecutive_failures: c.consecutive_failures,
                total_failures: c.total_failures,
                success_count: c.success_count,
                last_error: c.last_error,
                cooldown_remaining_secs: c.cooldown_until.and_then(|until| {
                    (until > now).then(|| (until - now).as_secs())
                }),
            })
            .collect()
    }
}
