//! Poll state machine
//!
//! Pure bookkeeping for one subscription: phase, [`PollState`], the request
//! sequence number and the degraded/loading flags. The async driver owns one
//! of these and feeds it task results; nothing here touches IO or time
//! sources beyond the timestamps it is handed.
//!
//! ```text
//! Idle --start--> Polling --tick--> (UpToDate | Refreshing) --> Polling ...
//!   any --stop--> Stopped (terminal)
//! ```

use crate::domain::raw::ChangeProbe;
use crate::domain::types::{Staleness, SubscriptionKey, VersionToken};
use crate::infra::config::{BackoffMode, Config};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Lifecycle phase of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Polling,
    /// Last probe reported no change; transient until the next tick
    UpToDate,
    Refreshing,
    Stopped,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Idle => "idle",
            PollPhase::Polling => "polling",
            PollPhase::UpToDate => "up_to_date",
            PollPhase::Refreshing => "refreshing",
            PollPhase::Stopped => "stopped",
        }
    }
}

/// Per-subscription poll bookkeeping; reset on key change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollState {
    pub last_known_version: Option<VersionToken>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// What observers see through the status watch channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatus {
    pub key: Option<SubscriptionKey>,
    pub phase: PollPhase,
    pub state: PollState,
    pub degraded: bool,
    pub loading: bool,
}

impl Default for PollStatus {
    fn default() -> Self {
        Self {
            key: None,
            phase: PollPhase::Idle,
            state: PollState::default(),
            degraded: false,
            loading: false,
        }
    }
}

/// Timing knobs for the poller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub backoff: BackoffMode,
    pub max_backoff: Duration,
    pub failure_ceiling: u32,
    pub watchdog: Duration,
    pub fetch_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            backoff: BackoffMode::Exponential,
            max_backoff: Duration::from_secs(60),
            failure_ceiling: 3,
            watchdog: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms()),
            backoff: config.backoff(),
            max_backoff: Duration::from_millis(config.max_backoff_ms()),
            failure_ceiling: config.failure_ceiling().max(1),
            watchdog: Duration::from_millis(config.watchdog_ms()),
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms()),
        }
    }
}

impl PollSettings {
    /// Delay before the next tick given the current failure count
    pub fn delay_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        match self.backoff {
            BackoffMode::Fixed => self.interval,
            BackoffMode::Exponential => {
                // 2^n saturates well before u32::MAX failures matter
                let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor).min(self.max_backoff.max(self.interval))
            }
        }
    }
}

/// Refresh iff nothing is known yet or the token moved.
///
/// The token is authoritative: a `changed: true` flag with the same token
/// does not trigger a refresh.
pub fn needs_refresh(last: Option<&VersionToken>, probe: &ChangeProbe) -> bool {
    last.map_or(true, |known| known != &probe.version)
}

/// Result of applying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    /// True only on the failure that crosses the ceiling
    pub entered_degraded: bool,
    pub loading_cleared: bool,
}

/// Result of applying a success (unchanged probe or completed refresh)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessOutcome {
    /// The subscription was degraded before this success
    pub recovered: bool,
    pub loading_cleared: bool,
}

#[derive(Debug, Clone)]
pub struct PollMachine {
    key: Option<SubscriptionKey>,
    phase: PollPhase,
    state: PollState,
    /// Bumped for every new request, key change and stop
    seq: u64,
    in_flight: Option<u64>,
    degraded: bool,
    loading: bool,
    failure_ceiling: u32,
}

impl PollMachine {
    pub fn new(failure_ceiling: u32) -> Self {
        Self {
            key: None,
            phase: PollPhase::Idle,
            state: PollState::default(),
            seq: 0,
            in_flight: None,
            degraded: false,
            loading: false,
            failure_ceiling: failure_ceiling.max(1),
        }
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.key.as_ref()
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn status(&self) -> PollStatus {
        PollStatus {
            key: self.key.clone(),
            phase: self.phase,
            state: self.state.clone(),
            degraded: self.degraded,
            loading: self.loading,
        }
    }

    pub fn staleness(&self) -> Staleness {
        Staleness {
            last_success_at: self.state.last_success_at,
            degraded: self.degraded,
            consecutive_failures: self.state.consecutive_failures,
        }
    }

    /// Begin following `key`. Returns whether loading was on (and is now off).
    pub fn start(&mut self, key: SubscriptionKey) -> bool {
        let was_loading = self.loading;
        self.key = Some(key);
        self.phase = PollPhase::Polling;
        self.state = PollState::default();
        self.seq += 1;
        self.in_flight = None;
        self.degraded = false;
        self.loading = false;
        was_loading
    }

    /// Terminal. Returns whether loading was on (and is now off).
    pub fn stop(&mut self) -> bool {
        let was_loading = self.loading;
        self.phase = PollPhase::Stopped;
        self.seq += 1;
        self.in_flight = None;
        self.loading = false;
        was_loading
    }

    /// Allocate the sequence number for a new request, superseding any other
    pub fn begin_request(&mut self) -> Option<u64> {
        if self.key.is_none() || matches!(self.phase, PollPhase::Idle | PollPhase::Stopped) {
            return None;
        }
        self.seq += 1;
        self.in_flight = Some(self.seq);
        if self.phase == PollPhase::UpToDate {
            self.phase = PollPhase::Polling;
        }
        Some(self.seq)
    }

    /// Whether a task result tagged `seq` is still wanted
    pub fn accepts(&self, seq: u64) -> bool {
        self.in_flight == Some(seq) && seq == self.seq
    }

    /// Full fetch started for the current request
    pub fn on_refreshing(&mut self) {
        self.phase = PollPhase::Refreshing;
        self.loading = true;
    }

    /// Probe returned the known token
    pub fn on_unchanged(&mut self, now: DateTime<Utc>) -> SuccessOutcome {
        let outcome = self.succeed(now);
        self.phase = PollPhase::UpToDate;
        outcome
    }

    /// Refresh finished; `version` becomes the known token when present
    pub fn on_refreshed(
        &mut self,
        version: Option<VersionToken>,
        now: DateTime<Utc>,
    ) -> SuccessOutcome {
        if version.is_some() {
            self.state.last_known_version = version;
        }
        let outcome = self.succeed(now);
        self.phase = PollPhase::Polling;
        outcome
    }

    fn succeed(&mut self, now: DateTime<Utc>) -> SuccessOutcome {
        let outcome = SuccessOutcome { recovered: self.degraded, loading_cleared: self.loading };
        self.state.last_success_at = Some(now);
        self.state.consecutive_failures = 0;
        self.in_flight = None;
        self.degraded = false;
        self.loading = false;
        outcome
    }

    /// Probe or fetch failed (errors and timeouts alike)
    pub fn on_failure(&mut self) -> FailureOutcome {
        let loading_cleared = self.loading;
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.in_flight = None;
        self.loading = false;
        self.phase = PollPhase::Polling;

        let entered_degraded =
            !self.degraded && self.state.consecutive_failures >= self.failure_ceiling;
        if entered_degraded {
            self.degraded = true;
        }

        FailureOutcome {
            consecutive_failures: self.state.consecutive_failures,
            entered_degraded,
            loading_cleared,
        }
    }

    /// Watchdog expiry: clear loading without touching the request
    pub fn clear_loading(&mut self) -> bool {
        std::mem::replace(&mut self.loading, false)
    }
}
