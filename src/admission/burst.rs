//! Burst scheduling.
//!
//! A burst is a short window in which requests are admitted above the
//! steady-state per-minute limit. Bursts are bounded in size and duration,
//! separated by a cooldown, and sized from the outcome of recent bursts.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BurstConfig;

/// Bursts smaller than this are not worth starting.
pub const MIN_BURST_SIZE: u32 = 3;

/// Outcomes kept for adaptive sizing.
const HISTORY_LEN: usize = 20;

/// Outcomes considered when computing the recent success rate.
const RECENT_WINDOW: usize = 5;

/// Outcomes required before adaptive sizing kicks in.
const ADAPTIVE_MIN_HISTORY: usize = 3;

/// Why a burst ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstEndReason {
    /// The approved size was reached; the only successful ending
    Completed,
    /// The burst window elapsed first
    WindowExpired,
    /// The caller stopped the burst
    Explicit,
    /// The vendor throttled us mid-burst
    RateLimited,
}

impl BurstEndReason {
    pub fn is_success(&self) -> bool {
        matches!(self, BurstEndReason::Completed)
    }
}

/// Result of a burst proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstDecision {
    pub allowed: bool,
    pub size: u32,
    pub reason: String,
}

impl BurstDecision {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            size: 0,
            reason: reason.into(),
        }
    }
}

/// One finished burst.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstOutcome {
    pub approved_size: u32,
    pub requests: u32,
    pub reason: BurstEndReason,
}

#[derive(Debug, Clone)]
struct ActiveBurst {
    id: Uuid,
    started_at: Instant,
    approved_size: u32,
    requests: u32,
}

/// Read-only view of the burst session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstStatus {
    pub active: bool,
    pub approved_size: Option<u32>,
    pub requests_in_burst: u32,
    pub window_remaining_ms: Option<u64>,
    pub in_cooldown: bool,
    pub completed_bursts: usize,
    pub recent_success_rate: Option<f64>,
}

#[derive(Debug)]
pub struct BurstManager {
    config: BurstConfig,
    active: Option<ActiveBurst>,
    last_ended_at: Option<Instant>,
    history: VecDeque<BurstOutcome>,
}

impl BurstManager {
    pub fn new(config: BurstConfig) -> Self {
        Self {
            config,
            active: None,
            last_ended_at: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn is_bursting(&self) -> bool {
        self.active.is_some()
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        match self.last_ended_at {
            Some(ended) => now.saturating_duration_since(ended) < self.config.cooldown(),
            None => false,
        }
    }

    /// Success rate over the last few bursts, if there are any.
    pub fn recent_success_rate(&self) -> Option<f64> {
        let recent: Vec<_> = self.history.iter().rev().take(RECENT_WINDOW).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|o| o.reason.is_success()).count();
        Some(successes as f64 / recent.len() as f64)
    }

    /// Propose a burst given the current minute load.
    pub fn can_start_burst(&self, now: Instant, current_requests: usize, minute_limit: u32) -> BurstDecision {
        if !self.config.enabled {
            return BurstDecision::refuse("bursts disabled");
        }
        if self.is_bursting() {
            return BurstDecision::refuse("burst already active");
        }
        if self.in_cooldown(now) {
            return BurstDecision::refuse("cooling down after previous burst");
        }

        let remaining = (minute_limit as usize).saturating_sub(current_requests) as f64;
        let mut size = (self.config.max_burst_size as f64).min((remaining * 0.5).floor());
        let mut reason = "capacity available".to_string();

        if self.config.adaptive_sizing && self.history.len() >= ADAPTIVE_MIN_HISTORY {
            if let Some(rate) = self.recent_success_rate() {
                if rate > 0.8 {
                    size = (size * 1.2).floor().min((remaining * 0.7).floor());
                    reason = format!("grown after {:.0}% recent success", rate * 100.0);
                } else if rate < 0.5 {
                    size = (size * 0.7).floor().max(MIN_BURST_SIZE as f64);
                    reason = format!("shrunk after {:.0}% recent success", rate * 100.0);
                }
            }
        }

        let size = size.max(0.0) as u32;
        if size < MIN_BURST_SIZE {
            return BurstDecision::refuse(format!("burst size {} below minimum", size));
        }

        BurstDecision {
            allowed: true,
            size,
            reason,
        }
    }

    /// Begin a burst of `size` requests. Returns `false` if one cannot start now.
    pub fn start_burst(&mut self, now: Instant, size: u32) -> bool {
        if self.is_bursting() || self.in_cooldown(now) || size < MIN_BURST_SIZE {
            return false;
        }
        let id = Uuid::new_v4();
        info!(burst_id = %id, size = size, "Starting burst");
        self.active = Some(ActiveBurst {
            id,
            started_at: now,
            approved_size: size,
            requests: 0,
        });
        true
    }

    /// Whether the active burst can take another request.
    ///
    /// Ends the burst when its window or size is exhausted.
    pub fn can_make_burst_request(&mut self, now: Instant) -> bool {
        let Some(burst) = &self.active else {
            return false;
        };

        if burst.requests >= burst.approved_size {
            self.end_burst(now, BurstEndReason::Completed);
            return false;
        }
        if now.saturating_duration_since(burst.started_at) > self.config.window() {
            self.end_burst(now, BurstEndReason::WindowExpired);
            return false;
        }
        true
    }

    /// Side-effect free check that the active burst can take another request.
    pub fn has_room(&self, now: Instant) -> bool {
        self.active.as_ref().is_some_and(|b| {
            b.requests < b.approved_size
                && now.saturating_duration_since(b.started_at) <= self.config.window()
        })
    }

    /// Count one request against the active burst.
    pub fn record_burst_request(&mut self, now: Instant) {
        let reached = match self.active.as_mut() {
            Some(burst) => {
                burst.requests += 1;
                burst.requests >= burst.approved_size
            }
            None => return,
        };
        if reached {
            self.end_burst(now, BurstEndReason::Completed);
        }
    }

    /// End the active burst, if any.
    pub fn end_burst(&mut self, now: Instant, reason: BurstEndReason) -> Option<BurstOutcome> {
        let burst = self.active.take()?;

        // Only a burst that actually reached its size counts as completed
        let reason = if reason == BurstEndReason::Completed && burst.requests < burst.approved_size {
            BurstEndReason::Explicit
        } else {
            reason
        };

        let outcome = BurstOutcome {
            approved_size: burst.approved_size,
            requests: burst.requests,
            reason,
        };
        debug!(
            burst_id = %burst.id,
            requests = burst.requests,
            approved = burst.approved_size,
            elapsed_ms = now.saturating_duration_since(burst.started_at).as_millis() as u64,
            reason = ?reason,
            "Burst ended"
        );

        self.last_ended_at = Some(now);
        self.history.push_back(outcome.clone());
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        Some(outcome)
    }

    /// Most recent finished burst.
    pub fn last_outcome(&self) -> Option<&BurstOutcome> {
        self.history.back()
    }

    /// Time remaining in the active burst's window.
    pub fn window_remaining(&self, now: Instant) -> Option<Duration> {
        self.active.as_ref().map(|b| {
            self.config
                .window()
                .saturating_sub(now.saturating_duration_since(b.started_at))
        })
    }

    pub fn status(&self, now: Instant) -> BurstStatus {
        BurstStatus {
            active: self.is_bursting(),
            approved_size: self.active.as_ref().map(|b| b.approved_size),
            requests_in_burst: self.active.as_ref().map_or(0, |b| b.requests),
            window_remaining_ms: self.window_remaining(now).map(|d| d.as_millis() as u64),
            in_cooldown: self.in_cooldown(now),
            completed_bursts: self.history.len(),
            recent_success_rate: self.recent_success_rate(),
        }
    }
}
