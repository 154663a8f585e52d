//! Activity classification.
//!
//! Derives a coarse [`ActivityState`] from output timing, with an optional
//! prompt heuristic. The policy itself is the pure function [`classify`];
//! [`ActivityTracker`] feeds it from the session's output path and reports
//! transitions so they can be pushed to viewers.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::ActivityState;
use regex::Regex;

use super::OutputObserver;

/// Trailing bytes kept for prompt detection.
const TAIL_LEN: usize = 256;

/// Characters a shell prompt commonly ends with.
const PROMPT_ENDINGS: &[char] = &['$', '#', '%', '>', '❯'];

/// CSI, OSC and two-byte escape sequences.
static ANSI_ESCAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
});

/// Tunables for [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityPolicy {
    /// Silence required before a busy session is considered idle.
    pub quiet_window: Duration,
    /// Whether a prompt-like tail shortens the quiet window.
    pub prompt_detection: bool,
    /// Quiet window used when the output ends in a prompt.
    pub prompt_settle: Duration,
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_millis(1500),
            prompt_detection: true,
            prompt_settle: Duration::from_millis(150),
        }
    }
}

impl ActivityPolicy {
    /// Quiet window that applies for the given tail.
    fn window(&self, ends_with_prompt: bool) -> Duration {
        if self.prompt_detection && ends_with_prompt {
            self.prompt_settle.min(self.quiet_window)
        } else {
            self.quiet_window
        }
    }
}

/// Observations the classifier works from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityInput {
    /// The backend has exited.
    pub exited: bool,
    /// Time since the last output chunk, `None` if nothing was produced yet.
    pub since_last_output: Option<Duration>,
    /// The last output looks like an interactive prompt.
    pub ends_with_prompt: bool,
}

/// Classifies a session's activity.
pub fn classify(input: ActivityInput, policy: &ActivityPolicy) -> ActivityState {
    if input.exited {
        return ActivityState::Exited;
    }

    match input.since_last_output {
        None => ActivityState::Idle,
        Some(elapsed) if elapsed >= policy.window(input.ends_with_prompt) => ActivityState::Idle,
        Some(_) => ActivityState::Busy,
    }
}

/// Returns true if the text, with escape sequences stripped, ends like a prompt.
pub fn looks_like_prompt(text: &str) -> bool {
    let stripped = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, ""),
        None => text.into(),
    };
    stripped
        .trim_end_matches([' ', '\t'])
        .chars()
        .last()
        .is_some_and(|c| PROMPT_ENDINGS.contains(&c))
}

/// Tracks output timing for one session and reports state transitions.
#[derive(Debug)]
pub struct ActivityTracker {
    policy: ActivityPolicy,
    last_output: Option<Instant>,
    tail: Vec<u8>,
    ends_with_prompt: bool,
    exited: bool,
    reported: ActivityState,
}

impl ActivityTracker {
    /// Creates a tracker for a session that has produced nothing yet.
    pub fn new(policy: ActivityPolicy) -> Self {
        Self {
            policy,
            last_output: None,
            tail: Vec::with_capacity(TAIL_LEN),
            ends_with_prompt: false,
            exited: false,
            reported: ActivityState::Idle,
        }
    }

    /// The state last returned by [`poll_transition`](Self::poll_transition).
    pub fn reported(&self) -> ActivityState {
        self.reported
    }

    /// Classifies the session as of `now`.
    pub fn current(&self, now: Instant) -> ActivityState {
        classify(
            ActivityInput {
                exited: self.exited,
                since_last_output: self
                    .last_output
                    .map(|at| now.saturating_duration_since(at)),
                ends_with_prompt: self.ends_with_prompt,
            },
            &self.policy,
        )
    }

    /// When a busy session would next turn idle, if it is busy.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.exited || self.reported != ActivityState::Busy {
            return None;
        }
        self.last_output
            .map(|at| at + self.policy.window(self.ends_with_prompt))
    }

    /// Returns the new state if it differs from the last reported one.
    pub fn poll_transition(&mut self, now: Instant) -> Option<ActivityState> {
        let state = self.current(now);
        if state == self.reported {
            return None;
        }
        self.reported = state;
        Some(state)
    }
}

impl OutputObserver for ActivityTracker {
    fn on_output(&mut self, chunk: &Bytes, at: Instant) {
        self.last_output = Some(at);

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > TAIL_LEN {
            let excess = self.tail.len() - TAIL_LEN;
            self.tail.drain(..excess);
        }
        self.ends_with_prompt =
            self.policy.prompt_detection && looks_like_prompt(&String::from_utf8_lossy(&self.tail));
    }

    fn on_exit(&mut self, _code: i32) {
        self.exited = true;
    }
}
