//! Agent lifecycle state machine.
//!
//! One globally shared current state behind a lock, with an explicit
//! transition table. Exit callbacks run while the lock is held; enter
//! callbacks run after it is released so a callback may read the machine
//! without deadlocking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};

const HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Boot,
    Idle,
    Listening,
    Analyzing,
    Navigating,
    Betting,
    Recovering,
    Maintenance,
    Error,
    Shutdown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Boot => "BOOT",
            AgentState::Idle => "IDLE",
            AgentState::Listening => "LISTENING",
            AgentState::Analyzing => "ANALYZING",
            AgentState::Navigating => "NAVIGATING",
            AgentState::Betting => "BETTING",
            AgentState::Recovering => "RECOVERING",
            AgentState::Maintenance => "MAINTENANCE",
            AgentState::Error => "ERROR",
            AgentState::Shutdown => "SHUTDOWN",
        }
    }

    /// Legal target states. SHUTDOWN is terminal: its set is empty and only
    /// `force_state` can leave it.
    fn allowed_targets(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Boot => &[Idle, Error, Shutdown],
            Idle => &[Listening, Maintenance, Error, Shutdown],
            Listening => &[Analyzing, Idle, Recovering, Error, Shutdown],
            Analyzing => &[Navigating, Listening, Error, Shutdown],
            Navigating => &[Betting, Listening, Recovering, Error, Shutdown],
            Betting => &[Listening, Recovering, Error, Shutdown],
            Recovering => &[Listening, Idle, Error, Shutdown],
            Maintenance => &[Idle, Error, Shutdown],
            Error => &[Recovering, Maintenance, Shutdown],
            Shutdown => &[],
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub forced: bool,
    pub at: DateTime<Utc>,
}

type Callback = Box<dyn Fn(AgentState, AgentState) + Send + Sync>;

struct Inner {
    current: AgentState,
    history: VecDeque<TransitionRecord>,
}

pub struct AgentStateMachine {
    inner: Mutex<Inner>,
    exit_callbacks: Mutex<Vec<Callback>>,
    enter_callbacks: Mutex<Vec<Callback>>,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: AgentState::Boot,
                history: VecDeque::with_capacity(HISTORY_CAP),
            }),
            exit_callbacks: Mutex::new(Vec::new()),
            enter_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> AgentState {
        self.inner.lock().current
    }

    /// Register a callback fired while leaving a state (runs under the state
    /// lock; keep it short).
    pub fn on_exit(&self, callback: impl Fn(AgentState, AgentState) + Send + Sync + 'static) {
        self.exit_callbacks.lock().push(Box::new(callback));
    }

    /// Register a callback fired after entering a state (runs outside the
    /// state lock, so it may call back into the machine).
    pub fn on_enter(&self, callback: impl Fn(AgentState, AgentState) + Send + Sync + 'static) {
        self.enter_callbacks.lock().push(Box::new(callback));
    }

    /// Attempt a table-validated transition. Illegal moves are rejected with
    /// a warning and leave the current state untouched.
    pub fn transition(&self, to: AgentState) -> bool {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.current;
            if !from.allowed_targets().contains(&to) {
                warn!(%from, %to, "illegal state transition rejected");
                return false;
            }

            for cb in self.exit_callbacks.lock().iter() {
                cb(from, to);
            }

            inner.current = to;
            Self::record(&mut inner, from, to, false);
            from
        };

        info!(%from, %to, "state transition");
        for cb in self.enter_callbacks.lock().iter() {
            cb(from, to);
        }
        true
    }

    /// Bypass the transition table for emergency recovery. Always audited at
    /// warn level.
    pub fn force_state(&self, to: AgentState) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.current;
            inner.current = to;
            Self::record(&mut inner, from, to, true);
            from
        };

        warn!(%from, %to, "state forced outside transition table");
        for cb in self.enter_callbacks.lock().iter() {
            cb(from, to);
        }
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    fn record(inner: &mut Inner, from: AgentState, to: AgentState, forced: bool) {
        if inner.history.len() >= HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(TransitionRecord {
            from,
            to,
            forced,
            at: Utc::now(),
        });
    }
}
