//! # Session Registry
//!
//! Process-wide table of live client sessions, keyed by session id. Each
//! entry keeps the session's start time, a bounded history of emotion
//! observations, the liveness flag used by the heartbeat sweep, and a
//! command channel back to the task that owns the client socket.
//!
//! Removing an entry ([`SessionRegistry::close`] or a liveness sweep)
//! produces a [`SessionSummary`], so a summary is produced exactly once per
//! session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::DEFAULT_HISTORY_CAPACITY;
use crate::observation::{EmotionObservation, NEUTRAL_LABEL};

/// Instructions from the registry to a session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a WebSocket ping to the client.
    Ping,
    /// The client missed a heartbeat; tear the session down.
    Terminate,
}

/// End-of-session report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub total_observations: usize,
    /// Most frequent label; ties go to the label seen first.
    /// [`NEUTRAL_LABEL`] for an empty history.
    pub dominant_label: String,
    /// Count per label in first-seen order.
    pub distribution: Vec<(String, usize)>,
}

impl SessionSummary {
    /// Summarize a history of observations.
    pub fn from_history<'a>(
        session_id: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        history: impl IntoIterator<Item = &'a EmotionObservation>,
    ) -> Self {
        let distribution = label_distribution(history.into_iter().map(|o| o.label.as_str()));
        let total_observations = distribution.iter().map(|(_, count)| count).sum();
        let dominant_label = dominant_label(&distribution).unwrap_or(NEUTRAL_LABEL).to_string();

        Self {
            session_id: session_id.into(),
            started_at,
            ended_at: Utc::now(),
            duration,
            total_observations,
            dominant_label,
            distribution,
        }
    }

    /// Count recorded for `label`.
    pub fn count_of(&self, label: &str) -> usize {
        self.distribution
            .iter()
            .find(|(l, _)| l == label)
            .map_or(0, |(_, count)| *count)
    }
}

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub alive: bool,
    pub observations: usize,
    pub last_label: Option<String>,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Sessions that answered the previous ping and were pinged again.
    pub pinged: usize,
    /// Sessions removed because they did not answer.
    pub terminated: Vec<SessionSummary>,
}

struct SessionEntry {
    started_at: DateTime<Utc>,
    started: Instant,
    history: VecDeque<EmotionObservation>,
    alive: bool,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionEntry {
    fn summarize(&self, session_id: &str) -> SessionSummary {
        SessionSummary::from_history(
            session_id,
            self.started_at,
            self.started.elapsed(),
            &self.history,
        )
    }
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    history_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a session. It starts out alive with an empty history.
    ///
    /// Returns `false` (and leaves the existing entry alone) if the id is
    /// already registered.
    pub fn register(
        &self,
        session_id: impl Into<String>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> bool {
        let mut sessions = self.lock();
        let session_id = session_id.into();
        if sessions.contains_key(&session_id) {
            return false;
        }
        sessions.insert(
            session_id,
            SessionEntry {
                started_at: Utc::now(),
                started: Instant::now(),
                history: VecDeque::with_capacity(self.history_capacity.min(64)),
                alive: true,
                commands,
            },
        );
        true
    }

    /// Drop a session without producing a summary.
    pub fn unregister(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Visit every live session. The registry is locked for the duration.
    pub fn for_each(&self, mut f: impl FnMut(&SessionSnapshot)) {
        let sessions = self.lock();
        for (id, entry) in sessions.iter() {
            f(&SessionSnapshot {
                session_id: id.clone(),
                started_at: entry.started_at,
                alive: entry.alive,
                observations: entry.history.len(),
                last_label: entry.history.back().map(|o| o.label.clone()),
            });
        }
    }

    /// Append an observation, evicting the oldest beyond capacity.
    ///
    /// Returns `false` if the session is not registered.
    pub fn record(&self, session_id: &str, observation: EmotionObservation) -> bool {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        entry.history.push_back(observation);
        while entry.history.len() > self.history_capacity {
            entry.history.pop_front();
        }
        true
    }

    /// Observations currently retained for a session, oldest first.
    pub fn history(&self, session_id: &str) -> Option<Vec<EmotionObservation>> {
        self.lock()
            .get(session_id)
            .map(|entry| entry.history.iter().cloned().collect())
    }

    /// The client answered a ping.
    pub fn mark_alive(&self, session_id: &str) -> bool {
        match self.lock().get_mut(session_id) {
            Some(entry) => {
                entry.alive = true;
                true
            }
            None => false,
        }
    }

    /// Remove a session and summarize it.
    ///
    /// `None` if it was already removed, e.g. by a liveness sweep.
    pub fn close(&self, session_id: &str) -> Option<SessionSummary> {
        let entry = self.lock().remove(session_id)?;
        Some(entry.summarize(session_id))
    }

    /// One heartbeat pass.
    ///
    /// Sessions that have not answered since the previous pass are removed
    /// and told to terminate. Every other session is marked not-alive and
    /// pinged; its pong must arrive before the next pass.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut sessions = self.lock();

        let mut dead = Vec::new();
        for (id, entry) in sessions.iter_mut() {
            if !entry.alive {
                dead.push(id.clone());
                continue;
            }
            entry.alive = false;
            if entry.commands.send(SessionCommand::Ping).is_ok() {
                report.pinged += 1;
            } else {
                // Session task is gone without closing its entry.
                dead.push(id.clone());
            }
        }

        for id in dead {
            if let Some(entry) = sessions.remove(&id) {
                let _ = entry.commands.send(SessionCommand::Terminate);
                report.terminated.push(entry.summarize(&id));
            }
        }

        report
    }
}

// ─── Summary helpers ────────────────────────────────────────────────────

/// Count labels, keeping first-seen order.
pub fn label_distribution<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for label in labels {
        match counts.iter_mut().find(|(l, _)| l == label) {
            Some((_, count)) => *count += 1,
            None => counts.push((label.to_string(), 1)),
        }
    }
    counts
}

/// Label with the highest count; the earliest wins a tie.
pub fn dominant_label(distribution: &[(String, usize)]) -> Option<&str> {
    let mut best: Option<&(String, usize)> = None;
    for entry in distribution {
        if best.is_none_or(|(_, top)| entry.1 > *top) {
            best = Some(entry);
        }
    }
    best.map(|(label, _)| label.as_str())
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
