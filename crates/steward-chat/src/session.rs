// Per-session runtime state: bounded recent-event ring, rolling summary,
// advisory facts, and preloaded daily context. Sessions are pruned by TTL
// and an LRU cap on every access.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::json;

use steward_core::TurnEvent;
use steward_types::SessionEvent;

#[derive(Debug)]
pub struct SessionRuntime {
    pub session_id: String,
    pub recent_events: VecDeque<TurnEvent>,
    pub session_summary: Option<String>,
    pub facts: BTreeMap<String, String>,
    pub preloaded_daily_context: BTreeMap<String, String>,
    pub last_touched: Instant,
    recent_cap: usize,
}

impl SessionRuntime {
    fn new(session_id: String, recent_cap: usize) -> Self {
        Self {
            session_id,
            recent_events: VecDeque::new(),
            session_summary: None,
            facts: BTreeMap::new(),
            preloaded_daily_context: BTreeMap::new(),
            last_touched: Instant::now(),
            recent_cap: recent_cap.max(1),
        }
    }

    pub fn append_event(&mut self, event: TurnEvent) {
        while self.recent_events.len() >= self.recent_cap {
            self.recent_events.pop_front();
        }
        self.recent_events.push_back(event);
    }
}

/// In-memory session map with TTL and LRU eviction.
pub struct SessionMap {
    sessions: HashMap<String, SessionRuntime>,
    ttl: Duration,
    cap: usize,
    recent_cap: usize,
}

impl SessionMap {
    pub fn new(ttl: Duration, cap: usize, recent_cap: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
            cap: cap.max(1),
            recent_cap,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.sessions
            .retain(|_, session| session.last_touched.elapsed() < ttl);
        while self.sessions.len() > self.cap {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, session)| session.last_touched)
                .map(|(session_id, _)| session_id.clone());
            match oldest {
                Some(session_id) => {
                    self.sessions.remove(&session_id);
                }
                None => break,
            }
        }
    }

    /// Resolve or create the session, pruning stale entries first.
    pub fn touch(&mut self, session_id: &str) -> &mut SessionRuntime {
        self.prune();
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRuntime::new(session_id.to_string(), self.recent_cap));
        session.last_touched = Instant::now();
        session
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SessionRuntime> {
        self.sessions.remove(session_id)
    }
}

/// Append session events to `memory/sessions/<session_id>.jsonl`.
pub fn append_session_events(
    root: &Path,
    session_id: &str,
    events: &[SessionEvent],
) -> std::io::Result<()> {
    let dir = root.join("memory").join("sessions");
    std::fs::create_dir_all(&dir)?;
    let safe = session_id.replace('/', "_");
    let path = dir.join(format!("{safe}.jsonl"));
    let mut body = String::new();
    for event in events {
        body.push_str(
            &serde_json::to_string(event).unwrap_or_else(|_| json!({}).to_string()),
        );
        body.push('\n');
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(body.as_bytes())
}
