//! Presence and typing
//!
//! A peer counts as online only while its stored flag is set *and* its last
//! heartbeat is inside the freshness window; clients that crash never write
//! their final offline row, so the raw flag alone cannot be trusted.
//!
//! Typing is an overlay on top of presence. Remote typing flags expire on
//! their own after the typing timeout; the local flag is cleared by a
//! restartable timer.

use crate::models::{Presence, TypingSignal};
use crate::network::Backend;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPresence {
    Online,
    Offline { last_seen: Option<DateTime<Utc>> },
}

pub fn is_fresh_online(presence: &Presence, now: DateTime<Utc>, freshness: chrono::Duration) -> bool {
    presence.is_online && now.signed_duration_since(presence.last_seen) <= freshness
}

pub fn describe_last_seen(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(last_seen);
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {} ago", unit)
        } else {
            format!("{} {}s ago", n, unit)
        }
    };

    if minutes < 1 {
        "last seen just now".to_string()
    } else if hours < 1 {
        format!("last seen {}", plural(minutes, "minute"))
    } else if days < 1 {
        format!("last seen {}", plural(hours, "hour"))
    } else {
        format!("last seen {}", plural(days, "day"))
    }
}

/// Derived online state of one remote user.
///
/// Both the change feed and the periodic poll call [`observe`](Self::observe);
/// whichever row carries the newest heartbeat wins.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    freshness: chrono::Duration,
    latest: Option<Presence>,
}

impl PresenceTracker {
    pub fn new(freshness: chrono::Duration) -> Self {
        Self {
            freshness,
            latest: None,
        }
    }

    /// Records a presence row. Returns false when an equally fresh or fresher row was already known.
    pub fn observe(&mut self, presence: Presence) -> bool {
        match self.latest {
            Some(ref known) if known.last_seen > presence.last_seen => false,
            Some(ref known) if *known == presence => false,
            _ => {
                self.latest = Some(presence);
                true
            }
        }
    }

    pub fn latest(&self) -> Option<&Presence> {
        self.latest.as_ref()
    }

    pub fn state(&self, now: DateTime<Utc>) -> PeerPresence {
        match self.latest {
            Some(ref p) if is_fresh_online(p, now, self.freshness) => PeerPresence::Online,
            Some(ref p) => PeerPresence::Offline {
                last_seen: Some(p.last_seen),
            },
            None => PeerPresence::Offline { last_seen: None },
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == PeerPresence::Online
    }

    pub fn describe(&self, now: DateTime<Utc>) -> String {
        match self.state(now) {
            PeerPresence::Online => "Active now".to_string(),
            PeerPresence::Offline {
                last_seen: Some(last_seen),
            } => describe_last_seen(last_seen, now),
            PeerPresence::Offline { last_seen: None } => "offline".to_string(),
        }
    }
}

/// Remote typing flags with self-expiry.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    timeout: Duration,
    since: HashMap<String, Instant>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            since: HashMap::new(),
        }
    }

    pub fn observe(&mut self, signal: &TypingSignal) {
        if signal.is_typing {
            self.since.insert(signal.user_id.clone(), Instant::now());
        } else {
            self.since.remove(&signal.user_id);
        }
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.since
            .get(user_id)
            .map(|at| at.elapsed() < self.timeout)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.since.clear();
    }
}

/// Publishes the local user's typing flag for one conversation.
pub struct TypingNotifier {
    backend: Arc<dyn Backend>,
    conversation_id: String,
    user_id: String,
    timeout: Duration,
    clear_task: Mutex<Option<JoinHandle<()>>>,
}

impl TypingNotifier {
    pub fn new(
        backend: Arc<dyn Backend>,
        conversation_id: &str,
        user_id: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            timeout,
            clear_task: Mutex::new(None),
        }
    }

    fn signal(&self, is_typing: bool) -> TypingSignal {
        TypingSignal {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            is_typing,
        }
    }

    /// Sets the flag and (re)starts the inactivity timer.
    pub async fn keystroke(&self) {
        let backend = self.backend.clone();
        let idle = self.signal(false);
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = backend.upsert_typing(&idle).await {
                tracing::debug!("Failed to clear typing flag: {}", e);
            }
        });
        if let Some(previous) = self.clear_task.lock().replace(task) {
            previous.abort();
        }

        if let Err(e) = self.backend.upsert_typing(&self.signal(true)).await {
            tracing::debug!("Failed to publish typing flag: {}", e);
        }
    }

    /// Clears the flag immediately.
    pub async fn clear(&self) {
        self.cancel();
        if let Err(e) = self.backend.upsert_typing(&self.signal(false)).await {
            tracing::debug!("Failed to clear typing flag: {}", e);
        }
    }

    /// Drops the pending timer without writing anything.
    pub fn cancel(&self) {
        if let Some(task) = self.clear_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Writes the local user's own presence row.
pub struct PresenceHeartbeat {
    backend: Arc<dyn Backend>,
    user_id: String,
    conversation_id: Option<String>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceHeartbeat {
    pub fn new(
        backend: Arc<dyn Backend>,
        user_id: &str,
        conversation_id: Option<&str>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            interval,
            task: Mutex::new(None),
        }
    }

    fn row(&self, is_online: bool) -> Presence {
        Presence {
            user_id: self.user_id.clone(),
            is_online,
            last_seen: Utc::now(),
            conversation_id: self.conversation_id.clone(),
        }
    }

    async fn write(&self, is_online: bool) {
        if let Err(e) = self.backend.upsert_presence(&self.row(is_online)).await {
            tracing::warn!(online = is_online, "Failed to write presence: {}", e);
        }
    }

    /// Writes online now and then on every interval tick.
    pub async fn start(&self) {
        self.write(true).await;

        let backend = self.backend.clone();
        let row = self.row(true);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let beat = Presence {
                    last_seen: Utc::now(),
                    ..row.clone()
                };
                if let Err(e) = backend.upsert_presence(&beat).await {
                    tracing::warn!("Heartbeat failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Page visibility change.
    pub async fn set_visible(&self, visible: bool) {
        self.write(visible).await;
    }

    /// Stops the heartbeat and writes a final offline row. A failed write is
    /// tolerated: readers age the stale row out by freshness.
    pub async fn stop(&self) {
        self.halt();
        self.write(false).await;
    }

    fn halt(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for PresenceHeartbeat {
    fn drop(&mut self) {
        self.halt();
    }
}
