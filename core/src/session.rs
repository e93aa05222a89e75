//! One mounted chat surface
//!
//! [`ChatSession`] owns the displayed timeline of a single conversation and
//! keeps it in sync with the backend: it loads history, feeds change-feed
//! events through the timeline reducer, tracks the peer's presence and typing
//! flag, aggregates reactions, and publishes the local user's own presence.
//!
//! The UI drives it through plain method calls and observes it through the
//! [`SessionEvent`] receiver handed out by [`ChatSession::open`]. After
//! [`ChatSession::close`] no state changes and no events are emitted, even if
//! a request that was already in flight completes later.

use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::models::*;
use crate::network::Subscription;
use crate::presence::{PeerPresence, PresenceHeartbeat, PresenceTracker, TypingNotifier, TypingTracker};
use crate::reactions::ReactionAggregator;
use crate::store::MessageStore;
use crate::timeline::{pending_message, should_follow, Action, Merge, Timeline};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// First retry after a change feed closes; doubles up to the heartbeat interval.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TimelineChanged,
    ScrollToBottom,
    /// A failed send put its text back into the input field.
    InputRestored(String),
    /// Transient user-facing notification.
    Notice(String),
    ReactionsChanged(String),
    PresenceChanged,
    TypingChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Carries the backend id of the stored message.
    Confirmed(String),
    /// Carries the text that went back into the input.
    Restored(String),
    /// Blank input, nothing was sent.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
}

struct State {
    timeline: Timeline,
    /// Deleted for self; kept out of reloads.
    hidden: HashSet<String>,
    input: String,
    unread: u32,
    reactions: ReactionAggregator,
    peer_presence: PresenceTracker,
    peer_online: bool,
    typing: TypingTracker,
    scroll_distance: f64,
    visible: bool,
}

struct Inner {
    store: MessageStore,
    conversation: Conversation,
    me: String,
    peer: String,
    timing: TimingConfig,
    state: Mutex<State>,
    mounted: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    poll: Mutex<Option<JoinHandle<()>>>,
    typing_expiry: Mutex<Option<JoinHandle<()>>>,
    notifier: TypingNotifier,
    heartbeat: PresenceHeartbeat,
}

/// Handle to a mounted conversation. Cheap to clone.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    /// Mounts the conversation for `me` and returns the session with its event stream.
    pub async fn open(
        store: MessageStore,
        conversation: Conversation,
        me: &str,
        timing: TimingConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        if !conversation.involves(me) {
            return Err(Error::Forbidden(format!(
                "{} is not a participant of conversation {}",
                me, conversation.id
            )));
        }

        let backend = store.backend().clone();
        let peer = conversation.peer_of(me).to_string();
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            notifier: TypingNotifier::new(
                backend.clone(),
                &conversation.id,
                me,
                timing.typing_timeout(),
            ),
            heartbeat: PresenceHeartbeat::new(
                backend,
                me,
                Some(&conversation.id),
                timing.heartbeat(),
            ),
            state: Mutex::new(State {
                timeline: Timeline::new(),
                hidden: HashSet::new(),
                input: String::new(),
                unread: 0,
                reactions: ReactionAggregator::new(),
                peer_presence: PresenceTracker::new(timing.presence_freshness()),
                peer_online: false,
                typing: TypingTracker::new(timing.typing_timeout()),
                scroll_distance: 0.0,
                visible: true,
            }),
            store,
            conversation,
            me: me.to_string(),
            peer,
            timing,
            mounted: AtomicBool::new(true),
            events,
            shutdown,
            pumps: Mutex::new(Vec::new()),
            poll: Mutex::new(None),
            typing_expiry: Mutex::new(None),
        });

        inner.mount().await;
        Ok((Self { inner }, rx))
    }

    pub fn conversation(&self) -> &Conversation {
        &self.inner.conversation
    }

    pub fn user_id(&self) -> &str {
        &self.inner.me
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.inner.state.lock().timeline.entries().to_vec()
    }

    pub fn input(&self) -> String {
        self.inner.state.lock().input.clone()
    }

    pub fn unread_count(&self) -> u32 {
        self.inner.state.lock().unread
    }

    pub fn reaction_groups(&self, message_id: &str) -> Vec<ReactionGroup> {
        self.inner
            .state
            .lock()
            .reactions
            .groups(message_id, &self.inner.me)
    }

    pub fn peer_presence(&self) -> PeerPresence {
        self.inner.state.lock().peer_presence.state(Utc::now())
    }

    /// "Active now", "last seen 5 minutes ago" or "offline".
    pub fn peer_status(&self) -> String {
        self.inner.state.lock().peer_presence.describe(Utc::now())
    }

    pub fn peer_typing(&self) -> bool {
        self.inner.state.lock().typing.is_typing(&self.inner.peer)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Optimistic text send. Never fails: a rejected insert removes the
    /// pending bubble and puts the text back into the input.
    pub async fn send(&self, content: &str, reply_to_id: Option<&str>) -> SendOutcome {
        let inner = &self.inner;
        if content.trim().is_empty() {
            return SendOutcome::Ignored;
        }
        if !inner.is_mounted() {
            return SendOutcome::Restored(content.to_string());
        }

        let (temp_id, reply_to) = {
            let mut state = inner.state.lock();
            let reply_to = reply_to_id
                .and_then(|id| state.timeline.get(id))
                .filter(|entry| !entry.is_pending())
                .map(|entry| entry.message().clone());
            let pending =
                pending_message(&inner.conversation.id, &inner.me, content, reply_to.as_ref());
            let temp_id = pending.id.clone();
            state.timeline.apply(Action::AddPending(pending));
            state.input.clear();
            (temp_id, reply_to)
        };
        inner.emit(SessionEvent::TimelineChanged);
        inner.emit(SessionEvent::ScrollToBottom);

        inner.notifier.clear().await;

        let result = match reply_to {
            Some(ref target) => {
                inner
                    .store
                    .create_reply_message(&inner.conversation.id, &inner.me, content, target)
                    .await
            }
            None => {
                inner
                    .store
                    .create_message(&inner.conversation.id, &inner.me, content)
                    .await
            }
        };

        match result {
            Ok(message) => {
                let id = message.id.clone();
                if inner.is_mounted() {
                    inner
                        .state
                        .lock()
                        .timeline
                        .apply(Action::Confirm { temp_id, message });
                    inner.emit(SessionEvent::TimelineChanged);
                }
                SendOutcome::Confirmed(id)
            }
            Err(e) => {
                tracing::warn!("Send to {} failed: {}", inner.conversation.id, e);
                if inner.is_mounted() {
                    {
                        let mut state = inner.state.lock();
                        state.timeline.apply(Action::Reject { temp_id });
                        state.input = content.to_string();
                    }
                    inner.emit(SessionEvent::TimelineChanged);
                    inner.emit(SessionEvent::InputRestored(content.to_string()));
                    inner.emit(SessionEvent::Notice(
                        "Message not sent. Your text is back in the input.".to_string(),
                    ));
                }
                SendOutcome::Restored(content.to_string())
            }
        }
    }

    pub async fn send_voice(&self, blob: Vec<u8>, duration_secs: u32) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_mounted()?;
        let result = inner
            .store
            .create_voice_message(&inner.conversation.id, &inner.me, blob, duration_secs)
            .await;
        inner.merge_own_upload(result, "Voice message could not be sent.")
    }

    pub async fn send_image(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_mounted()?;
        let result = inner
            .store
            .create_image_message(&inner.conversation.id, &inner.me, bytes, mime_type)
            .await;
        inner.merge_own_upload(result, "Photo could not be sent.")
    }

    /// Keystroke in the input field.
    pub async fn set_input(&self, text: &str) {
        let inner = &self.inner;
        if !inner.is_mounted() {
            return;
        }
        inner.state.lock().input = text.to_string();
        if text.is_empty() {
            inner.notifier.clear().await;
        } else {
            inner.notifier.keystroke().await;
        }
    }

    // ========================================================================
    // Reactions & deletion
    // ========================================================================

    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<ReactionToggle> {
        let inner = &self.inner;
        inner.ensure_mounted()?;
        let backend = inner.store.backend();

        let existing = inner
            .state
            .lock()
            .reactions
            .find(message_id, &inner.me, emoji)
            .cloned();

        let toggled = match existing {
            Some(reaction) => backend
                .remove_reaction(&reaction.id)
                .await
                .map(|_| {
                    if inner.is_mounted() {
                        inner.state.lock().reactions.remove(message_id, &reaction.id);
                    }
                    ReactionToggle::Removed
                }),
            None => backend
                .add_reaction(message_id, &inner.me, emoji)
                .await
                .map(|reaction| {
                    if inner.is_mounted() {
                        inner.state.lock().reactions.insert(reaction);
                    }
                    ReactionToggle::Added
                }),
        };

        match toggled {
            Ok(toggle) => {
                inner.emit(SessionEvent::ReactionsChanged(message_id.to_string()));
                Ok(toggle)
            }
            Err(e) => {
                tracing::warn!("Reaction toggle on {} failed: {}", message_id, e);
                inner.emit(SessionEvent::Notice("Reaction could not be saved.".to_string()));
                Err(e)
            }
        }
    }

    /// Hides a message on this device only.
    pub fn delete_for_self(&self, message_id: &str) -> bool {
        let inner = &self.inner;
        if !inner.is_mounted() {
            return false;
        }
        let removed = {
            let mut state = inner.state.lock();
            let merge = state
                .timeline
                .apply(Action::Remove { id: message_id.to_string() });
            let removed = matches!(merge, Merge::Removed(_));
            if removed {
                state.hidden.insert(message_id.to_string());
            }
            removed
        };
        if removed {
            inner.emit(SessionEvent::TimelineChanged);
        }
        removed
    }

    pub async fn delete_for_everyone(&self, message_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_mounted()?;
        let message = inner
            .state
            .lock()
            .timeline
            .get(message_id)
            .map(|entry| entry.message().clone())
            .ok_or_else(|| Error::NotFound(message_id.to_string()))?;

        let updated = inner.store.delete_for_everyone(&message, &inner.me).await?;
        if inner.is_mounted() {
            inner.state.lock().timeline.apply(Action::Updated(updated));
            inner.emit(SessionEvent::TimelineChanged);
        }
        Ok(())
    }

    // ========================================================================
    // Viewport
    // ========================================================================

    /// Page visibility change. Hidden writes presence offline; visible writes
    /// online and catches up on read receipts.
    pub async fn set_visible(&self, visible: bool) {
        let inner = &self.inner;
        if !inner.is_mounted() {
            return;
        }
        inner.state.lock().visible = visible;
        inner.heartbeat.set_visible(visible).await;
        if visible {
            inner.catch_up_reads().await;
        }
    }

    /// Distance in pixels between the viewport and the bottom of the history.
    pub async fn set_scroll_distance(&self, px: f64) {
        let inner = &self.inner;
        if !inner.is_mounted() {
            return;
        }
        inner.state.lock().scroll_distance = px.max(0.0);
        if px <= inner.timing.near_bottom_px {
            inner.catch_up_reads().await;
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Unmounts the conversation. Safe to call more than once.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.mounted.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = inner.shutdown.send(true);
        if let Some(task) = inner.poll.lock().take() {
            task.abort();
        }
        if let Some(task) = inner.typing_expiry.lock().take() {
            task.abort();
        }

        inner.notifier.clear().await;
        inner.heartbeat.stop().await;

        let pumps = std::mem::take(&mut *inner.pumps.lock());
        for pump in pumps {
            let _ = pump.await;
        }
        inner.state.lock().typing.clear();
        tracing::info!("Closed conversation {}", inner.conversation.id);
    }
}

impl Inner {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.is_mounted() {
            let _ = self.events.send(event);
        }
    }

    async fn mount(self: &Arc<Self>) {
        let conversation_id = self.conversation.id.clone();
        let backend = self.store.backend().clone();

        // Subscribe before loading so nothing inserted in between is missed;
        // events queue until the pumps start and duplicates are dropped by the reducer.
        let mut subscriptions = Vec::new();
        for topic in [
            Topic::Conversation(conversation_id.clone()),
            Topic::Presence(self.peer.clone()),
        ] {
            match backend.subscribe(topic.clone()).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => tracing::warn!(
                    "Live updates for {} unavailable: {}",
                    topic.channel_name(),
                    e
                ),
            }
        }

        let messages = self.store.list_messages(&conversation_id).await;
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        self.state.lock().timeline.apply(Action::Load(messages));

        for id in ids {
            let rows = self.store.list_reactions(&id).await;
            if !rows.is_empty() {
                self.state.lock().reactions.replace_all(&id, rows);
            }
        }

        if let Err(e) = self.store.mark_read(&conversation_id, &self.me).await {
            tracing::warn!("Failed to mark {} read: {}", conversation_id, e);
        }

        for subscription in subscriptions {
            let pump = self.spawn_pump(subscription);
            self.pumps.lock().push(pump);
        }

        self.heartbeat.start().await;
        self.poll_presence().await;
        let poll = self.spawn_presence_poll();
        *self.poll.lock() = Some(poll);

        tracing::info!(
            conversation = %conversation_id,
            entries = self.state.lock().timeline.len(),
            "Opened conversation as {}",
            self.me
        );
        self.emit(SessionEvent::TimelineChanged);
        self.emit(SessionEvent::ScrollToBottom);
        self.emit(SessionEvent::PresenceChanged);
    }

    /// Feeds one subscription into the session. When the feed ends while the
    /// session is still mounted, resubscribes with backoff and then re-reads
    /// what the feed may have missed.
    fn spawn_pump(self: &Arc<Self>, subscription: Subscription) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let topic = subscription.topic().clone();
        let max_backoff = self.timing.heartbeat().max(RESUBSCRIBE_DELAY);
        tokio::spawn(async move {
            let mut live = Some(subscription);
            let mut backoff = RESUBSCRIBE_DELAY;
            loop {
                match live.as_mut() {
                    Some(subscription) => tokio::select! {
                        _ = shutdown.changed() => break,
                        event = subscription.next() => {
                            let Some(inner) = weak.upgrade() else { break };
                            if !inner.is_mounted() {
                                break;
                            }
                            match event {
                                Some(event) => inner.handle(event).await,
                                None => {
                                    tracing::warn!("Live updates for {} lost", topic.channel_name());
                                    live = None;
                                    backoff = RESUBSCRIBE_DELAY;
                                    if matches!(topic, Topic::Conversation(_)) {
                                        inner.emit(SessionEvent::Notice(
                                            "Connection lost, reconnecting…".to_string(),
                                        ));
                                    }
                                }
                            }
                        }
                    },
                    None => tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {
                            let Some(inner) = weak.upgrade() else { break };
                            if !inner.is_mounted() {
                                break;
                            }
                            match inner.store.backend().subscribe(topic.clone()).await {
                                Ok(subscription) => {
                                    tracing::info!("Resubscribed to {}", topic.channel_name());
                                    live = Some(subscription);
                                    inner.resync(&topic).await;
                                }
                                Err(e) => {
                                    tracing::debug!("Resubscribe to {} failed: {}", topic.channel_name(), e);
                                    backoff = (backoff * 2).min(max_backoff);
                                }
                            }
                        }
                    },
                }
            }
            if let Some(subscription) = live {
                subscription.stop();
            }
        })
    }

    /// Catches up after a feed gap. Reload failures keep what is on screen.
    async fn resync(self: &Arc<Self>, topic: &Topic) {
        match topic {
            Topic::Presence(_) => self.poll_presence().await,
            Topic::Conversation(conversation_id) => {
                let messages = match self.store.try_list_messages(conversation_id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!("Failed to reload {}: {}", conversation_id, e);
                        return;
                    }
                };
                if !self.is_mounted() {
                    return;
                }

                let (appended, fresh_from_peer, follow, visible) = {
                    let mut state = self.state.lock();
                    let state = &mut *state;
                    let mut appended = Vec::new();
                    let mut changed = false;
                    let mut fresh_from_peer = 0;
                    for message in messages {
                        if state.hidden.contains(&message.id) {
                            continue;
                        }
                        let unchanged = match state.timeline.get(&message.id) {
                            Some(ChatEntry::Confirmed(existing)) => Some(*existing == message),
                            _ => None,
                        };
                        let merge = match unchanged {
                            Some(true) => continue,
                            Some(false) => state.timeline.apply(Action::Updated(message)),
                            None => {
                                let id = message.id.clone();
                                let from_peer = message.sender_id != self.me;
                                let merge = state.timeline.apply(Action::Incoming(message));
                                if merge == Merge::Appended {
                                    appended.push(id);
                                    if from_peer {
                                        fresh_from_peer += 1;
                                    }
                                }
                                merge
                            }
                        };
                        changed |= merge.changed();
                    }
                    let follow = state.scroll_distance <= self.timing.near_bottom_px;
                    if !(state.visible && follow) {
                        state.unread += fresh_from_peer;
                    }
                    let appended = if changed { Some(appended) } else { None };
                    (appended, fresh_from_peer, follow, state.visible)
                };

                self.emit(SessionEvent::Notice("Reconnected.".to_string()));
                let Some(appended) = appended else { return };
                self.emit(SessionEvent::TimelineChanged);
                if follow {
                    self.emit(SessionEvent::ScrollToBottom);
                }
                for id in appended {
                    self.refresh_reactions(&id).await;
                }
                if fresh_from_peer > 0 && visible && follow {
                    if let Err(e) = self.store.mark_read(&self.conversation.id, &self.me).await {
                        tracing::warn!("Failed to mark {} read: {}", self.conversation.id, e);
                    }
                }
            }
        }
    }

    fn spawn_presence_poll(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.timing.presence_poll();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_mounted() {
                    break;
                }
                inner.poll_presence().await;
            }
        })
    }

    async fn handle(self: &Arc<Self>, event: ChangeEvent) {
        match event {
            ChangeEvent::MessageInserted(message) => self.on_incoming(message).await,
            ChangeEvent::MessageUpdated(message) => {
                if message.conversation_id != self.conversation.id {
                    return;
                }
                let merge = self.state.lock().timeline.apply(Action::Updated(message));
                if merge.changed() {
                    self.emit(SessionEvent::TimelineChanged);
                }
            }
            ChangeEvent::ReactionsChanged { message_id } => self.refresh_reactions(&message_id).await,
            ChangeEvent::PresenceUpdated(presence) => {
                if presence.user_id == self.peer {
                    self.observe_presence(presence);
                }
            }
            ChangeEvent::Typing(signal) => self.on_typing(signal),
        }
    }

    async fn on_incoming(self: &Arc<Self>, message: Message) {
        if message.conversation_id != self.conversation.id {
            return;
        }
        let from_peer = message.sender_id != self.me;

        let (merge, follow, visible) = {
            let mut state = self.state.lock();
            let merge = state.timeline.apply(Action::Incoming(message));
            let follow =
                should_follow(state.scroll_distance, self.timing.near_bottom_px, !from_peer);
            if from_peer && merge.changed() && !(state.visible && follow) {
                state.unread += 1;
            }
            (merge, follow, state.visible)
        };

        if !merge.changed() {
            return;
        }
        self.emit(SessionEvent::TimelineChanged);
        if follow {
            self.emit(SessionEvent::ScrollToBottom);
        }

        // Scrolled away or hidden: the receipt waits for catch_up_reads.
        if from_peer && visible && follow {
            if let Err(e) = self.store.mark_read(&self.conversation.id, &self.me).await {
                tracing::warn!("Failed to mark {} read: {}", self.conversation.id, e);
            }
        }
    }

    async fn refresh_reactions(&self, message_id: &str) {
        if !self.state.lock().timeline.contains(message_id) {
            return;
        }
        let rows = self.store.list_reactions(message_id).await;
        if !self.is_mounted() {
            return;
        }
        self.state.lock().reactions.replace_all(message_id, rows);
        self.emit(SessionEvent::ReactionsChanged(message_id.to_string()));
    }

    async fn poll_presence(&self) {
        match self.store.backend().fetch_presence(&self.peer).await {
            Ok(Some(presence)) => {
                if self.is_mounted() {
                    self.observe_presence(presence);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Presence poll for {} failed: {}", self.peer, e),
        }
    }

    /// Emits when the row was news or the derived online state flipped
    /// (a stale row ages out without any new row arriving).
    fn observe_presence(&self, presence: Presence) {
        let changed = {
            let mut state = self.state.lock();
            let fresh = state.peer_presence.observe(presence);
            let online = state.peer_presence.is_online(Utc::now());
            let flipped = online != state.peer_online;
            state.peer_online = online;
            fresh || flipped
        };
        if changed {
            self.emit(SessionEvent::PresenceChanged);
        }
    }

    fn on_typing(self: &Arc<Self>, signal: TypingSignal) {
        if signal.conversation_id != self.conversation.id || signal.user_id == self.me {
            return;
        }
        self.state.lock().typing.observe(&signal);
        self.emit(SessionEvent::TypingChanged);

        let expiry = if signal.is_typing {
            let weak: Weak<Self> = Arc::downgrade(self);
            let timeout = self.timing.typing_timeout();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.emit(SessionEvent::TypingChanged);
                }
            }))
        } else {
            None
        };
        let previous = std::mem::replace(&mut *self.typing_expiry.lock(), expiry);
        if let Some(task) = previous {
            task.abort();
        }
    }

    fn merge_own_upload(&self, result: Result<Message>, notice: &str) -> Result<String> {
        match result {
            Ok(message) => {
                let id = message.id.clone();
                if self.is_mounted() {
                    let merge = self.state.lock().timeline.apply(Action::Incoming(message));
                    if merge.changed() {
                        self.emit(SessionEvent::TimelineChanged);
                        self.emit(SessionEvent::ScrollToBottom);
                    }
                }
                Ok(id)
            }
            Err(e) => {
                tracing::warn!("Upload to {} failed: {}", self.conversation.id, e);
                self.emit(SessionEvent::Notice(notice.to_string()));
                Err(e)
            }
        }
    }

    async fn catch_up_reads(&self) {
        let had_unread = {
            let mut state = self.state.lock();
            let had = state.unread > 0;
            state.unread = 0;
            had
        };
        if !had_unread {
            return;
        }
        if let Err(e) = self.store.mark_read(&self.conversation.id, &self.me).await {
            tracing::warn!("Failed to mark {} read: {}", self.conversation.id, e);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.mounted.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        for pump in self.pumps.get_mut().drain(..) {
            pump.abort();
        }
        if let Some(task) = self.poll.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.typing_expiry.get_mut().take() {
            task.abort();
        }
    }
}
