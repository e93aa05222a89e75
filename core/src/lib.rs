//! Rentroom Core Library
//!
//! Realtime messaging between renters and landlords.
//! Provides: optimistic timeline reconciliation, presence and typing,
//! reactions, backend transport, and local storage.

pub mod config;
pub mod conversations;
pub mod error;
pub mod models;
pub mod network;
pub mod presence;
pub mod profile;
pub mod reactions;
pub mod session;
pub mod storage;
pub mod store;
pub mod timeline;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use config::*;
pub use conversations::{ConversationList, ConversationSummary};
pub use error::*;
pub use models::*;
pub use network::{Backend, MemoryBackend, RestBackend, Subscription};
pub use presence::PeerPresence;
pub use profile::{Profile, ProfileSources, Role};
pub use session::{ChatSession, ReactionToggle, SendOutcome, SessionEvent};
pub use storage::{LocalStorage, Preferences, Theme};
pub use store::MessageStore;

/// Application-wide client context.
///
/// Built once at startup and handed to whatever needs the backend or the
/// local store; nothing in this crate keeps global state.
pub struct RentroomClient {
    config: ClientConfig,
    store: MessageStore,
    storage: Arc<LocalStorage>,
}

impl RentroomClient {
    pub fn new(config: ClientConfig, backend: Arc<dyn Backend>, storage: LocalStorage) -> Self {
        Self {
            config,
            store: MessageStore::new(backend),
            storage: Arc::new(storage),
        }
    }

    /// Client against the hosted backend with storage under `data_dir`.
    pub fn connect(
        config: ClientConfig,
        data_dir: &Path,
        access_token: Option<String>,
    ) -> Result<Self> {
        let backend = RestBackend::new(&config)?;
        backend.set_access_token(access_token);
        let storage = LocalStorage::open(data_dir)?;
        tracing::info!("Client ready for {}", config.backend_url);
        Ok(Self::new(config, Arc::new(backend), storage))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.store.backend()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    // ========================================================================
    // Current user
    // ========================================================================

    /// Normalizes the signed-in profile and remembers it locally.
    pub fn sign_in(&self, sources: ProfileSources) -> Result<Profile> {
        let sources = ProfileSources {
            cached: match sources.cached {
                Some(cached) => Some(cached),
                None => self.storage.current_user()?,
            },
            ..sources
        };
        let profile = Profile::normalize(sources)?;
        self.storage.set_current_user(&profile)?;
        tracing::info!("Signed in as {} ({:?})", profile.user_id, profile.role);
        Ok(profile)
    }

    pub fn current_user(&self) -> Result<Profile> {
        self.storage.current_user()?.ok_or(Error::NotLoggedIn)
    }

    pub fn sign_out(&self) -> Result<()> {
        self.storage.clear_current_user()
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub async fn conversations(&self) -> Result<ConversationList> {
        let user = self.current_user()?;
        Ok(ConversationList::load(&self.store, &user.user_id).await)
    }

    /// Mounts one conversation for the current user.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(ChatSession, mpsc::UnboundedReceiver<SessionEvent>)> {
        let user = self.current_user()?;
        let conversation = self
            .backend()
            .list_conversations(&user.user_id)
            .await?
            .into_iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;

        ChatSession::open(
            self.store.clone(),
            conversation,
            &user.user_id,
            self.config.timing.clone(),
        )
        .await
    }
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
