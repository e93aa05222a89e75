//! Terminal front-end over the Rentroom core

use crate::config::{AppConfig, UiConfig};
use anyhow::Context;
use rentroom_core::profile::AuthUser;
use rentroom_core::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const DEMO_CONVERSATION: &str = "demo";
const DEMO_RENTER: &str = "demo-renter";
const DEMO_LANDLORD: &str = "demo-landlord";

pub async fn build_client(
    config: &AppConfig,
    data_dir: &Path,
    demo: bool,
) -> anyhow::Result<RentroomClient> {
    if !demo {
        return Ok(RentroomClient::connect(
            config.backend.clone(),
            data_dir,
            config.access_token.clone(),
        )?);
    }

    let backend = MemoryBackend::new();
    seed_demo(&backend).await?;
    spawn_demo_landlord(backend.clone()).await?;

    let client = RentroomClient::new(
        config.backend.clone(),
        Arc::new(backend),
        LocalStorage::open_in_memory()?,
    );
    client.sign_in(ProfileSources {
        auth: Some(AuthUser {
            id: DEMO_RENTER.to_string(),
            email: Some("renter@example.com".to_string()),
            user_metadata: json!({ "full_name": "Demo Renter", "role": "renter" }),
        }),
        ..Default::default()
    })?;
    Ok(client)
}

async fn seed_demo(backend: &MemoryBackend) -> anyhow::Result<()> {
    backend.add_conversation(Conversation {
        id: DEMO_CONVERSATION.to_string(),
        renter_id: DEMO_RENTER.to_string(),
        landlord_id: DEMO_LANDLORD.to_string(),
        listing_ref: Some("sunny-room-kreuzberg".to_string()),
        last_message_at: None,
    });
    let welcome = backend
        .insert_message(&NewMessage::text(
            DEMO_CONVERSATION,
            DEMO_LANDLORD,
            "Hi! Thanks for your interest in the room. Any questions?",
        ))
        .await?;
    backend
        .touch_conversation(DEMO_CONVERSATION, welcome.created_at)
        .await?;
    backend
        .upsert_presence(&Presence {
            user_id: DEMO_LANDLORD.to_string(),
            is_online: true,
            last_seen: chrono::Utc::now(),
            conversation_id: Some(DEMO_CONVERSATION.to_string()),
        })
        .await?;
    Ok(())
}

/// Simulated landlord: types for a moment, then answers every renter message.
async fn spawn_demo_landlord(backend: MemoryBackend) -> anyhow::Result<()> {
    let mut feed = backend
        .subscribe(Topic::Conversation(DEMO_CONVERSATION.to_string()))
        .await?;

    tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            let ChangeEvent::MessageInserted(msg) = event else {
                continue;
            };
            if msg.sender_id != DEMO_RENTER {
                continue;
            }

            let typing = |is_typing| TypingSignal {
                conversation_id: DEMO_CONVERSATION.to_string(),
                user_id: DEMO_LANDLORD.to_string(),
                is_typing,
            };
            let _ = backend.upsert_typing(&typing(true)).await;
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let _ = backend.upsert_typing(&typing(false)).await;

            let reply = NewMessage {
                reply_to_id: Some(msg.id.clone()),
                ..NewMessage::text(
                    DEMO_CONVERSATION,
                    DEMO_LANDLORD,
                    "Good question. The room is still available, want to book a viewing?",
                )
            };
            if let Err(e) = backend.insert_message(&reply).await {
                tracing::warn!("Demo landlord could not reply: {}", e);
            }
        }
    });
    Ok(())
}

// ============================================================================
// Account & local data
// ============================================================================

pub fn login(
    client: &RentroomClient,
    user_id: &str,
    email: Option<String>,
    name: Option<String>,
    role: Option<String>,
) -> anyhow::Result<()> {
    if let Some(ref role) = role {
        if Role::parse(role).is_none() {
            anyhow::bail!("Unknown role '{}', expected renter or landlord", role);
        }
    }

    let mut metadata = serde_json::Map::new();
    if let Some(name) = name {
        metadata.insert("full_name".into(), json!(name));
    }
    if let Some(role) = role {
        metadata.insert("role".into(), json!(role));
    }

    let profile = client.sign_in(ProfileSources {
        auth: Some(AuthUser {
            id: user_id.to_string(),
            email,
            user_metadata: Value::Object(metadata),
        }),
        ..Default::default()
    })?;

    println!(
        "Signed in as {} ({}, {:?})",
        profile.display_name, profile.user_id, profile.role
    );
    Ok(())
}

pub fn sync_listings(client: &RentroomClient, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let listings: Vec<Value> =
        serde_json::from_str(&content).context("listings file must hold a JSON array")?;

    let count = client.storage().sync_listings(listings)?;
    println!("Cached {} listings", count);
    Ok(())
}

pub fn show_listings(client: &RentroomClient) -> anyhow::Result<()> {
    let body = client.storage().cached_listings_response()?;
    let listings: Value = serde_json::from_str(&body)?;
    println!("{}", serde_json::to_string_pretty(&listings)?);
    Ok(())
}

pub fn preferences(
    client: &RentroomClient,
    theme: Option<String>,
    language: Option<String>,
) -> anyhow::Result<()> {
    let storage = client.storage();
    let mut prefs = storage.preferences()?;

    if let Some(theme) = theme {
        prefs.theme = serde_json::from_value(json!(theme.to_lowercase()))
            .with_context(|| format!("unknown theme '{}', expected light or dark", theme))?;
    }
    if let Some(language) = language {
        prefs.language = language;
    }
    storage.save_preferences(&prefs)?;

    println!("theme: {:?}, language: {}", prefs.theme, prefs.language);
    Ok(())
}

// ============================================================================
// Conversations
// ============================================================================

pub async fn list_conversations(client: &RentroomClient) -> anyhow::Result<()> {
    let list = client.conversations().await?;
    if list.ordered().is_empty() {
        println!("No conversations yet");
        return Ok(());
    }

    for item in list.ordered() {
        let unread = if item.unread_count > 0 {
            format!(" ({} unread)", item.unread_count)
        } else {
            String::new()
        };
        println!(
            "{}  with {}{}\n    {}",
            item.conversation.id,
            item.peer_id,
            unread,
            item.last_message.as_deref().unwrap_or("(no messages)")
        );
    }
    Ok(())
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Send(String),
    Reply { id: String, text: String },
    React { id: String, emoji: String },
    Delete(String),
    Hide(String),
    Image(PathBuf),
    Voice { path: PathBuf, secs: u32 },
    Scroll(f64),
    Away,
    Back,
    Who,
    Help,
    Quit,
    Invalid(String),
}

const HELP: &str = "\
/reply <id> <text>    reply to a message
/react <id> <emoji>   toggle a reaction
/delete <id>          delete your message for everyone
/hide <id>            remove a message from this screen
/image <path>         send a photo
/voice <path> <secs>  send a voice recording
/scroll <px>          pretend to scroll up by <px>
/away, /back          page hidden / visible
/who                  peer presence
/quit                 leave";

fn parse_command(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let mut parts = rest.splitn(3, ' ');
    let name = parts.next().unwrap_or_default();
    let first = parts.next().map(str::to_string);
    let second = parts.next().map(str::to_string);

    match (name, first, second) {
        ("quit" | "q", _, _) => Command::Quit,
        ("help", _, _) => Command::Help,
        ("who", _, _) => Command::Who,
        ("away", _, _) => Command::Away,
        ("back", _, _) => Command::Back,
        ("reply", Some(id), Some(text)) => Command::Reply { id, text },
        ("react", Some(id), Some(emoji)) => Command::React {
            id,
            emoji: emoji.trim().to_string(),
        },
        ("delete", Some(id), None) => Command::Delete(id),
        ("hide", Some(id), None) => Command::Hide(id),
        ("image", Some(path), None) => Command::Image(PathBuf::from(path)),
        ("voice", Some(path), Some(secs)) => match secs.trim().parse() {
            Ok(secs) => Command::Voice {
                path: PathBuf::from(path),
                secs,
            },
            Err(_) => Command::Invalid(format!("not a duration: {}", secs)),
        },
        ("scroll", Some(px), None) => match px.parse() {
            Ok(px) => Command::Scroll(px),
            Err(_) => Command::Invalid(format!("not a distance: {}", px)),
        },
        (name, _, _) => Command::Invalid(format!("unknown command /{}, try /help", name)),
    }
}

pub async fn chat(client: &RentroomClient, conversation_id: &str, ui: &UiConfig) -> anyhow::Result<()> {
    let (session, mut events) = client.open_conversation(conversation_id).await?;
    println!(
        "Chatting with {} ({}). /help for commands.",
        session.peer_id(),
        session.peer_status()
    );

    let mut view = View::new(ui.clone(), session.user_id());
    view.print_history(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => view.on_event(&session, event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Command::Quit => break,
                    command => run_command(&session, command).await,
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn run_command(session: &ChatSession, command: Command) {
    let result = async {
        match command {
            Command::Send(text) => {
                session.send(&text, None).await;
            }
            Command::Reply { id, text } => {
                session.send(&text, Some(&id)).await;
            }
            Command::React { id, emoji } => {
                session.toggle_reaction(&id, &emoji).await?;
            }
            Command::Delete(id) => session.delete_for_everyone(&id).await?,
            Command::Hide(id) => {
                if !session.delete_for_self(&id) {
                    println!("No message #{}", id);
                }
            }
            Command::Image(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let mime = mime_guess::from_path(&path).first_or_octet_stream();
                session.send_image(bytes, mime.essence_str()).await?;
            }
            Command::Voice { path, secs } => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                session.send_voice(bytes, secs).await?;
            }
            Command::Scroll(px) => session.set_scroll_distance(px).await,
            Command::Away => session.set_visible(false).await,
            Command::Back => session.set_visible(true).await,
            Command::Who => println!("{}: {}", session.peer_id(), session.peer_status()),
            Command::Help => println!("{}", HELP),
            Command::Invalid(reason) => println!("{}", reason),
            Command::Quit => {}
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        println!("! {}", e);
    }
}

/// Prints timeline changes as new lines.
struct View {
    ui: UiConfig,
    me: String,
    printed: HashMap<String, String>,
    peer_was_typing: bool,
}

impl View {
    fn new(ui: UiConfig, me: &str) -> Self {
        Self {
            ui,
            me: me.to_string(),
            printed: HashMap::new(),
            peer_was_typing: false,
        }
    }

    fn print_history(&mut self, session: &ChatSession) {
        let entries = session.entries();
        let skip = entries.len().saturating_sub(self.ui.history);
        for (i, entry) in entries.iter().enumerate() {
            let line = self.render(session, entry);
            if i >= skip {
                println!("{}", line);
            }
            self.printed.insert(entry.id().to_string(), line);
        }
    }

    fn on_event(&mut self, session: &ChatSession, event: SessionEvent) {
        match event {
            SessionEvent::TimelineChanged | SessionEvent::ReactionsChanged(_) => {
                for entry in session.entries() {
                    let line = self.render(session, &entry);
                    match self.printed.get(entry.id()) {
                        Some(previous) if *previous == line => {}
                        Some(_) => println!("~ {}", line),
                        None => println!("{}", line),
                    }
                    self.printed.insert(entry.id().to_string(), line);
                }
            }
            SessionEvent::InputRestored(text) => println!("! not sent, input was: {}", text),
            SessionEvent::Notice(notice) => println!("! {}", notice),
            SessionEvent::PresenceChanged => {
                println!("· {} is {}", session.peer_id(), session.peer_status())
            }
            SessionEvent::TypingChanged => {
                let typing = session.peer_typing();
                if typing && !self.peer_was_typing {
                    println!("· {} is typing…", session.peer_id());
                }
                self.peer_was_typing = typing;
            }
            SessionEvent::ScrollToBottom => {}
        }
    }

    fn render(&self, session: &ChatSession, entry: &ChatEntry) -> String {
        let msg = entry.message();
        let own = msg.sender_id == self.me;
        let mut line = String::new();

        if let Some(ref quoted) = msg.reply_to {
            line.push_str(&format!("  ↪ {}: {}\n", quoted.sender_id, quoted.content));
        }
        if self.ui.show_timestamps {
            let local = msg.created_at.with_timezone(&chrono::Local);
            line.push_str(&format!("[{}] ", local.format("%H:%M")));
        }

        let who = if own { "you" } else { msg.sender_id.as_str() };
        let body = match msg.message_type {
            MessageKind::Voice => format!(
                "{} ({}s) {}",
                VOICE_CONTENT,
                msg.voice_duration.unwrap_or_default(),
                msg.voice_url.as_deref().unwrap_or_default()
            ),
            MessageKind::Image => format!("📷 {}", msg.content),
            MessageKind::Text | MessageKind::Deleted => msg.content.clone(),
        };
        line.push_str(&format!("{}: {}", who, body));

        let reactions: Vec<String> = session
            .reaction_groups(&msg.id)
            .iter()
            .map(|g| format!("{} {}", g.emoji, g.count))
            .collect();
        if !reactions.is_empty() {
            line.push_str(&format!("  [{}]", reactions.join(" ")));
        }

        if own {
            let mark = match entry.status() {
                MessageStatus::Pending => "…",
                MessageStatus::Sent => "✓",
                MessageStatus::Read => "✓✓",
            };
            line.push_str(&format!("  {}", mark));
        }
        if !entry.is_pending() {
            line.push_str(&format!("  #{}", msg.id));
        }
        line
    }
}
