//! HTTP row API client for the hosted backend

use super::{
    Backend, RealtimeClient, Subscription, CONVERSATIONS_TABLE, MESSAGES_TABLE, PRESENCE_TABLE,
    REACTIONS_TABLE, TYPING_TABLE,
};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;

pub struct RestBackend {
    http: Client,
    rest_url: String,
    storage_url: String,
    api_key: String,
    token: Mutex<Option<String>>,
    realtime: RealtimeClient,
}

impl RestBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base = url::Url::parse(&config.backend_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::validation(
                "backend_url",
                format!("unsupported scheme {}", base.scheme()),
            ));
        }

        let http = Client::builder()
            .timeout(config.timing.request_timeout())
            .build()?;

        Ok(Self {
            http,
            rest_url: config.rest_url(),
            storage_url: config.storage_url(),
            api_key: config.api_key.clone(),
            token: Mutex::new(None),
            realtime: RealtimeClient::new(config),
        })
    }

    /// Uses a signed-in user's access token instead of the public key for row access.
    pub fn set_access_token(&self, token: Option<String>) {
        self.realtime.set_access_token(token.clone());
        *self.token.lock() = token;
    }

    fn auth_header(&self) -> String {
        let token = self.token.lock();
        format!("Bearer {}", token.as_deref().unwrap_or(&self.api_key))
    }

    fn table(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.api_key)
            .header("Authorization", self.auth_header())
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Backend {
            status: status.as_u16(),
            body,
        })
    }

    async fn rows<T: DeserializeOwned>(req: RequestBuilder) -> Result<Vec<T>> {
        let resp = Self::check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn single<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<T> {
        Self::rows(req.header("Prefer", "return=representation"))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(what.to_string()))
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let req = self
            .table(reqwest::Method::GET, MESSAGES_TABLE)
            .query(&[
                ("select", "*".to_string()),
                ("conversation_id", format!("eq.{}", conversation_id)),
                ("order", "created_at.asc".to_string()),
            ]);
        Self::rows(req).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let req = self.table(reqwest::Method::POST, MESSAGES_TABLE).json(message);
        Self::single(req, "inserted message").await
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<Message> {
        let req = self
            .table(reqwest::Method::PATCH, MESSAGES_TABLE)
            .query(&[("id", format!("eq.{}", message_id))])
            .json(&patch.to_row());
        Self::single(req, message_id).await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        let req = self
            .table(reqwest::Method::PATCH, MESSAGES_TABLE)
            .query(&[
                ("conversation_id", format!("eq.{}", conversation_id)),
                ("sender_id", format!("neq.{}", reader_id)),
                ("read", "eq.false".to_string()),
            ])
            .json(&json!({ "read": true, "read_at": read_at }));
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let req = self
            .table(reqwest::Method::GET, CONVERSATIONS_TABLE)
            .query(&[
                ("select", "*".to_string()),
                (
                    "or",
                    format!("(renter_id.eq.{0},landlord_id.eq.{0})", user_id),
                ),
                ("order", "last_message_at.desc.nullslast".to_string()),
            ]);
        Self::rows(req).await
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        let req = self
            .table(reqwest::Method::PATCH, CONVERSATIONS_TABLE)
            .query(&[("id", format!("eq.{}", conversation_id))])
            .json(&json!({ "last_message_at": at }));
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>> {
        let req = self
            .table(reqwest::Method::GET, REACTIONS_TABLE)
            .query(&[
                ("select", "id,message_id,user_id,emoji".to_string()),
                ("message_id", format!("eq.{}", message_id)),
                ("order", "created_at.asc".to_string()),
            ]);
        Self::rows(req).await
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<Reaction> {
        let req = self
            .table(reqwest::Method::POST, REACTIONS_TABLE)
            .json(&json!({
                "message_id": message_id,
                "user_id": user_id,
                "emoji": emoji
            }));
        Self::single(req, "inserted reaction").await
    }

    async fn remove_reaction(&self, reaction_id: &str) -> Result<()> {
        let req = self
            .table(reqwest::Method::DELETE, REACTIONS_TABLE)
            .query(&[("id", format!("eq.{}", reaction_id))]);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn fetch_presence(&self, user_id: &str) -> Result<Option<Presence>> {
        let req = self
            .table(reqwest::Method::GET, PRESENCE_TABLE)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("limit", "1".to_string()),
            ]);
        Ok(Self::rows(req).await?.into_iter().next())
    }

    async fn upsert_presence(&self, presence: &Presence) -> Result<()> {
        let req = self
            .table(reqwest::Method::POST, PRESENCE_TABLE)
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(presence);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn upsert_typing(&self, signal: &TypingSignal) -> Result<()> {
        let req = self
            .table(reqwest::Method::POST, TYPING_TABLE)
            .query(&[("on_conflict", "conversation_id,user_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&json!({
                "conversation_id": signal.conversation_id,
                "user_id": signal.user_id,
                "is_typing": signal.is_typing,
                "updated_at": Utc::now()
            }));
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/object/{}/{}", self.storage_url, bucket, path))
            .header("apikey", &self.api_key)
            .header("Authorization", self.auth_header())
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await?;
        Self::check(resp).await?;

        Ok(format!(
            "{}/object/public/{}/{}",
            self.storage_url, bucket, path
        ))
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        self.realtime.subscribe(topic).await
    }
}
