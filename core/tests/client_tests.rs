//! Integration tests for RentroomClient

use rentroom_core::network::Backend;
use rentroom_core::profile::{AuthUser, ProfileRow};
use rentroom_core::*;
use serde_json::json;
use std::sync::Arc;

fn client() -> (MemoryBackend, RentroomClient) {
    let backend = MemoryBackend::new();
    for (id, renter) in [("c1", "rita"), ("c2", "rosa")] {
        backend.add_conversation(Conversation {
            id: id.to_string(),
            renter_id: renter.to_string(),
            landlord_id: "lars".to_string(),
            listing_ref: None,
            last_message_at: None,
        });
    }
    let client = RentroomClient::new(
        ClientConfig::default(),
        Arc::new(backend.clone()),
        LocalStorage::open_in_memory().unwrap(),
    );
    (backend, client)
}

fn sign_in_as(client: &RentroomClient, id: &str) -> Profile {
    client
        .sign_in(ProfileSources {
            auth: Some(AuthUser {
                id: id.to_string(),
                email: Some(format!("{}@example.com", id)),
                user_metadata: json!({ "role": "landlord" }),
            }),
            row: Some(ProfileRow::default()),
            cached: None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_requires_sign_in() {
    let (_, client) = client();
    assert!(matches!(client.current_user(), Err(Error::NotLoggedIn)));
    assert!(matches!(client.conversations().await, Err(Error::NotLoggedIn)));
}

#[tokio::test]
async fn test_sign_in_persists_profile() {
    let (_, client) = client();
    let profile = sign_in_as(&client, "lars");

    assert_eq!(profile.display_name, "lars");
    assert_eq!(profile.role, Role::Landlord);
    assert_eq!(client.current_user().unwrap(), profile);

    client.sign_out().unwrap();
    assert!(client.current_user().is_err());
    assert!(client.storage().cached_user("lars").unwrap().is_some());
}

#[tokio::test]
async fn test_conversation_list_counts_unread() {
    let (backend, client) = client();
    sign_in_as(&client, "lars");

    backend
        .insert_message(&NewMessage::text("c2", "rosa", "Is the room still free?"))
        .await
        .unwrap();
    backend
        .insert_message(&NewMessage::text("c2", "lars", "Yes"))
        .await
        .unwrap();
    backend
        .insert_message(&NewMessage::text("c2", "rosa", "Can I visit?"))
        .await
        .unwrap();
    backend
        .touch_conversation("c2", chrono::Utc::now())
        .await
        .unwrap();

    let list = client.conversations().await.unwrap();
    assert_eq!(list.ordered().len(), 2);

    let first = &list.ordered()[0];
    assert_eq!(first.conversation.id, "c2");
    assert_eq!(first.peer_id, "rosa");
    assert_eq!(first.unread_count, 2);
    assert_eq!(first.last_message.as_deref(), Some("Can I visit?"));
    assert_eq!(list.total_unread(), 2);
}

#[tokio::test]
async fn test_open_conversation() {
    let (backend, client) = client();
    sign_in_as(&client, "rita");

    let missing = client.open_conversation("c2").await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let (session, _rx) = client.open_conversation("c1").await.unwrap();
    assert_eq!(session.peer_id(), "lars");
    assert!(backend.presence_of("rita").unwrap().is_online);

    session.close().await;
    assert!(!backend.presence_of("rita").unwrap().is_online);
}
