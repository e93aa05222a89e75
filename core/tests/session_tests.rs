//! Integration tests for ChatSession against the in-process backend

use rentroom_core::network::Backend;
use rentroom_core::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.add_conversation(Conversation {
        id: "c1".to_string(),
        renter_id: "rita".to_string(),
        landlord_id: "lars".to_string(),
        listing_ref: Some("room-12".to_string()),
        last_message_at: None,
    });
    backend
}

async fn open_as(
    backend: &MemoryBackend,
    user: &str,
) -> (ChatSession, UnboundedReceiver<SessionEvent>) {
    ChatSession::open(
        MessageStore::new(Arc::new(backend.clone())),
        backend.conversation("c1").unwrap(),
        user,
        TimingConfig::default(),
    )
    .await
    .unwrap()
}

/// Lets the session's background tasks drain their queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn peer_says(backend: &MemoryBackend, content: &str) -> Message {
    backend
        .insert_message(&NewMessage::text("c1", "lars", content))
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_send_shows_pending_then_single_confirmed_bubble() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;
    backend.set_response_delay(Some(Duration::from_millis(500)));

    let mut send = Box::pin(session.send("Hello", None));
    assert!(futures::poll!(&mut send).is_pending());

    let entries = session.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_pending());
    assert_eq!(entries[0].message().content, "Hello");
    assert_eq!(session.input(), "");

    // The push lands while the insert response is still on its way.
    let SendOutcome::Confirmed(id) = send.await else {
        panic!("send failed");
    };
    settle().await;

    let entries = session.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id(), id);
    assert_eq!(entries[0].message().content, "Hello");
    assert!(!entries[0].is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_response_before_push_leaves_one_bubble() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;

    for text in ["first", "second", "first"] {
        assert!(matches!(session.send(text, None).await, SendOutcome::Confirmed(_)));
    }
    settle().await;

    let shown: Vec<String> = session.entries().iter().map(|e| e.id().to_string()).collect();
    let stored: Vec<String> = backend.messages("c1").into_iter().map(|m| m.id).collect();
    assert_eq!(stored.len(), 3);
    assert_eq!(shown, stored);
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_restores_input() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    drain(&mut rx);

    backend.set_offline(true);
    let outcome = session.send("Are you still available?", None).await;

    assert_eq!(
        outcome,
        SendOutcome::Restored("Are you still available?".to_string())
    );
    assert!(session.entries().is_empty());
    assert_eq!(session.input(), "Are you still available?");

    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::InputRestored(
        "Are you still available?".to_string()
    )));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Notice(_))));
}

#[tokio::test(start_paused = true)]
async fn test_blank_input_is_not_sent() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;

    assert_eq!(session.send("   ", None).await, SendOutcome::Ignored);
    assert!(session.entries().is_empty());
    assert!(backend.messages("c1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reaction_toggled_twice_is_gone() {
    let backend = backend();
    let msg = peer_says(&backend, "The room is still free").await;
    let (session, _rx) = open_as(&backend, "rita").await;

    assert_eq!(
        session.toggle_reaction(&msg.id, "❤️").await.unwrap(),
        ReactionToggle::Added
    );
    settle().await;
    assert_eq!(session.reaction_groups(&msg.id)[0].count, 1);
    assert!(session.reaction_groups(&msg.id)[0].user_reacted);

    assert_eq!(
        session.toggle_reaction(&msg.id, "❤️").await.unwrap(),
        ReactionToggle::Removed
    );
    settle().await;

    assert!(session.reaction_groups(&msg.id).is_empty());
    assert!(backend.list_reactions(&msg.id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_reaction_is_refetched() {
    let backend = backend();
    let msg = peer_says(&backend, "Photos attached").await;
    let (session, mut rx) = open_as(&backend, "rita").await;
    drain(&mut rx);

    backend.add_reaction(&msg.id, "lars", "👍").await.unwrap();
    settle().await;

    let groups = session.reaction_groups(&msg.id);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].emoji, "👍");
    assert!(!groups[0].user_reacted);
    assert!(drain(&mut rx).contains(&SessionEvent::ReactionsChanged(msg.id.clone())));
}

#[tokio::test(start_paused = true)]
async fn test_stale_peer_heartbeat_reads_offline() {
    let backend = backend();
    backend
        .upsert_presence(&Presence {
            user_id: "lars".to_string(),
            is_online: true,
            last_seen: chrono::Utc::now() - chrono::Duration::minutes(5),
            conversation_id: Some("c1".to_string()),
        })
        .await
        .unwrap();

    let (session, _rx) = open_as(&backend, "rita").await;

    assert!(matches!(session.peer_presence(), PeerPresence::Offline { .. }));
    assert_eq!(session.peer_status(), "last seen 5 minutes ago");
}

#[tokio::test(start_paused = true)]
async fn test_peer_presence_push_and_own_heartbeat() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;
    assert!(backend.presence_of("rita").unwrap().is_online);
    assert_eq!(session.peer_status(), "offline");

    backend
        .upsert_presence(&Presence {
            user_id: "lars".to_string(),
            is_online: true,
            last_seen: chrono::Utc::now(),
            conversation_id: Some("c1".to_string()),
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(session.peer_presence(), PeerPresence::Online);
    assert_eq!(session.peer_status(), "Active now");

    session.set_visible(false).await;
    assert!(!backend.presence_of("rita").unwrap().is_online);
    session.set_visible(true).await;
    assert!(backend.presence_of("rita").unwrap().is_online);
}

#[tokio::test(start_paused = true)]
async fn test_peer_typing_expires_after_timeout() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    drain(&mut rx);

    backend
        .upsert_typing(&TypingSignal {
            conversation_id: "c1".to_string(),
            user_id: "lars".to_string(),
            is_typing: true,
        })
        .await
        .unwrap();
    settle().await;
    assert!(session.peer_typing());
    assert_eq!(drain(&mut rx), vec![SessionEvent::TypingChanged]);

    // No stop signal is ever sent.
    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert!(!session.peer_typing());
    assert_eq!(drain(&mut rx), vec![SessionEvent::TypingChanged]);
}

#[tokio::test(start_paused = true)]
async fn test_local_typing_cleared_by_send() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;

    session.set_input("Is the deposit").await;
    assert_eq!(backend.typing_of("c1", "rita"), Some(true));
    assert_eq!(session.input(), "Is the deposit");

    session.send("Is the deposit refundable?", None).await;
    assert_eq!(backend.typing_of("c1", "rita"), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_peer_message_is_marked_read_when_visible() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    drain(&mut rx);

    let msg = peer_says(&backend, "Viewing tomorrow at 5?").await;
    settle().await;

    assert!(session.entries().iter().any(|e| e.id() == msg.id));
    assert_eq!(session.unread_count(), 0);
    assert!(backend.messages("c1")[0].read);

    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::ScrollToBottom));
}

#[tokio::test(start_paused = true)]
async fn test_unread_counts_while_scrolled_away() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    session.set_scroll_distance(400.0).await;
    drain(&mut rx);

    peer_says(&backend, "one").await;
    peer_says(&backend, "two").await;
    settle().await;

    assert_eq!(session.unread_count(), 2);
    assert!(!drain(&mut rx).contains(&SessionEvent::ScrollToBottom));
    assert!(backend.messages("c1").iter().all(|m| !m.read));

    session.set_scroll_distance(40.0).await;
    assert_eq!(session.unread_count(), 0);
    assert!(backend.messages("c1").iter().all(|m| m.read));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_feed_resubscribes_and_catches_up() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    peer_says(&backend, "Before the drop").await;
    settle().await;
    assert_eq!(session.entries().len(), 1);
    drain(&mut rx);

    backend.set_offline(true);
    backend.drop_feeds();
    settle().await;
    assert_eq!(backend.subscriber_count(), 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::Notice(text) if text.starts_with("Connection lost"))));

    // First retry fails while the backend is unreachable.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(backend.subscriber_count(), 0);

    backend.set_offline(false);
    let missed = peer_says(&backend, "Sent while you were away").await;
    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(backend.subscriber_count(), 2);
    let entries = session.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].id(), missed.id);
    assert!(backend.messages("c1").iter().all(|m| m.read));
    let events = drain(&mut rx);
    assert!(events.contains(&SessionEvent::TimelineChanged));
    assert!(events.contains(&SessionEvent::Notice("Reconnected.".to_string())));

    // Live again.
    peer_says(&backend, "Back online?").await;
    settle().await;
    assert_eq!(session.entries().len(), 3);

    session.close().await;
    assert_eq!(backend.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_keeps_messages_deleted_for_self_hidden() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;
    let spam = peer_says(&backend, "Spam").await;
    settle().await;
    assert!(session.delete_for_self(&spam.id));

    backend.drop_feeds();
    settle().await;
    peer_says(&backend, "Real question").await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let entries = session.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message().content, "Real question");
}

#[tokio::test(start_paused = true)]
async fn test_hidden_page_defers_read_receipts() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;

    session.set_visible(false).await;
    peer_says(&backend, "Are you there?").await;
    settle().await;
    assert_eq!(session.unread_count(), 1);
    assert!(!backend.messages("c1")[0].read);

    session.set_visible(true).await;
    assert_eq!(session.unread_count(), 0);
    assert!(backend.messages("c1")[0].read);
}

#[tokio::test(start_paused = true)]
async fn test_reply_carries_preview() {
    let backend = backend();
    let question = peer_says(&backend, "Do you have pets?").await;
    let (session, _rx) = open_as(&backend, "rita").await;

    let outcome = session.send("One cat", Some(&question.id)).await;
    let SendOutcome::Confirmed(id) = outcome else {
        panic!("send failed: {:?}", outcome);
    };
    settle().await;

    let entries = session.entries();
    let reply = entries.iter().find(|e| e.id() == id).unwrap().message();
    assert_eq!(reply.reply_to_id.as_deref(), Some(question.id.as_str()));
    assert_eq!(reply.reply_to.as_ref().unwrap().content, "Do you have pets?");
}

#[tokio::test(start_paused = true)]
async fn test_delete_for_everyone_and_for_self() {
    let backend = backend();
    let theirs = peer_says(&backend, "Rent is 600").await;
    let (session, _rx) = open_as(&backend, "rita").await;

    let SendOutcome::Confirmed(mine) = session.send("Too much", None).await else {
        panic!("send failed");
    };

    let err = session.delete_for_everyone(&theirs.id).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    session.delete_for_everyone(&mine).await.unwrap();
    settle().await;
    let entries = session.entries();
    let deleted = entries.iter().find(|e| e.id() == mine).unwrap().message();
    assert_eq!(deleted.content, TOMBSTONE_CONTENT);
    assert!(deleted.is_deleted());

    assert!(session.delete_for_self(&theirs.id));
    assert!(!session.entries().iter().any(|e| e.id() == theirs.id));
    assert_eq!(backend.messages("c1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_voice_and_image_messages() {
    let backend = backend();
    let (session, _rx) = open_as(&backend, "rita").await;

    let voice = session.send_voice(vec![0u8; 64], 4).await.unwrap();
    let image = session.send_image(vec![0u8; 64], "image/png").await.unwrap();
    settle().await;

    let entries = session.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id(), voice);
    assert_eq!(entries[0].message().content, VOICE_CONTENT);
    assert_eq!(entries[1].id(), image);
    assert!(entries[1].message().content.ends_with(".png"));
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_everything() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    assert_eq!(backend.subscriber_count(), 2);

    session.close().await;
    drain(&mut rx);

    assert!(!session.is_mounted());
    assert_eq!(backend.subscriber_count(), 0);
    assert!(!backend.presence_of("rita").unwrap().is_online);

    peer_says(&backend, "hello?").await;
    settle().await;
    assert!(session.entries().is_empty());
    assert!(drain(&mut rx).is_empty());

    assert!(matches!(
        session.toggle_reaction("m-404", "👍").await,
        Err(Error::SessionClosed)
    ));
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_close_is_ignored() {
    let backend = backend();
    let (session, mut rx) = open_as(&backend, "rita").await;
    backend.set_response_delay(Some(Duration::from_millis(500)));

    let mut send = Box::pin(session.send("Bye", None));
    assert!(futures::poll!(&mut send).is_pending());
    session.close().await;
    drain(&mut rx);

    assert!(matches!(send.await, SendOutcome::Confirmed(_)));
    let entries = session.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_pending());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_outsider_cannot_open() {
    let backend = backend();
    let result = ChatSession::open(
        MessageStore::new(Arc::new(backend.clone())),
        backend.conversation("c1").unwrap(),
        "mallory",
        TimingConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(Error::Forbidden(_))));
}
