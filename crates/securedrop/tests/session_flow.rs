//! Session lifecycle between managers wired through the in-memory relay

mod common;

use common::{chat_with, connect, Fixture};
use securedrop::signaling::{IceCandidate, SessionDescription};
use securedrop::{
    DataLink, DisconnectReason, Direction, Error, SecureDropConfig, SessionEvent, SessionState,
    SignalEnvelope,
};

#[tokio::test]
async fn test_handshake_reaches_chat_on_both_sides() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");

    alice.handle.initiate("bob").await.unwrap();
    assert_eq!(
        alice.handle.state(),
        SessionState::Waiting {
            target_id: "bob".to_string()
        }
    );

    let state = bob
        .wait_state(|s| matches!(s, SessionState::Confirm { .. }))
        .await;
    match state {
        SessionState::Confirm { from_id, sdp } => {
            assert_eq!(from_id, "alice");
            assert!(sdp.sdp.contains("m=application"));
        }
        other => panic!("unexpected state {:?}", other),
    }
    bob.wait_event(|e| matches!(e, SessionEvent::IncomingOffer { from_id } if from_id == "alice"))
        .await;

    bob.handle.accept_incoming().await.unwrap();
    assert_eq!(bob.handle.state(), chat_with("alice"));

    alice.wait_state(|s| *s == chat_with("bob")).await;
    alice
        .wait_event(|e| matches!(e, SessionEvent::ChannelOpen { peer_id } if peer_id == "bob"))
        .await;
    bob.wait_event(|e| matches!(e, SessionEvent::ChannelOpen { peer_id } if peer_id == "alice"))
        .await;

    assert!(fixture.network.data_link("alice").unwrap().is_open());
    assert!(fixture.network.data_link("bob").unwrap().is_open());

    // Candidates were only applied once a remote description existed
    assert_eq!(fixture.network.rejected_candidates(), 0);
}

#[tokio::test]
async fn test_initiate_then_end_releases_connection() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");
    let bob = fixture.member("bob");

    for _ in 0..3 {
        alice.handle.initiate("bob").await.unwrap();
        assert_eq!(fixture.network.live_connections("alice"), 1);

        alice.handle.end().await.unwrap();
        assert_eq!(alice.handle.state(), SessionState::Idle);
        assert_eq!(fixture.network.live_connections("alice"), 0);

        // The withdrawn offer must not leave bob waiting on a decision
        bob.wait_idle().await;
    }
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");

    alice.handle.end().await.unwrap();
    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), SessionState::Idle);
    assert!(fixture.relay.routed().is_empty());

    let mut bob = fixture.member("bob");
    let mut alice = alice;
    connect(&mut alice, &mut bob).await;

    alice.handle.end().await.unwrap();
    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), SessionState::Idle);
    let ends_from_alice = fixture
        .relay
        .routed_method("secureDrop:end")
        .iter()
        .filter(|e| e.from_id() == "alice")
        .count();
    assert_eq!(ends_from_alice, 1);
}

#[tokio::test]
async fn test_offer_during_chat_is_declined() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    let mut carol = fixture.member("carol");
    connect(&mut alice, &mut bob).await;

    carol.handle.initiate("alice").await.unwrap();
    carol
        .wait_event(|e| matches!(e, SessionEvent::Declined { peer_id } if peer_id == "alice"))
        .await;
    carol.wait_idle().await;

    assert_eq!(alice.handle.state(), chat_with("bob"));
    assert_eq!(fixture.network.live_connections("carol"), 0);
}

#[tokio::test]
async fn test_text_messages_arrive_once_in_order() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    connect(&mut alice, &mut bob).await;

    let sent = alice.handle.send_message("hello").await.unwrap();
    assert_eq!(sent.direction, Direction::Outgoing);
    assert_eq!(sent.text(), Some("hello"));

    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(m) if m.text() == Some("hello")))
        .await;
    let history = bob.handle.messages().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text(), Some("hello"));
    assert_eq!(history[0].direction, Direction::Incoming);
    assert_eq!(history[0].sender_id, "alice");

    for text in ["a", "b", "c"] {
        alice.handle.send_message(text).await.unwrap();
    }
    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(m) if m.text() == Some("c")))
        .await;

    let texts: Vec<_> = bob
        .handle
        .messages()
        .await
        .iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect();
    assert_eq!(texts, ["hello", "a", "b", "c"]);
    assert_eq!(alice.handle.messages().await.len(), 4);
}

#[tokio::test]
async fn test_end_before_answer_ignores_late_envelopes() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");
    let bob = fixture.member("bob");

    alice.handle.initiate("bob").await.unwrap();
    bob.wait_state(|s| matches!(s, SessionState::Confirm { .. }))
        .await;

    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), SessionState::Idle);

    // The offer was withdrawn before bob decided
    bob.wait_idle().await;
    assert!(matches!(
        bob.handle.accept_incoming().await,
        Err(Error::InvalidState(_))
    ));

    // An answer and a candidate from the abandoned negotiation
    fixture.relay.inject(SignalEnvelope::Answer {
        from_id: "bob".to_string(),
        to_id: "alice".to_string(),
        sdp: SessionDescription::answer("v=0\r\n"),
    });
    fixture.relay.inject(SignalEnvelope::Candidate {
        from_id: "bob".to_string(),
        to_id: "alice".to_string(),
        candidate: IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        },
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), SessionState::Idle);
    assert_eq!(fixture.network.live_connections("alice"), 0);
}

#[tokio::test]
async fn test_decline_returns_both_to_idle() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let bob = fixture.member("bob");

    alice.handle.initiate("bob").await.unwrap();
    bob.wait_state(|s| matches!(s, SessionState::Confirm { .. }))
        .await;

    bob.handle.decline_incoming().await.unwrap();
    assert_eq!(bob.handle.state(), SessionState::Idle);
    assert_eq!(fixture.network.live_connections("bob"), 0);

    alice
        .wait_event(|e| matches!(e, SessionEvent::Declined { peer_id } if peer_id == "bob"))
        .await;
    alice.wait_idle().await;
    assert_eq!(fixture.network.live_connections("alice"), 0);
    assert_eq!(fixture.relay.routed_method("secureDrop:decline").len(), 1);
}

#[tokio::test]
async fn test_caller_errors() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");
    let _bob = fixture.member("bob");

    assert!(matches!(
        alice.handle.send_message("hi").await,
        Err(Error::ChannelNotOpen(_))
    ));
    assert!(matches!(
        alice.handle.initiate("alice").await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        alice.handle.initiate("  ").await,
        Err(Error::InvalidState(_))
    ));
    assert!(alice.handle.accept_incoming().await.unwrap_err().is_caller_error());
    assert!(alice.handle.decline_incoming().await.unwrap_err().is_caller_error());

    alice.handle.initiate("bob").await.unwrap();
    assert!(matches!(
        alice.handle.initiate("carol").await,
        Err(Error::SessionBusy(_))
    ));

    // Waiting is not chat
    assert!(matches!(
        alice.handle.send_message("hi").await,
        Err(Error::ChannelNotOpen(_))
    ));
}

#[tokio::test]
async fn test_remote_end_clears_history() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    connect(&mut alice, &mut bob).await;

    alice.handle.send_message("bye soon").await.unwrap();
    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(_)))
        .await;

    alice.handle.end().await.unwrap();
    assert!(alice.handle.messages().await.is_empty());

    let seen = bob
        .collect_until(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(seen.contains(&SessionEvent::HistoryCleared));
    assert!(seen.contains(&SessionEvent::StateChanged(SessionState::Idle)));
    match seen.last() {
        Some(SessionEvent::Disconnected { peer_id, .. }) => assert_eq!(peer_id, "alice"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bob.handle.state(), SessionState::Idle);
    assert!(bob.handle.messages().await.is_empty());
    assert_eq!(fixture.network.live_connections("bob"), 0);
}

#[tokio::test]
async fn test_connection_loss_returns_to_idle() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    connect(&mut alice, &mut bob).await;

    assert_eq!(fixture.network.sever("alice"), 1);

    let event = alice
        .wait_event(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost | DisconnectReason::RemoteEnd,
            ..
        }
    ));
    alice.wait_idle().await;
    bob.wait_idle().await;
    assert_eq!(fixture.network.live_connections("alice"), 0);
    assert_eq!(fixture.network.live_connections("bob"), 0);
}

#[tokio::test]
async fn test_signaling_loss() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    let mut carol = fixture.member("carol");

    // An established session survives without the relay
    connect(&mut alice, &mut bob).await;
    fixture.relay.disconnect("alice");
    alice.handle.send_message("still here").await.unwrap();
    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(m) if m.text() == Some("still here")))
        .await;
    assert_eq!(alice.handle.state(), chat_with("bob"));

    // A pending offer does not
    carol.handle.initiate("dave").await.unwrap();
    fixture.relay.disconnect("carol");
    let event = carol
        .wait_event(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::SignalingLost,
            ..
        }
    ));
    carol.wait_idle().await;
    assert!(matches!(
        carol.handle.initiate("bob").await,
        Err(Error::TransportUnavailable(_))
    ));
}

#[tokio::test]
async fn test_offer_timeout() {
    let fixture = Fixture::new();
    let mut alice =
        fixture.member_with("alice", SecureDropConfig::default().with_offer_timeout(1));

    // Nobody named carol is online
    alice.handle.initiate("carol").await.unwrap();
    let event = alice
        .wait_event(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::TimedOut,
            ..
        }
    ));
    assert_eq!(alice.handle.state(), SessionState::Idle);
    assert_eq!(fixture.network.live_connections("alice"), 0);
}

#[tokio::test]
async fn test_offer_failure_aborts_initiation() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");
    let _bob = fixture.member("bob");

    fixture.network.fail_next_offer();
    assert!(matches!(
        alice.handle.initiate("bob").await,
        Err(Error::SdpError(_))
    ));
    assert_eq!(alice.handle.state(), SessionState::Idle);
    assert_eq!(fixture.network.live_connections("alice"), 0);
    assert!(fixture.relay.routed_method("secureDrop:offer").is_empty());

    alice.handle.initiate("bob").await.unwrap();
}

#[tokio::test]
async fn test_envelopes_from_outsiders_are_ignored() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    connect(&mut alice, &mut bob).await;

    fixture.relay.inject(SignalEnvelope::End {
        from_id: "mallory".to_string(),
        to_id: "alice".to_string(),
    });
    fixture.relay.inject(SignalEnvelope::Decline {
        from_id: "mallory".to_string(),
        to_id: "alice".to_string(),
    });

    alice.handle.send_message("ping").await.unwrap();
    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(m) if m.text() == Some("ping")))
        .await;
    assert_eq!(alice.handle.state(), chat_with("bob"));
}

#[tokio::test]
async fn test_shutdown_ends_session() {
    let fixture = Fixture::new();
    let mut alice = fixture.member("alice");
    let mut bob = fixture.member("bob");
    connect(&mut alice, &mut bob).await;

    alice.handle.shutdown().await.unwrap();
    (&mut alice.task).await.unwrap();

    bob.wait_idle().await;
    assert!(matches!(
        alice.handle.initiate("bob").await,
        Err(Error::SessionStopped(_))
    ));
    alice.handle.shutdown().await.unwrap();
}
