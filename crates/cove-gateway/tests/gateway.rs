//! Integration tests for the gateway: fan-out isolation, reconciliation
//! replay, resync signaling, and the ephemeral event paths. These drive
//! the dispatcher and registry directly through the same entry points
//! the WebSocket loop uses, without sockets.

use std::time::Duration;

use cove_gateway::dispatcher::Dispatcher;
use cove_gateway::presence::PresenceTracker;
use cove_gateway::registry::ConnectionRegistry;
use cove_store::{ConversationStore, Database};
use cove_types::events::{ClientCommand, ServerEvent};
use cove_types::models::{DeliveryState, PresenceState};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

fn setup(retention: u64, queue_capacity: usize) -> (Dispatcher, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("gateway.db")).unwrap();
    let store = ConversationStore::new(db, retention);
    let dispatcher = Dispatcher::new(
        store,
        ConnectionRegistry::new(queue_capacity),
        PresenceTracker::new(Duration::from_secs(5)),
        64 * 1024,
    );
    (dispatcher, dir)
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn message_seqs(events: &[ServerEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Message {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        })
        .collect()
}

fn text(body: &str) -> serde_json::Value {
    json!({ "kind": "text", "body": body })
}

async fn subscribe(
    dispatcher: &Dispatcher,
    conn: cove_gateway::registry::ConnectionId,
    user: Uuid,
    convo: Uuid,
    last_seen_seq: Option<u64>,
) {
    dispatcher
        .handle_command(
            conn,
            user,
            ClientCommand::Subscribe {
                conversation_id: convo,
                last_seen_seq,
            },
        )
        .await;
}

async fn send_text(
    dispatcher: &Dispatcher,
    conn: cove_gateway::registry::ConnectionId,
    user: Uuid,
    convo: Uuid,
    body: &str,
) {
    dispatcher
        .handle_command(
            conn,
            user,
            ClientCommand::Message {
                conversation_id: convo,
                payload: text(body),
            },
        )
        .await;
}

#[tokio::test]
async fn fan_out_reaches_every_subscribed_connection_in_order() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice, bob])
        .await
        .unwrap();

    let (conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    let (conn_b, mut rx_b) = dispatcher.connect(bob, "bob").await;
    // Bob's second device.
    let (conn_b2, mut rx_b2) = dispatcher.connect(bob, "bob").await;

    for (conn, user) in [(conn_a, alice), (conn_b, bob), (conn_b2, bob)] {
        subscribe(&dispatcher, conn, user, convo.id, None).await;
    }
    drain(&mut rx_a);
    drain(&mut rx_b);
    drain(&mut rx_b2);

    for i in 1..=3 {
        send_text(&dispatcher, conn_a, alice, convo.id, &format!("m{i}")).await;
    }

    // All three connections observe the same order, including the
    // sender's own connection and the sender's ack.
    let a_events = drain(&mut rx_a);
    assert_eq!(message_seqs(&a_events), vec![1, 2, 3]);
    let acks: Vec<u64> = a_events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Ack {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![1, 2, 3]);

    assert_eq!(message_seqs(&drain(&mut rx_b)), vec![1, 2, 3]);
    assert_eq!(message_seqs(&drain(&mut rx_b2)), vec![1, 2, 3]);
}

#[tokio::test]
async fn saturated_connection_is_dropped_without_affecting_others() {
    let capacity = 4;
    let (dispatcher, _dir) = setup(500, capacity);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let carol = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice, bob, carol])
        .await
        .unwrap();

    let (conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    drain(&mut rx_a);
    let (conn_b, mut rx_b) = dispatcher.connect(bob, "bob").await;
    drain(&mut rx_a);
    drain(&mut rx_b);
    let (conn_c, mut rx_c) = dispatcher.connect(carol, "carol").await;
    drain(&mut rx_a);
    drain(&mut rx_b);
    drain(&mut rx_c);

    for (conn, user) in [(conn_a, alice), (conn_b, bob), (conn_c, carol)] {
        subscribe(&dispatcher, conn, user, convo.id, None).await;
    }
    drain(&mut rx_a);
    drain(&mut rx_b);
    drain(&mut rx_c);

    // Bob's connection stops draining; Alice and Carol keep reading.
    let total = capacity + 2;
    let mut a_seqs = Vec::new();
    let mut c_seqs = Vec::new();
    for i in 1..=total {
        send_text(&dispatcher, conn_a, alice, convo.id, &format!("m{i}")).await;
        a_seqs.extend(message_seqs(&drain(&mut rx_a)));
        c_seqs.extend(message_seqs(&drain(&mut rx_c)));
    }

    let expected: Vec<u64> = (1..=total as u64).collect();
    assert_eq!(a_seqs, expected, "slow peer delayed Alice");
    assert_eq!(c_seqs, expected, "slow peer delayed Carol");

    // Bob got the events that fit, then the overflow forced his
    // connection out: the queue closes after the buffered tail.
    let mut b_count = 0;
    while let Some(event) = rx_b.recv().await {
        if matches!(event, ServerEvent::Message { .. }) {
            b_count += 1;
        }
    }
    assert!(b_count <= capacity);
    assert!(!dispatcher.registry().is_online(bob).await);
    assert!(dispatcher.registry().is_online(alice).await);
}

#[tokio::test]
async fn reconnect_replays_exactly_the_gap_then_resumes_live() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice, bob])
        .await
        .unwrap();

    let (conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    subscribe(&dispatcher, conn_a, alice, convo.id, None).await;
    for i in 1..=9 {
        send_text(&dispatcher, conn_a, alice, convo.id, &format!("m{i}")).await;
    }
    drain(&mut rx_a);

    // Bob reconnects having seen up to seq 5 of a head-9 log.
    let (conn_b, mut rx_b) = dispatcher.connect(bob, "bob").await;
    subscribe(&dispatcher, conn_b, bob, convo.id, Some(5)).await;

    // Live traffic resumes after the replay.
    send_text(&dispatcher, conn_a, alice, convo.id, "m10").await;

    let events = drain(&mut rx_b);
    assert_eq!(
        message_seqs(&events),
        vec![6, 7, 8, 9, 10],
        "replay must cover exactly the gap, in order, before live events"
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResyncRequired { .. }))
    );
}

#[tokio::test]
async fn up_to_date_subscriber_gets_no_replay() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice])
        .await
        .unwrap();

    let (conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    subscribe(&dispatcher, conn_a, alice, convo.id, None).await;
    for i in 1..=4 {
        send_text(&dispatcher, conn_a, alice, convo.id, &format!("m{i}")).await;
    }
    drain(&mut rx_a);

    let (conn_a2, mut rx_a2) = dispatcher.connect(alice, "alice").await;
    subscribe(&dispatcher, conn_a2, alice, convo.id, Some(4)).await;
    assert!(message_seqs(&drain(&mut rx_a2)).is_empty());

    send_text(&dispatcher, conn_a, alice, convo.id, "m5").await;
    assert_eq!(message_seqs(&drain(&mut rx_a2)), vec![5]);
}

#[tokio::test]
async fn gap_beyond_retention_signals_resync_not_partial_replay() {
    let (dispatcher, _dir) = setup(10, 64);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice, bob])
        .await
        .unwrap();

    for i in 1..=60 {
        dispatcher
            .store()
            .append(convo.id, alice, text(&format!("m{i}")))
            .await
            .unwrap();
    }

    let (conn_b, mut rx_b) = dispatcher.connect(bob, "bob").await;
    subscribe(&dispatcher, conn_b, bob, convo.id, Some(1)).await;

    let events = drain(&mut rx_b);
    assert!(
        message_seqs(&events).is_empty(),
        "no partial replay may precede a resync"
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResyncRequired { conversation_id } if *conversation_id == convo.id))
    );

    // Live events flow from the current head after the signal.
    let (conn_a, _rx_a) = dispatcher.connect(alice, "alice").await;
    subscribe(&dispatcher, conn_a, alice, convo.id, Some(60)).await;
    send_text(&dispatcher, conn_a, alice, convo.id, "m61").await;
    assert_eq!(message_seqs(&drain(&mut rx_b)), vec![61]);
}

#[tokio::test]
async fn non_member_subscribe_and_send_are_rejected() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let mallory = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice])
        .await
        .unwrap();

    let (conn_m, mut rx_m) = dispatcher.connect(mallory, "mallory").await;
    drain(&mut rx_m);

    subscribe(&dispatcher, conn_m, mallory, convo.id, None).await;
    let events = drain(&mut rx_m);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { code, .. } if code == "notAMember"))
    );

    send_text(&dispatcher, conn_m, mallory, convo.id, "intrusion").await;
    let events = drain(&mut rx_m);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { code, .. } if code == "notAMember"))
    );
    assert_eq!(dispatcher.store().head_seq(convo.id).await.unwrap(), 0);
}

#[tokio::test]
async fn typing_reaction_and_receipt_events_fan_out_ephemerally() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let convo = dispatcher
        .store()
        .create_conversation(vec![alice, bob])
        .await
        .unwrap();

    let (conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    let (conn_b, mut rx_b) = dispatcher.connect(bob, "bob").await;
    subscribe(&dispatcher, conn_a, alice, convo.id, None).await;
    subscribe(&dispatcher, conn_b, bob, convo.id, None).await;

    send_text(&dispatcher, conn_a, alice, convo.id, "hello").await;
    drain(&mut rx_a);
    let message_id = drain(&mut rx_b)
        .iter()
        .find_map(|e| match e {
            ServerEvent::Message { message_id, .. } => Some(*message_id),
            _ => None,
        })
        .unwrap();

    // Typing is visible to the peer and tracked for presence.
    dispatcher
        .handle_command(
            conn_a,
            alice,
            ClientCommand::Typing {
                conversation_id: convo.id,
            },
        )
        .await;
    assert!(
        drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, ServerEvent::Typing { user_id, .. } if *user_id == alice))
    );
    assert_eq!(dispatcher.presence().typing_users(convo.id), vec![alice]);

    // Reactions: set semantics, duplicate adds fan nothing out.
    let react = |remove| ClientCommand::Reaction {
        conversation_id: convo.id,
        message_id,
        emoji: "🔥".to_string(),
        remove,
    };
    dispatcher.handle_command(conn_b, bob, react(false)).await;
    dispatcher.handle_command(conn_b, bob, react(false)).await;
    let reactions: Vec<bool> = drain(&mut rx_a)
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Reaction { removed, .. } => Some(*removed),
            _ => None,
        })
        .collect();
    assert_eq!(reactions, vec![false], "duplicate add must not fan out");

    dispatcher.handle_command(conn_b, bob, react(true)).await;
    assert!(
        drain(&mut rx_a)
            .iter()
            .any(|e| matches!(e, ServerEvent::Reaction { removed: true, .. }))
    );

    // Receipts: monotonic, no-ops fan nothing out.
    let ack = |state| ClientCommand::Ack {
        conversation_id: convo.id,
        message_id,
        state,
    };
    dispatcher
        .handle_command(conn_b, bob, ack(DeliveryState::Read))
        .await;
    dispatcher
        .handle_command(conn_b, bob, ack(DeliveryState::Delivered))
        .await;
    let receipts: Vec<DeliveryState> = drain(&mut rx_a)
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Receipt { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        receipts,
        vec![DeliveryState::Read],
        "regression ack must not fan out"
    );
}

#[tokio::test]
async fn presence_transitions_follow_connection_lifecycle() {
    let (dispatcher, _dir) = setup(500, 64);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let (_conn_a, mut rx_a) = dispatcher.connect(alice, "alice").await;
    drain(&mut rx_a);

    // Bob comes online on two devices; only the first transition
    // broadcasts.
    let (conn_b1, _rx_b1) = dispatcher.connect(bob, "bob").await;
    let (conn_b2, _rx_b2) = dispatcher.connect(bob, "bob").await;
    let online: Vec<Uuid> = drain(&mut rx_a)
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Presence {
                user_id,
                state: PresenceState::Online,
            } => Some(*user_id),
            _ => None,
        })
        .collect();
    assert_eq!(online, vec![bob]);

    // Offline only when the last device disconnects.
    dispatcher.disconnect(conn_b1).await;
    assert!(dispatcher.registry().is_online(bob).await);
    assert!(drain(&mut rx_a).is_empty());

    dispatcher.disconnect(conn_b2).await;
    assert!(!dispatcher.registry().is_online(bob).await);
    assert!(
        drain(&mut rx_a)
            .iter()
            .any(|e| matches!(
                e,
                ServerEvent::Presence {
                    user_id,
                    state: PresenceState::Offline,
                } if *user_id == bob
            ))
    );

    // Unregister is idempotent.
    dispatcher.disconnect(conn_b2).await;
}
