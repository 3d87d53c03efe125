//! Link behavior against a scripted peer: receiving, settlement, credit,
//! withdrawal and detach propagation.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::duplex;
use tokio::sync::oneshot;

use amqpwire::protocol::{conditions, DeliveryState, Detach, End, Flow, Performative, Transfer};
use amqpwire::{
    handler_fn, AmqpError, Connection, ConnectionOptions, Delivery, DeliveryContext,
    ErrorCondition, Message, Outcome,
};

use common::{init_tracing, ScriptedPeer};

const PIPE: usize = 1 << 20;

async fn connect(client: tokio::io::DuplexStream) -> Connection {
    let options = ConnectionOptions::default().container_id("link-client");
    Connection::open_with_transport(client, options).await.unwrap()
}

fn outcome_of(state: Option<DeliveryState>) -> Outcome {
    match state {
        Some(DeliveryState::Outcome(outcome)) => outcome,
        other => panic!("expected an outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_receive_and_accept() {
    init_tracing();
    let (client, server) = duplex(PIPE);

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;
        let message = Message::data("order-1").with_application_property("kind", "order");
        peer.transfer(channel, attach.handle, 0, &message).await;

        let disposition = peer.next_disposition().await;
        assert_eq!(disposition.first, 0);
        assert!(disposition.settled);
        assert_eq!(outcome_of(disposition.state), Outcome::Accepted);

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let mut receiver = session.attach_receiver("orders-in", "orders", 10).await.unwrap();

    let delivery = receiver.recv().await.unwrap();
    assert_eq!(delivery.id, 0);
    assert!(!delivery.settled);
    assert_eq!(delivery.tag, Bytes::from_static(&[0, 0, 0, 0]));
    assert_eq!(delivery.message.body_str(), Some("order-1"));
    assert!(delivery.message.application_property("kind").is_some());
    receiver.accept(&delivery).await.unwrap();

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_multi_frame_delivery_is_reassembled() {
    init_tracing();
    let (client, server) = duplex(PIPE);
    let body = vec![0x42_u8; 3000];
    let expected = Bytes::from(body.clone());

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;

        let payload = Message::data(body).to_bytes().unwrap();
        let (head, tail) = payload.split_at(1000);
        peer.send_with_payload(
            channel,
            Transfer {
                handle: attach.handle,
                delivery_id: Some(0),
                delivery_tag: Some(Bytes::from_static(b"big")),
                message_format: Some(0),
                more: true,
                ..Default::default()
            },
            head,
        )
        .await;
        peer.send_with_payload(
            channel,
            Transfer {
                handle: attach.handle,
                ..Default::default()
            },
            tail,
        )
        .await;

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let mut receiver = session.attach_receiver("big-in", "big", 5).await.unwrap();

    let delivery = receiver
        .recv_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(delivery.tag, Bytes::from_static(b"big"));
    assert_eq!(delivery.message.body_bytes(), Some(expected));

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_undecodable_message_is_rejected() {
    init_tracing();
    let (client, server) = duplex(PIPE);

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;

        // described section with an unknown descriptor
        peer.send_with_payload(
            channel,
            Transfer {
                handle: attach.handle,
                delivery_id: Some(0),
                delivery_tag: Some(Bytes::from_static(b"bad")),
                message_format: Some(0),
                ..Default::default()
            },
            &[0x00, 0x53, 0x99, 0x40],
        )
        .await;

        let disposition = peer.next_disposition().await;
        assert_eq!(disposition.first, 0);
        match outcome_of(disposition.state) {
            Outcome::Rejected(Some(error)) => {
                assert_eq!(error.condition.as_str(), conditions::DECODE_ERROR)
            }
            other => panic!("expected rejected, got {:?}", other),
        }

        peer.transfer(channel, attach.handle, 1, &Message::data("fine")).await;
        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let mut receiver = session.attach_receiver("mixed-in", "mixed", 5).await.unwrap();

    let err = receiver.recv().await.unwrap_err();
    assert!(matches!(err, AmqpError::MalformedEncoding(_)), "{:?}", err);

    let delivery = receiver.recv().await.unwrap();
    assert_eq!(delivery.id, 1);
    assert_eq!(delivery.message.body_str(), Some("fine"));

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_try_send_without_credit() {
    init_tracing();
    let (client, server) = duplex(PIPE);

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        peer.begin().await;
        peer.attach().await;
        let close = peer.expect_close().await;
        peer.close().await;
        close
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let sender = session.attach_sender("no-credit", "queue").await.unwrap();

    let err = sender.try_send(&Message::data("x")).await.unwrap_err();
    assert!(matches!(err, AmqpError::InsufficientCredit), "{:?}", err);

    connection.close().await.unwrap();
    assert_eq!(peer.await.unwrap().error, None);
}

/// A message withdrawn by `send_timeout` never reaches the peer, even after
/// credit arrives.
#[tokio::test]
async fn test_send_timeout_withdraws_message() {
    init_tracing();
    let (client, server) = duplex(PIPE);
    let (granted_tx, granted_rx) = oneshot::channel::<()>();

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;
        granted_rx.await.unwrap();
        peer.grant(channel, attach.handle, 0, 5).await;

        let (transfer, payload) = peer.next_transfer().await;
        assert_eq!(transfer.delivery_id, Some(0));
        let message = Message::decode(&payload).unwrap();
        assert_eq!(message.body_str(), Some("after"));
        peer.settle(channel, 0, 0, Outcome::Accepted).await;

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let sender = session.attach_sender("timed", "queue").await.unwrap();

    let err = sender
        .send_timeout(&Message::data("before"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, AmqpError::Timeout), "{:?}", err);

    // commands are handled in order, so the withdrawal is done once this
    // answers, and the queue is empty again
    let err = sender.try_send(&Message::data("second")).await.unwrap_err();
    assert!(matches!(err, AmqpError::InsufficientCredit), "{:?}", err);

    granted_tx.send(()).unwrap();
    let outcome = sender.send(&Message::data("after")).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_peer_detach_fails_pending_send() {
    init_tracing();
    let (client, server) = duplex(PIPE);
    let (queued_tx, queued_rx) = oneshot::channel::<()>();

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;
        queued_rx.await.unwrap();

        let error = ErrorCondition::new(conditions::DETACH_FORCED).with_description("queue deleted");
        peer.send(
            channel,
            Detach {
                handle: attach.handle,
                closed: true,
                error: Some(error),
            },
        )
        .await;

        match peer.next_performative().await {
            (_, Performative::Detach(detach)) => {
                assert!(detach.closed);
                assert_eq!(detach.error, None);
            }
            other => panic!("expected detach, got {:?}", other),
        }
        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let sender = session.attach_sender("doomed", "queue").await.unwrap();

    let pending = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send(&Message::data("stuck")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    queued_tx.send(()).unwrap();

    match pending.await.unwrap() {
        Err(AmqpError::LinkDetached(Some(error))) => {
            assert_eq!(error.condition.as_str(), conditions::DETACH_FORCED);
            assert_eq!(error.description.as_deref(), Some("queue deleted"));
        }
        other => panic!("expected detach error, got {:?}", other),
    }
    let err = sender.send(&Message::data("late")).await.unwrap_err();
    assert!(matches!(err, AmqpError::LinkDetached(_)), "{:?}", err);

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_handler_settles_each_delivery() {
    init_tracing();
    let (client, server) = duplex(PIPE);
    let (settled_tx, settled_rx) = oneshot::channel();

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;

        loop {
            if let (_, Performative::Flow(flow)) = peer.next_performative().await {
                if flow.link_credit == Some(10) {
                    break;
                }
            }
        }
        for (id, body) in ["ok", "fail", "release"].iter().enumerate() {
            peer.transfer(channel, attach.handle, id as u32, &Message::data(*body))
                .await;
        }

        let mut outcomes = HashMap::new();
        while outcomes.len() < 3 {
            let disposition = peer.next_disposition().await;
            outcomes.insert(disposition.first, outcome_of(disposition.state));
        }
        settled_tx.send(outcomes).unwrap();

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let receiver = session.attach_receiver("handled", "work", 0).await.unwrap();

    let task = receiver.spawn_handler(
        10,
        handler_fn(|delivery: Delivery, ctx: DeliveryContext| async move {
            match delivery.message.body_str() {
                Some("ok") => Ok(()),
                Some("release") => ctx.release().await,
                _ => Err(AmqpError::InvalidState("cannot process".into())),
            }
        }),
    );

    let outcomes = tokio::time::timeout(Duration::from_secs(5), settled_rx)
        .await
        .expect("deliveries never settled")
        .unwrap();
    connection.close().await.unwrap();
    peer.await.unwrap();
    assert_eq!(outcomes[&0], Outcome::Accepted);
    assert_eq!(outcomes[&2], Outcome::Released);
    match &outcomes[&1] {
        Outcome::Rejected(Some(error)) => {
            assert_eq!(error.condition.as_str(), conditions::ILLEGAL_STATE)
        }
        other => panic!("expected rejected, got {:?}", other),
    }

    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_drain_completes_when_credit_is_used_up() {
    init_tracing();
    let (client, server) = duplex(PIPE);

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        let attach = peer.attach().await;

        let flow = loop {
            if let (_, Performative::Flow(flow)) = peer.next_performative().await {
                if flow.drain {
                    break flow;
                }
            }
        };
        assert_eq!(flow.link_credit, Some(5));

        // nothing to send: advance the delivery count over the credit
        peer.send(
            channel,
            Flow {
                next_incoming_id: Some(0),
                incoming_window: 2048,
                next_outgoing_id: 0,
                outgoing_window: 2048,
                handle: Some(attach.handle),
                delivery_count: Some(5),
                link_credit: Some(0),
                drain: true,
                ..Default::default()
            },
        )
        .await;

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let receiver = session.attach_receiver("drainer", "queue", 5).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), receiver.drain())
        .await
        .expect("drain never completed")
        .unwrap();

    connection.close().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_session_end_releases_links() {
    init_tracing();
    let (client, server) = duplex(PIPE);

    let peer = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(server).await;
        let channel = peer.begin().await;
        peer.attach().await;

        loop {
            match peer.next_performative().await {
                (c, Performative::End(end)) => {
                    assert_eq!(c, channel);
                    assert_eq!(end.error, None);
                    break;
                }
                (_, Performative::Flow(_)) => continue,
                other => panic!("expected end, got {:?}", other),
            }
        }
        peer.send(channel, End { error: None }).await;

        peer.expect_close().await;
        peer.close().await;
    });

    let connection = connect(client).await;
    let session = connection.begin_session().await.unwrap();
    let mut receiver = session.attach_receiver("short-lived", "queue", 5).await.unwrap();

    session.end().await.unwrap();
    let err = receiver.recv().await.unwrap_err();
    assert!(matches!(err, AmqpError::SessionEnded(None)), "{:?}", err);
    assert!(session.attach_sender("too-late", "queue").await.is_err());

    connection.close().await.unwrap();
    peer.await.unwrap();
}
