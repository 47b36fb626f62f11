/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::*;
use crate::config::*;
use crate::error::MqttError;
use crate::mqtt::*;
use crate::store::MemoryStorageBackend;
use crate::testing::*;
use crate::transport::*;

use assert_matches::assert_matches;

use std::rc::Rc;

fn persistent_options() -> ConnectOptions {
    ConnectOptions::builder().with_clean_session(false).build()
}

fn subscribe_options(qos: QualityOfService) -> SubscribeOptions {
    SubscribeOptions::builder().with_qos(qos).build()
}

fn inbound_publish(packet_id: u16, topic: &str, qos: QualityOfService) -> MqttPacket {
    MqttPacket::Publish(PublishPacket {
        packet_id,
        topic: topic.to_string(),
        payload: "inbound".as_bytes().to_vec(),
        qos,
        ..Default::default()
    })
}

fn delivered_destinations(events: &EventLog) -> Vec<String> {
    events.borrow().iter().filter_map(|event| {
        match event {
            RecordedEvent::MessageDelivered(message) => { Some(message.destination().to_string()) }
            _ => { None }
        }
    }).collect()
}

fn arrived_destinations(events: &EventLog) -> Vec<String> {
    events.borrow().iter().filter_map(|event| {
        match event {
            RecordedEvent::MessageArrived(message) => { Some(message.destination().to_string()) }
            _ => { None }
        }
    }).collect()
}

fn verify_no_tracked_packets(client: &MqttClient) {
    client.with_state(|state| {
        assert_eq!(0, state.queued_packet_count());
        assert_eq!(0, state.sent_packet_count());
        assert_eq!(0, state.allocated_packet_id_count());
    });
}

#[test]
fn connect_success() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let result = fixture.connect(&client, ConnectOptions::default(), false);
    assert_matches!(result, Ok(ConnectionSuccess { session_present: false }));
    assert_eq!(ClientStatus::Connected, client.status());

    let (_, _, connect) = fixture.transport.borrow().connection_subscription(client.key()).unwrap();
    assert_eq!(client.client_id(), connect.client_id);
    assert!(connect.clean_session);
}

#[test]
fn connect_while_connected_is_invalid_state() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    assert_matches!(client.connect(ConnectOptions::default()).err(), Some(MqttError::InvalidState(_)));
    assert_eq!(ClientStatus::Connected, client.status());
}

#[test]
fn connect_rejected_by_connack() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    let events = record_events(&client);

    let connect_future = client.connect(ConnectOptions::default()).unwrap();
    let (tag, _) = fixture.connection_of(&client);
    fixture.broker_sends(&client, MqttPacket::Connack(ConnackPacket { session_present: false, return_code: ConnectReturnCode::NotAuthorized }));

    assert_matches!(poll_once(connect_future), Some(Err(MqttError::BrokerRejection(_))));
    assert_eq!(ClientStatus::Disconnected, client.status());
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));

    // a connection that never completed is not reported lost
    assert!(events.borrow().is_empty());
}

#[test]
fn connect_denied_by_server() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let connect_future = client.connect(ConnectOptions::default()).unwrap();
    fixture.connection_event(&client, SubscriptionEvent::Failed { code: -1, message: Some("denied".to_string()) });

    let result = poll_once(connect_future).unwrap();
    assert_matches!(&result, Err(MqttError::NotAuthorized(_)));
    assert!(result.unwrap_err().is_authorization_denial());
    assert_eq!(ClientStatus::Disconnected, client.status());
}

#[test]
fn connect_with_password_but_no_username_is_invalid() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let options = ConnectOptions::builder().with_password("secret".as_bytes()).build();
    assert_matches!(client.connect(options).err(), Some(MqttError::InvalidArgument(_)));
    assert_eq!(ClientStatus::Disconnected, client.status());
    assert!(fixture.transport.borrow().subscriptions.is_empty());
}

#[test]
fn duplicate_client_id_is_rejected() {
    let mut fixture = SessionTestFixture::new();
    let _client = fixture.session.create_client("broker", Some("twin")).unwrap();

    assert_matches!(fixture.session.create_client("broker", Some("twin")), Err(MqttError::InvalidArgument(_)));
    assert!(fixture.session.create_client("other-broker", Some("twin")).is_ok());
}

#[test]
fn disconnect_sends_disconnect_then_resets() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    assert!(client.disconnect().is_ok());
    assert_eq!(ClientStatus::Disconnecting, client.status());
    assert_matches!(client.disconnect(), Err(MqttError::InvalidState(_)));

    let packets = fixture.process_sends();
    assert_eq!(1, packets.len());
    assert_matches!(packets[0], MqttPacket::Disconnect(_));

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert!(events.borrow().is_empty());
    assert_matches!(client.disconnect(), Err(MqttError::InvalidState(_)));
}

#[test]
fn disconnect_while_connecting_fails_connect() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let connect_future = client.connect(ConnectOptions::default()).unwrap();
    assert!(client.disconnect().is_ok());

    assert_matches!(poll_once(connect_future), Some(Err(MqttError::UserInitiatedDisconnect(_))));
    assert_eq!(ClientStatus::Disconnected, client.status());
}

#[test]
fn send_while_disconnected_is_invalid_state() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    assert_matches!(client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false), Err(MqttError::InvalidState(_)));
    assert!(fixture.take_sends().is_empty());
    verify_no_tracked_packets(&client);
}

#[test]
fn send_to_wildcard_destination_is_invalid() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    assert_matches!(client.publish("a/#", "hello".as_bytes(), QualityOfService::AtMostOnce, false), Err(MqttError::InvalidArgument(_)));
    assert!(fixture.take_sends().is_empty());
}

#[test]
fn qos0_publish_delivered_when_processed() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtMostOnce, false).unwrap();

    let sends = fixture.take_sends();
    assert_eq!(1, sends.len());
    assert_matches!(&sends[0].packet.packet, MqttPacket::Publish(publish) => {
        assert_eq!(0, publish.packet_id);
        assert_eq!("a/b", publish.topic);
    });
    assert!(events.borrow().is_empty());

    fixture.complete_send(&sends[0], SendOutcome::Processed);
    assert_eq!(vec!["a/b".to_string()], delivered_destinations(&events));
    verify_no_tracked_packets(&client);
}

#[test]
fn qos1_publish_round_trip() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();

    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Publish(publish)] => {
        assert_eq!(1, publish.packet_id);
        assert!(!publish.duplicate);
    });

    // processed by the transport but not yet acknowledged by the broker
    assert!(delivered_destinations(&events).is_empty());
    client.with_state(|state| assert_eq!(1, state.sent_packet_count()));

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    assert_eq!(vec!["a/b".to_string()], delivered_destinations(&events));
    verify_no_tracked_packets(&client);
}

#[test]
fn qos2_publish_round_trip() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::ExactlyOnce, false).unwrap();
    fixture.process_sends();

    fixture.broker_sends(&client, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));
    let packets = fixture.process_sends();
    assert_eq!(vec![MqttPacket::Pubrel(PubrelPacket { packet_id: 1 })], packets);
    assert!(delivered_destinations(&events).is_empty());

    fixture.broker_sends(&client, MqttPacket::Pubcomp(PubcompPacket { packet_id: 1 }));
    assert_eq!(vec!["a/b".to_string()], delivered_destinations(&events));
    verify_no_tracked_packets(&client);
}

#[test]
fn repeated_pubrec_resends_pubrel() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::ExactlyOnce, false).unwrap();
    fixture.process_sends();
    fixture.broker_sends(&client, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));
    fixture.process_sends();

    fixture.broker_sends(&client, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));
    assert_eq!(vec![MqttPacket::Pubrel(PubrelPacket { packet_id: 1 })], fixture.process_sends());
    assert_eq!(ClientStatus::Connected, client.status());
}

#[test]
fn puback_overtaking_send_outcome_completes_publish() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    assert_eq!(vec!["a/b".to_string()], delivered_destinations(&events));

    // the late outcome is ignored
    fixture.complete_send(&sends[0], SendOutcome::Processed);
    assert_eq!(1, delivered_destinations(&events).len());
    verify_no_tracked_packets(&client);
}

#[test]
fn unmatched_puback_is_fatal() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 7 }));

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::ProtocolError(_))]);
}

#[test]
fn unmatched_unsuback_is_fatal() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    fixture.broker_sends(&client, MqttPacket::Unsuback(UnsubackPacket { packet_id: 3 }));

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::ProtocolError(_))]);
}

#[test]
fn unknown_pubrel_is_completed() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    fixture.broker_sends(&client, MqttPacket::Pubrel(PubrelPacket { packet_id: 9 }));

    assert_eq!(vec![MqttPacket::Pubcomp(PubcompPacket { packet_id: 9 })], fixture.process_sends());
    assert_eq!(ClientStatus::Connected, client.status());
}

#[test]
fn inbound_qos1_publish_is_acknowledged() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    fixture.broker_sends(&client, inbound_publish(5, "in/one", QualityOfService::AtLeastOnce));

    assert_eq!(vec!["in/one".to_string()], arrived_destinations(&events));
    assert_eq!(vec![MqttPacket::Puback(PubackPacket { packet_id: 5 })], fixture.process_sends());
}

#[test]
fn inbound_qos2_publish_on_clean_session() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    fixture.broker_sends(&client, inbound_publish(6, "in/two", QualityOfService::ExactlyOnce));
    assert_eq!(vec!["in/two".to_string()], arrived_destinations(&events));
    assert_eq!(vec![MqttPacket::Pubrec(PubrecPacket { packet_id: 6 })], fixture.process_sends());

    // the broker did not see our PUBREC; its repeat is not delivered twice
    fixture.broker_sends(&client, inbound_publish(6, "in/two", QualityOfService::ExactlyOnce));
    assert_eq!(1, arrived_destinations(&events).len());
    assert_eq!(vec![MqttPacket::Pubrec(PubrecPacket { packet_id: 6 })], fixture.process_sends());

    fixture.broker_sends(&client, MqttPacket::Pubrel(PubrelPacket { packet_id: 6 }));
    assert_eq!(vec![MqttPacket::Pubcomp(PubcompPacket { packet_id: 6 })], fixture.process_sends());
    assert_eq!(1, arrived_destinations(&events).len());
    client.with_state(|state| assert_eq!(0, state.received_packet_count()));
}

#[test]
fn inbound_qos2_publish_on_persistent_session_arrives_on_pubrel() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    assert!(fixture.connect(&client, persistent_options(), false).is_ok());
    let events = record_events(&client);

    fixture.broker_sends(&client, inbound_publish(6, "in/two", QualityOfService::ExactlyOnce));
    assert!(arrived_destinations(&events).is_empty());
    assert_eq!(vec![MqttPacket::Pubrec(PubrecPacket { packet_id: 6 })], fixture.process_sends());

    fixture.broker_sends(&client, MqttPacket::Pubrel(PubrelPacket { packet_id: 6 }));
    assert_eq!(vec!["in/two".to_string()], arrived_destinations(&events));
    assert_eq!(vec![MqttPacket::Pubcomp(PubcompPacket { packet_id: 6 })], fixture.process_sends());
}

#[test]
fn persistent_session_restored_by_new_session() {
    let storage = Rc::new(MemoryStorageBackend::new());

    {
        let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
        let client = fixture.session.create_client("broker", Some("persistent")).unwrap();
        assert!(fixture.connect(&client, persistent_options(), false).is_ok());

        client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
        client.publish("out/two", "2".as_bytes(), QualityOfService::ExactlyOnce, false).unwrap();
        fixture.process_sends();

        fixture.broker_sends(&client, MqttPacket::Pubrec(PubrecPacket { packet_id: 2 }));
        fixture.process_sends();

        fixture.session.close();
    }

    assert!(!storage.is_empty());

    let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
    let client = fixture.session.create_client("broker", Some("persistent")).unwrap();
    let events = record_events(&client);
    assert_matches!(fixture.connect(&client, persistent_options(), true), Ok(ConnectionSuccess { session_present: true }));

    let packets = fixture.process_sends();
    assert_eq!(2, packets.len());
    assert_matches!(&packets[0], MqttPacket::Publish(publish) => {
        assert_eq!(1, publish.packet_id);
        assert_eq!("out/one", publish.topic);
        assert!(publish.duplicate);
    });
    assert_eq!(MqttPacket::Pubrel(PubrelPacket { packet_id: 2 }), packets[1]);

    // restored ids stay reserved
    client.publish("out/three", "3".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Publish(publish)] => {
        assert_eq!(3, publish.packet_id);
    });

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    fixture.broker_sends(&client, MqttPacket::Pubcomp(PubcompPacket { packet_id: 2 }));
    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 3 }));

    assert_eq!(vec!["out/one".to_string(), "out/two".to_string(), "out/three".to_string()], delivered_destinations(&events));
    verify_no_tracked_packets(&client);
    assert!(storage.is_empty());
}

#[test]
fn publish_queued_while_connecting_is_not_a_duplicate() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let connect_future = client.connect(persistent_options()).unwrap();
    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    assert!(fixture.take_sends().is_empty());

    fixture.broker_connack(&client, true);
    assert_matches!(poll_once(connect_future), Some(Ok(_)));

    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Publish(publish)] => {
        assert_eq!(1, publish.packet_id);
        assert!(!publish.duplicate);
    });
}

#[test]
fn publish_while_connecting_does_not_reuse_stored_packet_id() {
    let storage = Rc::new(MemoryStorageBackend::new());

    {
        let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
        let client = fixture.session.create_client("broker", Some("persistent")).unwrap();
        assert!(fixture.connect(&client, persistent_options(), false).is_ok());

        client.publish("out/old", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
        fixture.process_sends();
        fixture.session.close();
    }

    let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
    let client = fixture.session.create_client("broker", Some("persistent")).unwrap();
    let events = record_events(&client);

    let connect_future = client.connect(persistent_options()).unwrap();
    client.publish("out/new", "2".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    assert!(fixture.take_sends().is_empty());

    fixture.broker_connack(&client, true);
    assert_matches!(poll_once(connect_future), Some(Ok(ConnectionSuccess { session_present: true })));

    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Publish(old), MqttPacket::Publish(new)] => {
        assert_eq!("out/old", old.topic);
        assert_eq!(1, old.packet_id);
        assert!(old.duplicate);
        assert_eq!("out/new", new.topic);
        assert_eq!(2, new.packet_id);
        assert!(!new.duplicate);
    });

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 2 }));

    assert_eq!(vec!["out/old".to_string(), "out/new".to_string()], delivered_destinations(&events));
    verify_no_tracked_packets(&client);
    assert!(storage.is_empty());
}

#[test]
fn clean_connect_clears_stored_session() {
    let storage = Rc::new(MemoryStorageBackend::new());
    let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
    let client = fixture.session.create_client("broker", Some("persistent")).unwrap();

    assert!(fixture.connect(&client, persistent_options(), false).is_ok());
    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    fixture.process_sends();
    assert!(!storage.is_empty());

    client.disconnect().unwrap();
    fixture.process_sends();
    assert_eq!(ClientStatus::Disconnected, client.status());

    fixture.connect_clean(&client);
    assert!(storage.is_empty());
    assert!(fixture.take_sends().is_empty());
}

#[test]
fn denied_publish_is_not_authorized() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();
    fixture.complete_send(&sends[0], SendOutcome::Denied { code: -1, message: None });

    assert_matches!(&events.borrow()[..], [RecordedEvent::MessageNotAuthorized(message, MqttError::NotAuthorized(_))] => {
        assert_eq!("a/b", message.destination());
    });
    assert_eq!(ClientStatus::Connected, client.status());
    verify_no_tracked_packets(&client);
}

#[test]
fn denied_pubrel_is_dropped_without_not_authorized() {
    let storage = Rc::new(MemoryStorageBackend::new());
    let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_storage(storage.clone()).build());
    let client = fixture.create_dedicated_client();
    assert!(fixture.connect(&client, persistent_options(), false).is_ok());
    let events = record_events(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::ExactlyOnce, false).unwrap();
    fixture.process_sends();
    fixture.broker_sends(&client, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));

    let sends = fixture.take_sends();
    assert_eq!(MqttPacket::Pubrel(PubrelPacket { packet_id: 1 }), sends[0].packet.packet);
    fixture.complete_send(&sends[0], SendOutcome::Denied { code: -1, message: None });

    // the broker accepted the publish; its release being refused is not an authorization denial
    assert!(events.borrow().is_empty());
    assert_eq!(ClientStatus::Connected, client.status());
    verify_no_tracked_packets(&client);
    assert!(storage.is_empty());
}

#[test]
fn aborted_publish_is_retried_with_duplicate_flag() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();
    fixture.complete_send(&sends[0], SendOutcome::Aborted);

    // redelivered right away, without waiting for other traffic
    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Publish(retried)] => {
        assert_eq!("a/b", retried.topic);
        assert_eq!(1, retried.packet_id);
        assert!(retried.duplicate);
    });

    client.with_state(|state| assert_eq!(1, state.sent_packet_count()));
}

#[test]
fn discarded_subscribe_is_resent() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let subscribe_future = client.subscribe("a/b", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    let sends = fixture.take_sends();
    fixture.complete_send(&sends[0], SendOutcome::Discarded);

    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Subscribe(subscribe)] => {
        assert_eq!(1, subscribe.packet_id);
    });

    fixture.broker_sends(&client, MqttPacket::Suback(SubackPacket { packet_id: 1, return_codes: vec![SubackReturnCode::GrantedQos1] }));
    assert_matches!(poll_once(subscribe_future), Some(Ok(QualityOfService::AtLeastOnce)));
    verify_no_tracked_packets(&client);
}

#[test]
fn aborted_publish_while_recovering_waits_for_the_connection() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    client.publish("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();

    fixture.transport_status(TransportStatus::DisconnectedTryingRecovery);
    fixture.complete_send(&sends[0], SendOutcome::Aborted);
    assert!(fixture.take_sends().is_empty());

    fixture.transport_status(TransportStatus::ConnectedStreaming);
    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Publish(retried)] => {
        assert!(retried.duplicate);
    });
}

#[test]
fn subscribe_and_unsubscribe_round_trip() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let subscribe_future = client.subscribe("a/+", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Subscribe(subscribe)] => {
        assert_eq!(1, subscribe.packet_id);
        assert_eq!("a/+", subscribe.subscriptions[0].topic_filter);
    });

    fixture.broker_sends(&client, MqttPacket::Suback(SubackPacket { packet_id: 1, return_codes: vec![SubackReturnCode::GrantedQos1] }));
    assert_matches!(poll_once(subscribe_future), Some(Ok(QualityOfService::AtLeastOnce)));

    let unsubscribe_future = client.unsubscribe("a/+").unwrap();
    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Unsubscribe(unsubscribe)] => {
        assert_eq!(2, unsubscribe.packet_id);
    });

    fixture.broker_sends(&client, MqttPacket::Unsuback(UnsubackPacket { packet_id: 2 }));
    assert_matches!(poll_once(unsubscribe_future), Some(Ok(())));
    verify_no_tracked_packets(&client);
}

#[test]
fn subscribe_to_invalid_filter_is_invalid() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    assert_matches!(client.subscribe("a/#/b", SubscribeOptions::default()).err(), Some(MqttError::InvalidArgument(_)));
    assert!(fixture.take_sends().is_empty());
}

#[test]
fn denied_subscribe_fails() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let subscribe_future = client.subscribe("a/b", SubscribeOptions::default()).unwrap();
    let sends = fixture.take_sends();
    fixture.complete_send(&sends[0], SendOutcome::Denied { code: -1, message: None });

    assert_matches!(poll_once(subscribe_future), Some(Err(MqttError::NotAuthorized(_))));
    verify_no_tracked_packets(&client);
}

#[test]
fn rejected_suback_fails_subscribe() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let subscribe_future = client.subscribe("a/b", SubscribeOptions::default()).unwrap();
    fixture.process_sends();
    fixture.broker_sends(&client, MqttPacket::Suback(SubackPacket { packet_id: 1, return_codes: vec![SubackReturnCode::Failure] }));

    assert_matches!(poll_once(subscribe_future), Some(Err(MqttError::BrokerRejection(_))));
    assert_eq!(ClientStatus::Connected, client.status());
}

#[test]
fn retry_resubscribes_and_requeues() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    let subscribe_future = client.subscribe("a/b", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    fixture.process_sends();
    fixture.broker_sends(&client, MqttPacket::Suback(SubackPacket { packet_id: 1, return_codes: vec![SubackReturnCode::GrantedQos1] }));
    assert_matches!(poll_once(subscribe_future), Some(Ok(_)));

    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    fixture.process_sends();

    fixture.transport_status(TransportStatus::DisconnectedWillRetry);
    assert_eq!(ClientStatus::Retry, client.status());

    fixture.broker_connack(&client, false);
    assert_eq!(ClientStatus::Connected, client.status());

    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Subscribe(subscribe), MqttPacket::Publish(publish)] => {
        assert_eq!("a/b", subscribe.subscriptions[0].topic_filter);
        assert_eq!(2, publish.packet_id);
        assert!(!publish.duplicate);
    });

    assert_matches!(&events.borrow()[..], [RecordedEvent::ReconnectionStart, RecordedEvent::ReconnectionComplete]);
}

#[test]
fn persistent_retry_restores_from_store() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    assert!(fixture.connect(&client, persistent_options(), false).is_ok());
    let events = record_events(&client);

    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    fixture.process_sends();
    client.with_state(|state| assert_eq!(1, state.sent_packet_count()));

    fixture.transport_status(TransportStatus::DisconnectedWillRetry);
    assert_eq!(ClientStatus::Retry, client.status());

    fixture.broker_connack(&client, true);
    assert_eq!(ClientStatus::Connected, client.status());

    // the stored publish replaces the in-memory acknowledgement wait
    let sends = fixture.take_sends();
    client.with_state(|state| {
        assert_eq!(0, state.sent_packet_count());
        assert_eq!(1, state.queued_packet_count());
        assert_eq!(1, state.allocated_packet_id_count());
    });

    assert_matches!(&sends[..], [send] => {
        assert_matches!(&send.packet.packet, MqttPacket::Publish(publish) => {
            assert_eq!("out/one", publish.topic);
            assert_eq!(1, publish.packet_id);
            assert!(publish.duplicate);
        });
        fixture.complete_send(send, SendOutcome::Processed);
    });

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    assert_matches!(&events.borrow()[..], [RecordedEvent::ReconnectionStart, RecordedEvent::ReconnectionComplete, RecordedEvent::MessageDelivered(message)] => {
        assert_eq!("out/one", message.destination());
    });
    verify_no_tracked_packets(&client);
}

#[test]
fn reconnect_after_lost_connection_redelivers_once() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    assert!(fixture.connect(&client, persistent_options(), false).is_ok());
    let events = record_events(&client);

    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    fixture.process_sends();

    fixture.transport_status(TransportStatus::Disconnected);
    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::TransportFailure(_))]);
    verify_no_tracked_packets(&client);

    assert_matches!(fixture.connect(&client, persistent_options(), true), Ok(ConnectionSuccess { session_present: true }));

    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Publish(publish)] => {
        assert_eq!("out/one", publish.topic);
        assert_eq!(1, publish.packet_id);
        assert!(publish.duplicate);
    });

    fixture.broker_sends(&client, MqttPacket::Puback(PubackPacket { packet_id: 1 }));
    assert_eq!(vec!["out/one".to_string()], delivered_destinations(&events));
    assert!(fixture.take_sends().is_empty());
    verify_no_tracked_packets(&client);
}

#[test]
fn recovery_redelivers_interrupted_sends() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    client.publish("out/one", "1".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();

    fixture.transport_status(TransportStatus::DisconnectedTryingRecovery);
    assert_eq!(ClientStatus::Recovery, client.status());
    fixture.complete_send(&sends[0], SendOutcome::Aborted);

    // operations are accepted but held back while recovering
    client.publish("out/two", "2".as_bytes(), QualityOfService::AtMostOnce, false).unwrap();
    assert!(fixture.take_sends().is_empty());

    fixture.transport_status(TransportStatus::ConnectedStreaming);
    assert_eq!(ClientStatus::Connected, client.status());

    let packets = fixture.process_sends();
    assert_matches!(&packets[..], [MqttPacket::Publish(first), MqttPacket::Publish(second)] => {
        assert_eq!("out/one", first.topic);
        assert!(first.duplicate);
        assert_eq!("out/two", second.topic);
    });

    assert_matches!(&events.borrow()[..], [RecordedEvent::ReconnectionStart, RecordedEvent::ReconnectionComplete, RecordedEvent::MessageDelivered(_)]);
}

#[test]
fn transport_disconnect_loses_connection() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    let subscribe_future = client.subscribe("a/b", SubscribeOptions::default()).unwrap();
    fixture.transport_status(TransportStatus::Disconnected);

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(poll_once(subscribe_future), Some(Err(MqttError::TransportFailure(_))));
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::TransportFailure(_))]);
    verify_no_tracked_packets(&client);
}

#[test]
fn closed_connection_stream_loses_connection() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    fixture.connection_event(&client, SubscriptionEvent::Unsubscribed);

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::ConnectionClosed(_))]);
}

#[test]
fn session_close_closes_clients() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);

    let subscribe_future = client.subscribe("a/b", SubscribeOptions::default()).unwrap();
    fixture.session.close();

    assert_eq!(ClientStatus::Disconnected, client.status());
    assert_matches!(poll_once(subscribe_future), Some(Err(MqttError::ClientClosed(_))));
    assert_matches!(&events.borrow()[..], [RecordedEvent::ConnectionLost(MqttError::ClientClosed(_))]);
    assert_matches!(fixture.session.create_client("broker", Some("late")), Err(MqttError::InvalidState(_)));
}

#[test]
fn dropped_client_releases_its_connection() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let (tag, _) = fixture.connection_of(&client);
    let second_handle = client.clone();
    drop(client);
    assert!(!fixture.transport.borrow().is_unsubscribed(&tag));

    drop(second_handle);
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn handlers_may_call_back_into_the_client() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    let echo = client.clone();
    client.set_on_message_arrived(Some(Rc::new(move |message| {
        echo.publish("echo", message.payload(), QualityOfService::AtMostOnce, false).unwrap();
    })));

    fixture.broker_sends(&client, inbound_publish(0, "in/zero", QualityOfService::AtMostOnce));

    assert_matches!(&fixture.process_sends()[..], [MqttPacket::Publish(publish)] => {
        assert_eq!("echo", publish.topic);
        assert_eq!("inbound".as_bytes(), publish.payload.as_slice());
    });

    client.clear_handlers();
}

#[test]
fn events_for_stale_attempts_are_ignored() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    let _ = client.connect(ConnectOptions::default()).unwrap();
    let (stale_tag, stale_connection_id) = fixture.connection_of(&client);
    client.disconnect().unwrap();

    let connect_future = client.connect(ConnectOptions::default()).unwrap();
    let connack = MqttPacket::Connack(ConnackPacket { session_present: false, return_code: ConnectReturnCode::Accepted });
    fixture.session.handle_transport_event(TransportEvent::Subscription {
        tag: stale_tag,
        event: SubscriptionEvent::Update(SubscriptionUpdate::Packet(WirePacket { connection_id: stale_connection_id, packet: connack })),
    });
    assert_eq!(ClientStatus::Connecting, client.status());

    fixture.broker_connack(&client, false);
    assert_matches!(poll_once(connect_future), Some(Ok(_)));
}

#[test]
fn dedicated_connection_ids_change_per_connect() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();

    fixture.connect_clean(&client);
    let (_, first_connection_id) = fixture.connection_of(&client);
    client.disconnect().unwrap();
    fixture.process_sends();

    fixture.connect_clean(&client);
    let (_, second_connection_id) = fixture.connection_of(&client);
    assert_ne!(first_connection_id, second_connection_id);
}

#[test]
fn aborted_disconnect_still_completes() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_dedicated_client();
    fixture.connect_clean(&client);

    client.disconnect().unwrap();
    let sends = fixture.take_sends();
    fixture.complete_send(&sends[0], SendOutcome::Aborted);

    assert_eq!(ClientStatus::Disconnected, client.status());
    verify_no_tracked_packets(&client);
}
