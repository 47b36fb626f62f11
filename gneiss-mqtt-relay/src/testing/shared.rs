/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::*;
use crate::config::*;
use crate::error::MqttError;
use crate::mqtt::*;
use crate::testing::*;
use crate::transport::*;

use assert_matches::assert_matches;

fn subscribe_options(qos: QualityOfService) -> SubscribeOptions {
    SubscribeOptions::builder().with_qos(qos).build()
}

fn latest_shared_tag(fixture: &SessionTestFixture, topic_filter: &str) -> (SubscriptionTag, QualityOfService) {
    fixture.transport.borrow().shared_subscriptions(topic_filter).last().cloned().unwrap()
}

fn arrived(events: &EventLog) -> Vec<(String, QualityOfService)> {
    events.borrow().iter().filter_map(|event| {
        match event {
            RecordedEvent::MessageArrived(message) => { Some((message.destination().to_string(), message.qos())) }
            _ => { None }
        }
    }).collect()
}

fn connected_shared_client(fixture: &mut SessionTestFixture) -> (MqttClient, EventLog) {
    let client = fixture.create_shared_client();
    fixture.connect_clean(&client);
    let events = record_events(&client);
    (client, events)
}

#[test]
fn shared_clients_share_a_connection() {
    let mut fixture = SessionTestFixture::new();
    let (first, _) = connected_shared_client(&mut fixture);
    let (second, _) = connected_shared_client(&mut fixture);

    assert!(first.is_shared());
    assert_eq!(None, first.client_id());
    assert_eq!(fixture.connection_of(&first).1, fixture.connection_of(&second).1);

    let third = fixture.create_shared_client();
    let options = ConnectOptions::builder().with_username("someone-else").build();
    assert!(fixture.connect(&third, options, false).is_ok());
    assert_ne!(fixture.connection_of(&first).1, fixture.connection_of(&third).1);
}

#[test]
fn shared_client_cannot_use_persistent_session() {
    let mut fixture = SessionTestFixture::new();
    let client = fixture.create_shared_client();

    let options = ConnectOptions::builder().with_clean_session(false).build();
    assert_matches!(client.connect(options).err(), Some(MqttError::InvalidArgument(_)));
    assert_eq!(ClientStatus::Disconnected, client.status());
}

#[test]
fn physical_subscription_upgrades_to_highest_requested_qos() {
    let mut fixture = SessionTestFixture::new();
    let (low, low_events) = connected_shared_client(&mut fixture);
    let (high, high_events) = connected_shared_client(&mut fixture);

    let low_future = low.subscribe("sensors/+", subscribe_options(QualityOfService::AtMostOnce)).unwrap();
    let (first_tag, first_qos) = latest_shared_tag(&fixture, "sensors/+");
    assert_eq!(QualityOfService::AtMostOnce, first_qos);

    fixture.shared_suback(&first_tag, SubackReturnCode::GrantedQos0);
    assert_matches!(poll_once(low_future), Some(Ok(QualityOfService::AtMostOnce)));

    let high_future = high.subscribe("sensors/+", subscribe_options(QualityOfService::ExactlyOnce)).unwrap();
    let (second_tag, second_qos) = latest_shared_tag(&fixture, "sensors/+");
    assert_ne!(first_tag, second_tag);
    assert_eq!(QualityOfService::ExactlyOnce, second_qos);

    // the acknowledged subscription keeps serving until its replacement is acknowledged
    fixture.shared_message(&first_tag, "sensors/1", QualityOfService::AtMostOnce, 1);
    assert_eq!(vec![("sensors/1".to_string(), QualityOfService::AtMostOnce)], arrived(&low_events));
    assert!(arrived(&high_events).is_empty());
    assert!(!fixture.transport.borrow().is_unsubscribed(&first_tag));

    fixture.shared_suback(&second_tag, SubackReturnCode::GrantedQos2);
    assert_matches!(poll_once(high_future), Some(Ok(QualityOfService::ExactlyOnce)));
    assert!(fixture.transport.borrow().is_unsubscribed(&first_tag));

    fixture.shared_message(&second_tag, "sensors/1", QualityOfService::ExactlyOnce, 2);
    assert_eq!(("sensors/1".to_string(), QualityOfService::AtMostOnce), arrived(&low_events)[1]);
    assert_eq!(vec![("sensors/1".to_string(), QualityOfService::ExactlyOnce)], arrived(&high_events));
}

#[test]
fn subscribers_are_notified_at_granted_qos() {
    let mut fixture = SessionTestFixture::new();
    let (client, events) = connected_shared_client(&mut fixture);

    let future = client.subscribe("alerts", subscribe_options(QualityOfService::ExactlyOnce)).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "alerts");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos1);
    assert_matches!(poll_once(future), Some(Ok(QualityOfService::AtLeastOnce)));

    fixture.shared_message(&tag, "alerts", QualityOfService::ExactlyOnce, 1);
    assert_eq!(vec![("alerts".to_string(), QualityOfService::AtLeastOnce)], arrived(&events));
}

#[test]
fn subscribe_queued_behind_pending_acknowledgement() {
    let mut fixture = SessionTestFixture::new();
    let (first, _) = connected_shared_client(&mut fixture);
    let (second, _) = connected_shared_client(&mut fixture);

    let first_future = first.subscribe("t", subscribe_options(QualityOfService::AtMostOnce)).unwrap();
    let second_future = second.subscribe("t", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    assert_eq!(1, fixture.transport.borrow().shared_subscriptions("t").len());

    let (first_tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_suback(&first_tag, SubackReturnCode::GrantedQos0);
    assert_matches!(poll_once(first_future), Some(Ok(QualityOfService::AtMostOnce)));

    // the queued request needed a higher QoS than was acknowledged
    let (second_tag, second_qos) = latest_shared_tag(&fixture, "t");
    assert_ne!(first_tag, second_tag);
    assert_eq!(QualityOfService::AtLeastOnce, second_qos);

    fixture.shared_suback(&second_tag, SubackReturnCode::GrantedQos1);
    assert_matches!(poll_once(second_future), Some(Ok(QualityOfService::AtLeastOnce)));
}

#[test]
fn duplicate_sequences_are_dropped() {
    let mut fixture = SessionTestFixture::new();
    let (client, events) = connected_shared_client(&mut fixture);

    let _future = client.subscribe("t/+", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t/+");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos1);

    fixture.shared_message(&tag, "t/a", QualityOfService::AtLeastOnce, 5);
    fixture.shared_message(&tag, "t/a", QualityOfService::AtLeastOnce, 5);
    fixture.shared_message(&tag, "t/a", QualityOfService::AtLeastOnce, 4);
    fixture.shared_message(&tag, "t/b", QualityOfService::AtLeastOnce, 1);
    fixture.shared_message(&tag, "t/a", QualityOfService::AtLeastOnce, 6);

    let destinations : Vec<String> = arrived(&events).into_iter().map(|(destination, _)| destination).collect();
    assert_eq!(vec!["t/a".to_string(), "t/b".to_string(), "t/a".to_string()], destinations);
}

#[test]
fn overlapping_filters_deliver_once() {
    let mut fixture = SessionTestFixture::new();
    let (client, events) = connected_shared_client(&mut fixture);

    let _wide = client.subscribe("a/+", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    let (wide_tag, _) = latest_shared_tag(&fixture, "a/+");
    fixture.shared_suback(&wide_tag, SubackReturnCode::GrantedQos1);

    let _narrow = client.subscribe("a/b", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    let (narrow_tag, _) = latest_shared_tag(&fixture, "a/b");
    fixture.shared_suback(&narrow_tag, SubackReturnCode::GrantedQos1);

    fixture.shared_message(&wide_tag, "a/b", QualityOfService::AtLeastOnce, 1);
    fixture.shared_message(&narrow_tag, "a/b", QualityOfService::AtLeastOnce, 1);
    assert_eq!(1, arrived(&events).len());

    // only the wide filter matches this one
    fixture.shared_message(&wide_tag, "a/c", QualityOfService::AtLeastOnce, 1);
    assert_eq!(2, arrived(&events).len());
}

#[test]
fn overlapping_filter_with_higher_qos_wins() {
    let mut fixture = SessionTestFixture::new();
    let (client, events) = connected_shared_client(&mut fixture);

    let _wide = client.subscribe("a/+", subscribe_options(QualityOfService::AtMostOnce)).unwrap();
    let (wide_tag, _) = latest_shared_tag(&fixture, "a/+");
    fixture.shared_suback(&wide_tag, SubackReturnCode::GrantedQos0);

    let _narrow = client.subscribe("a/b", subscribe_options(QualityOfService::AtLeastOnce)).unwrap();
    let (narrow_tag, _) = latest_shared_tag(&fixture, "a/b");
    fixture.shared_suback(&narrow_tag, SubackReturnCode::GrantedQos1);

    fixture.shared_message(&wide_tag, "a/b", QualityOfService::AtMostOnce, 1);
    fixture.shared_message(&narrow_tag, "a/b", QualityOfService::AtLeastOnce, 1);

    assert_eq!(vec![("a/b".to_string(), QualityOfService::AtLeastOnce)], arrived(&events));
}

#[test]
fn conflicting_selector_is_resubmitted_until_exhausted() {
    let mut fixture = SessionTestFixture::with_config(SessionConfig::builder().with_max_selector_resubmissions(2).build());
    let (client, _) = connected_shared_client(&mut fixture);

    let future = client.subscribe("t", SubscribeOptions::default()).unwrap();

    for attempt in 1..=3 {
        let subscriptions = fixture.transport.borrow().shared_subscriptions("t");
        assert_eq!(attempt, subscriptions.len());

        let (tag, _) = subscriptions.last().cloned().unwrap();
        fixture.shared_event(&tag, SubscriptionEvent::Failed { code: -4, message: None });
    }

    assert_eq!(3, fixture.transport.borrow().shared_subscriptions("t").len());
    assert_matches!(poll_once(future), Some(Err(MqttError::ConflictingSelector(_))));

    let (last_tag, _) = latest_shared_tag(&fixture, "t");
    assert!(fixture.transport.borrow().is_unsubscribed(&last_tag));
}

#[test]
fn conflicting_selector_resubmission_succeeds() {
    let mut fixture = SessionTestFixture::new();
    let (client, _) = connected_shared_client(&mut fixture);

    let future = client.subscribe("t", SubscribeOptions::default()).unwrap();
    let (first_tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_event(&first_tag, SubscriptionEvent::Failed { code: -4, message: None });

    let (second_tag, _) = latest_shared_tag(&fixture, "t");
    assert_ne!(first_tag, second_tag);

    // late events for the abandoned selector are ignored
    fixture.shared_suback(&first_tag, SubackReturnCode::GrantedQos0);
    fixture.shared_suback(&second_tag, SubackReturnCode::GrantedQos0);
    assert_matches!(poll_once(future), Some(Ok(QualityOfService::AtMostOnce)));
}

#[test]
fn denied_physical_subscription_fails_subscribe() {
    let mut fixture = SessionTestFixture::new();
    let (client, _) = connected_shared_client(&mut fixture);

    let future = client.subscribe("t", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_event(&tag, SubscriptionEvent::Failed { code: -1, message: None });

    assert_matches!(poll_once(future), Some(Err(MqttError::NotAuthorized(_))));
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn last_unsubscribe_drops_physical_subscription() {
    let mut fixture = SessionTestFixture::new();
    let (first, _) = connected_shared_client(&mut fixture);
    let (second, _) = connected_shared_client(&mut fixture);

    let _first_subscribe = first.subscribe("t", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos0);
    let _second_subscribe = second.subscribe("t", SubscribeOptions::default()).unwrap();
    assert_eq!(1, fixture.transport.borrow().shared_subscriptions("t").len());

    assert_matches!(poll_once(first.unsubscribe("t").unwrap()), Some(Ok(())));
    assert!(!fixture.transport.borrow().is_unsubscribed(&tag));

    assert_matches!(poll_once(second.unsubscribe("t").unwrap()), Some(Ok(())));
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn unsubscribe_waits_for_pending_acknowledgement() {
    let mut fixture = SessionTestFixture::new();
    let (client, _) = connected_shared_client(&mut fixture);

    let subscribe_future = client.subscribe("t", SubscribeOptions::default()).unwrap();
    let unsubscribe_future = client.unsubscribe("t").unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    assert!(!fixture.transport.borrow().is_unsubscribed(&tag));

    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos0);

    assert_matches!(poll_once(subscribe_future), Some(Ok(QualityOfService::AtMostOnce)));
    assert_matches!(poll_once(unsubscribe_future), Some(Ok(())));
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn shared_publish_delivered_when_processed() {
    let mut fixture = SessionTestFixture::new();
    let (client, events) = connected_shared_client(&mut fixture);

    client.publish("out", "payload".as_bytes(), QualityOfService::AtLeastOnce, false).unwrap();
    let sends = fixture.take_sends();
    assert_eq!(fixture.connection_of(&client).1, sends[0].packet.connection_id);

    fixture.complete_send(&sends[0], SendOutcome::Processed);
    assert_matches!(&events.borrow()[..], [RecordedEvent::MessageDelivered(message)] => {
        assert_eq!("out", message.destination());
    });

    client.with_state(|state| {
        assert_eq!(0, state.queued_packet_count());
        assert_eq!(0, state.allocated_packet_id_count());
    });
}

#[test]
fn shared_disconnect_leaves_other_clients_subscribed() {
    let mut fixture = SessionTestFixture::new();
    let (first, first_events) = connected_shared_client(&mut fixture);
    let (second, second_events) = connected_shared_client(&mut fixture);

    let _first_subscribe = first.subscribe("t", SubscribeOptions::default()).unwrap();
    let _second_subscribe = second.subscribe("t", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos0);

    let (first_connection, _) = fixture.connection_of(&first);
    first.disconnect().unwrap();
    assert_eq!(ClientStatus::Disconnected, first.status());
    assert!(fixture.transport.borrow().is_unsubscribed(&first_connection));
    assert!(fixture.take_sends().is_empty());
    assert!(!fixture.transport.borrow().is_unsubscribed(&tag));

    fixture.shared_message(&tag, "t", QualityOfService::AtMostOnce, 1);
    assert!(arrived(&first_events).is_empty());
    assert_eq!(1, arrived(&second_events).len());

    second.disconnect().unwrap();
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn disconnect_fails_pending_shared_subscribe() {
    let mut fixture = SessionTestFixture::new();
    let (client, _) = connected_shared_client(&mut fixture);

    let future = client.subscribe("t", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    client.disconnect().unwrap();

    assert_matches!(poll_once(future), Some(Err(MqttError::UserInitiatedDisconnect(_))));
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn different_passwords_never_share_a_connection() {
    let mut fixture = SessionTestFixture::new();

    // equal crc32 checksums
    let first = fixture.create_shared_client();
    let options = ConnectOptions::builder().with_username("u").with_password("plumless".as_bytes()).build();
    assert!(fixture.connect(&first, options, false).is_ok());

    let second = fixture.create_shared_client();
    let options = ConnectOptions::builder().with_username("u").with_password("buckeroo".as_bytes()).build();
    assert!(fixture.connect(&second, options, false).is_ok());

    assert_ne!(fixture.connection_of(&first).1, fixture.connection_of(&second).1);
}

#[test]
fn dropped_client_releases_shared_subscriptions() {
    let mut fixture = SessionTestFixture::new();
    let (client, _) = connected_shared_client(&mut fixture);

    let subscribe_future = client.subscribe("a/b", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "a/b");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos0);
    assert_matches!(poll_once(subscribe_future), Some(Ok(QualityOfService::AtMostOnce)));

    let (connection_tag, _) = fixture.connection_of(&client);
    drop(client);

    assert!(fixture.transport.borrow().is_unsubscribed(&connection_tag));
    assert!(fixture.transport.borrow().is_unsubscribed(&tag));
}

#[test]
fn dropped_client_leaves_other_subscribers_in_place() {
    let mut fixture = SessionTestFixture::new();
    let (first, _) = connected_shared_client(&mut fixture);
    let (second, second_events) = connected_shared_client(&mut fixture);

    let _first_subscribe = first.subscribe("t", SubscribeOptions::default()).unwrap();
    let _second_subscribe = second.subscribe("t", SubscribeOptions::default()).unwrap();
    let (tag, _) = latest_shared_tag(&fixture, "t");
    fixture.shared_suback(&tag, SubackReturnCode::GrantedQos0);

    drop(first);
    assert!(!fixture.transport.borrow().is_unsubscribed(&tag));

    fixture.shared_message(&tag, "t", QualityOfService::AtMostOnce, 1);
    assert_eq!(1, arrived(&second_events).len());
}
