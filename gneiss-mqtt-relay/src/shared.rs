/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Bookkeeping for clients that multiplex one physical broker connection.

Each topic filter subscribed on a shared connection maps to exactly one physical subscription,
submitted at the highest QoS any sharing client asked for.  Subscribe and unsubscribe requests
that arrive while a physical subscription is waiting for its SUBACK are queued as tasks and
replayed once the acknowledgement lands.
 */

use crate::client::{SubscribeResult, UnsubscribeResult};
use crate::error::{classify_server_error, MqttError};
use crate::message::Message;
use crate::mqtt::*;
use crate::transport::*;
use crate::validate::{parse_topic_filter, topic_matches_filter, TopicFilterLevel};

use futures::channel::oneshot;
use log::*;
use lru::LruCache;
use rand::distributions::Alphanumeric;
use rand::Rng;

use std::cmp::min;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;

const SELECTOR_LENGTH: usize = 16;

fn generate_selector() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SELECTOR_LENGTH)
        .map(char::from)
        .collect()
}

fn complete_subscribe(response: Option<oneshot::Sender<SubscribeResult>>, result: SubscribeResult) {
    if let Some(sender) = response {
        if sender.send(result).is_err() {
            debug!("shared subscribe completion - receiver dropped");
        }
    }
}

fn complete_unsubscribe(response: Option<oneshot::Sender<UnsubscribeResult>>, result: UnsubscribeResult) {
    if let Some(sender) = response {
        if sender.send(result).is_err() {
            debug!("shared unsubscribe completion - receiver dropped");
        }
    }
}

/// A message routed to one client of a shared connection
pub(crate) struct SharedDelivery {
    pub client: ClientKey,
    pub message: Message,
}

struct SharedSubscriber {
    requested_qos: QualityOfService,

    // None until a SUBACK covering this subscriber's request arrived
    notified_qos: Option<QualityOfService>,

    response: Option<oneshot::Sender<SubscribeResult>>,

    // an unsubscribe is queued for this subscriber
    unsubscribing: bool,
}

enum SharedSubscriptionTask {
    Resubscribe {
        client: ClientKey,
        qos: QualityOfService,
        response: Option<oneshot::Sender<SubscribeResult>>,
    },
    Unsubscribe {
        client: ClientKey,
        response: Option<oneshot::Sender<UnsubscribeResult>>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PhysicalState {
    AwaitingAck,
    Active,
}

struct PreviousSubmission {
    selector: String,
    submitted_qos: QualityOfService,
    granted_qos: QualityOfService,
}

struct SharedSubscriptionEntry {
    topic_filter: String,
    levels: Vec<TopicFilterLevel>,
    selector: String,
    state: PhysicalState,
    submitted_qos: QualityOfService,
    granted_qos: Option<QualityOfService>,

    // acknowledged physical subscription that stays in place until its replacement is acknowledged
    previous: Option<PreviousSubmission>,

    selector_resubmissions: u32,
    subscribers: BTreeMap<ClientKey, SharedSubscriber>,
    tasks: VecDeque<SharedSubscriptionTask>,

    // highest sequence number seen per destination
    last_sequences: LruCache<String, u64>,
}

impl SharedSubscriptionEntry {

    fn max_requested_qos(&self) -> QualityOfService {
        self.subscribers.values()
            .filter(|subscriber| !subscriber.unsubscribing)
            .map(|subscriber| subscriber.requested_qos)
            .max()
            .unwrap_or_default()
    }

    fn is_unused(&self) -> bool {
        self.subscribers.is_empty() && self.tasks.is_empty()
    }

    fn notified_qos_for(&self, client: ClientKey) -> Option<QualityOfService> {
        self.subscribers.get(&client)
            .filter(|subscriber| !subscriber.unsubscribing)
            .and_then(|subscriber| subscriber.notified_qos)
    }

    fn tag(&self, connection_id: &str, selector: &str) -> SubscriptionTag {
        SubscriptionTag::SharedTopic {
            connection_id: connection_id.to_string(),
            topic_filter: self.topic_filter.clone(),
            selector: selector.to_string(),
        }
    }
}

#[derive(Default)]
struct SharedConnection {
    entries: HashMap<String, SharedSubscriptionEntry>,
}

/// Every shared connection of a session and the physical subscriptions on them
pub(crate) struct SharedSubscriptionRegistry {
    connections: HashMap<String, SharedConnection>,
    max_tracked_destinations: NonZeroUsize,
    max_selector_resubmissions: u32,
}

impl SharedSubscriptionRegistry {

    pub(crate) fn new(max_tracked_destinations: usize, max_selector_resubmissions: u32) -> Self {
        SharedSubscriptionRegistry {
            connections: HashMap::new(),
            max_tracked_destinations: NonZeroUsize::new(max_tracked_destinations).unwrap_or(NonZeroUsize::MIN),
            max_selector_resubmissions,
        }
    }

    fn submit_physical(transport: &SharedTransport, connection_id: &str, entry: &SharedSubscriptionEntry) {
        info!("shared connection \"{}\" - submitting physical subscription to \"{}\" at {} with selector {}",
            connection_id, entry.topic_filter, entry.submitted_qos, entry.selector);

        let subscription = TransportSubscription {
            tag: entry.tag(connection_id, &entry.selector),
            descriptor: SubscriptionDescriptor::SharedTopic {
                connection_id: connection_id.to_string(),
                topic_filter: entry.topic_filter.clone(),
                qos: entry.submitted_qos,
                selector: entry.selector.clone(),
            }
        };

        transport.borrow_mut().subscribe(subscription);
    }

    fn drop_physical(transport: &SharedTransport, connection_id: &str, entry: &SharedSubscriptionEntry, selector: &str) {
        info!("shared connection \"{}\" - dropping physical subscription to \"{}\" with selector {}", connection_id, entry.topic_filter, selector);
        transport.borrow_mut().unsubscribe(&entry.tag(connection_id, selector));
    }

    /// Starts a new submission for an entry at the current maximum requested QoS, keeping the
    /// acknowledged one (if any) in place until the new one is acknowledged
    fn resubmit(transport: &SharedTransport, connection_id: &str, entry: &mut SharedSubscriptionEntry) {
        if entry.state == PhysicalState::Active {
            if let Some(granted_qos) = entry.granted_qos {
                if let Some(stale) = entry.previous.take() {
                    Self::drop_physical(transport, connection_id, entry, &stale.selector);
                }

                entry.previous = Some(PreviousSubmission {
                    selector: entry.selector.clone(),
                    submitted_qos: entry.submitted_qos,
                    granted_qos,
                });
            }
        }

        entry.selector = generate_selector();
        entry.submitted_qos = entry.max_requested_qos();
        entry.state = PhysicalState::AwaitingAck;
        Self::submit_physical(transport, connection_id, entry);
    }

    /// Applies a subscribe to an entry whose physical subscription is acknowledged
    fn apply_subscribe(transport: &SharedTransport, connection_id: &str, entry: &mut SharedSubscriptionEntry, client: ClientKey, qos: QualityOfService, response: Option<oneshot::Sender<SubscribeResult>>) {
        let granted_qos = entry.granted_qos.unwrap_or_default();
        let previous_notified_qos = entry.subscribers.get(&client).and_then(|subscriber| subscriber.notified_qos);

        if qos <= entry.submitted_qos {
            let notified_qos = min(qos, granted_qos);
            entry.subscribers.insert(client, SharedSubscriber {
                requested_qos: qos,
                notified_qos: Some(notified_qos),
                response: None,
                unsubscribing: false,
            });

            complete_subscribe(response, Ok(notified_qos));
            return;
        }

        entry.subscribers.insert(client, SharedSubscriber {
            requested_qos: qos,
            notified_qos: previous_notified_qos,
            response,
            unsubscribing: false,
        });

        Self::resubmit(transport, connection_id, entry);
    }

    /// Applies an unsubscribe to an entry whose physical subscription is acknowledged
    fn apply_unsubscribe(entry: &mut SharedSubscriptionEntry, client: ClientKey, response: Option<oneshot::Sender<UnsubscribeResult>>) {
        if let Some(subscriber) = entry.subscribers.remove(&client) {
            complete_subscribe(subscriber.response, Err(MqttError::new_invalid_state("topic filter was unsubscribed before the subscribe completed")));
        }

        complete_unsubscribe(response, Ok(()));
    }

    /// Replays queued tasks until one of them needs a new acknowledgement
    fn run_tasks(transport: &SharedTransport, connection_id: &str, entry: &mut SharedSubscriptionEntry) {
        while entry.state == PhysicalState::Active {
            let Some(task) = entry.tasks.pop_front() else {
                break;
            };

            match task {
                SharedSubscriptionTask::Resubscribe { client, qos, response } => {
                    debug!("shared connection \"{}\" - replaying subscribe of client {} to \"{}\"", connection_id, client, entry.topic_filter);
                    Self::apply_subscribe(transport, connection_id, entry, client, qos, response);
                }
                SharedSubscriptionTask::Unsubscribe { client, response } => {
                    debug!("shared connection \"{}\" - replaying unsubscribe of client {} from \"{}\"", connection_id, client, entry.topic_filter);
                    Self::apply_unsubscribe(entry, client, response);
                }
            }
        }
    }

    /// Drops the entry's physical subscriptions and removes it if nobody uses it anymore
    fn remove_if_unused(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str) {
        let Some(connection) = self.connections.get_mut(connection_id) else {
            return;
        };

        let unused = connection.entries.get(topic_filter).map(|entry| entry.is_unused()).unwrap_or(false);
        if !unused {
            return;
        }

        if let Some(entry) = connection.entries.remove(topic_filter) {
            Self::drop_physical(transport, connection_id, &entry, &entry.selector);
            if let Some(previous) = &entry.previous {
                Self::drop_physical(transport, connection_id, &entry, &previous.selector);
            }
        }

        if connection.entries.is_empty() {
            self.connections.remove(connection_id);
        }
    }

    pub(crate) fn subscribe(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str, client: ClientKey, qos: QualityOfService, response: oneshot::Sender<SubscribeResult>) {
        let capacity = self.max_tracked_destinations;
        let connection = self.connections.entry(connection_id.to_string()).or_default();

        match connection.entries.get_mut(topic_filter) {
            None => {
                let mut subscribers = BTreeMap::new();
                subscribers.insert(client, SharedSubscriber {
                    requested_qos: qos,
                    notified_qos: None,
                    response: Some(response),
                    unsubscribing: false,
                });

                let entry = SharedSubscriptionEntry {
                    topic_filter: topic_filter.to_string(),
                    levels: parse_topic_filter(topic_filter),
                    selector: generate_selector(),
                    state: PhysicalState::AwaitingAck,
                    submitted_qos: qos,
                    granted_qos: None,
                    previous: None,
                    selector_resubmissions: 0,
                    subscribers,
                    tasks: VecDeque::new(),
                    last_sequences: LruCache::new(capacity),
                };

                Self::submit_physical(transport, connection_id, &entry);
                connection.entries.insert(topic_filter.to_string(), entry);
            }
            Some(entry) => {
                match entry.state {
                    PhysicalState::AwaitingAck => {
                        debug!("shared connection \"{}\" - queueing subscribe of client {} to \"{}\" behind pending acknowledgement", connection_id, client, topic_filter);
                        entry.tasks.push_back(SharedSubscriptionTask::Resubscribe { client, qos, response: Some(response) });
                    }
                    PhysicalState::Active => {
                        Self::apply_subscribe(transport, connection_id, entry, client, qos, Some(response));
                    }
                }
            }
        }
    }

    pub(crate) fn unsubscribe(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str, client: ClientKey, response: Option<oneshot::Sender<UnsubscribeResult>>) {
        let Some(entry) = self.connections.get_mut(connection_id).and_then(|connection| connection.entries.get_mut(topic_filter)) else {
            complete_unsubscribe(response, Ok(()));
            return;
        };

        match entry.state {
            PhysicalState::AwaitingAck => {
                debug!("shared connection \"{}\" - queueing unsubscribe of client {} from \"{}\" behind pending acknowledgement", connection_id, client, topic_filter);
                if let Some(subscriber) = entry.subscribers.get_mut(&client) {
                    subscriber.unsubscribing = true;
                }
                entry.tasks.push_back(SharedSubscriptionTask::Unsubscribe { client, response });
            }
            PhysicalState::Active => {
                Self::apply_unsubscribe(entry, client, response);
                self.remove_if_unused(transport, connection_id, topic_filter);
            }
        }
    }

    /// Detaches a client from every entry of a shared connection, failing its pending subscribes
    pub(crate) fn remove_client(&mut self, transport: &SharedTransport, connection_id: &str, client: ClientKey, error: &MqttError) {
        let Some(connection) = self.connections.get_mut(connection_id) else {
            return;
        };

        let mut touched = Vec::new();
        for (topic_filter, entry) in connection.entries.iter_mut() {
            if let Some(subscriber) = entry.subscribers.remove(&client) {
                complete_subscribe(subscriber.response, Err(error.clone()));
                touched.push(topic_filter.clone());
            }

            let tasks = std::mem::take(&mut entry.tasks);
            for task in tasks {
                match task {
                    SharedSubscriptionTask::Resubscribe { client: task_client, response, .. } if task_client == client => {
                        complete_subscribe(response, Err(error.clone()));
                    }
                    SharedSubscriptionTask::Unsubscribe { client: task_client, response } if task_client == client => {
                        complete_unsubscribe(response, Ok(()));
                    }
                    task => {
                        entry.tasks.push_back(task);
                    }
                }
            }
        }

        for topic_filter in touched {
            let removable = self.connections.get(connection_id)
                .and_then(|connection| connection.entries.get(&topic_filter))
                .map(|entry| entry.state == PhysicalState::Active || entry.subscribers.is_empty())
                .unwrap_or(false);

            if removable {
                self.remove_if_unused(transport, connection_id, &topic_filter);
            }
        }
    }

    /// Processes an event on a physical shared subscription.  Returns the messages to hand to
    /// individual clients.
    pub(crate) fn handle_subscription_event(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str, selector: &str, event: SubscriptionEvent) -> Vec<SharedDelivery> {
        let known = self.connections.get(connection_id)
            .and_then(|connection| connection.entries.get(topic_filter))
            .map(|entry| entry.selector == selector || entry.previous.as_ref().map(|previous| previous.selector == selector).unwrap_or(false))
            .unwrap_or(false);

        if !known {
            debug!("shared connection \"{}\" - ignoring event for stale subscription to \"{}\" with selector {}", connection_id, topic_filter, selector);
            return Vec::new();
        }

        match event {
            SubscriptionEvent::Subscribed => {
                debug!("shared connection \"{}\" - physical subscription to \"{}\" with selector {} accepted by server", connection_id, topic_filter, selector);
                Vec::new()
            }
            SubscriptionEvent::Update(SubscriptionUpdate::Packet(wire_packet)) => {
                match wire_packet.packet {
                    MqttPacket::Suback(suback) => {
                        self.handle_suback(transport, connection_id, topic_filter, selector, &suback);
                    }
                    packet => {
                        warn!("shared connection \"{}\" - unexpected {} on physical subscription to \"{}\"", connection_id, utils::mqtt_packet_to_packet_type(&packet), topic_filter);
                    }
                }
                Vec::new()
            }
            SubscriptionEvent::Update(SubscriptionUpdate::Message(update)) => {
                self.handle_message(connection_id, topic_filter, update)
            }
            SubscriptionEvent::Failed { code, message } => {
                self.handle_failure(transport, connection_id, topic_filter, selector, classify_server_error(code, message));
                Vec::new()
            }
            SubscriptionEvent::Unsubscribed => {
                debug!("shared connection \"{}\" - physical subscription to \"{}\" with selector {} ended", connection_id, topic_filter, selector);
                Vec::new()
            }
        }
    }

    fn handle_suback(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str, selector: &str, suback: &SubackPacket) {
        info!("shared connection \"{}\" - processing SUBACK for \"{}\"", connection_id, topic_filter);

        let Some(entry) = self.connections.get_mut(connection_id).and_then(|connection| connection.entries.get_mut(topic_filter)) else {
            return;
        };

        if entry.state != PhysicalState::AwaitingAck || entry.selector != selector {
            warn!("shared connection \"{}\" - SUBACK for \"{}\" arrived on a subscription that is not awaiting one", connection_id, topic_filter);
            return;
        }

        let granted_qos = suback.return_codes.first().and_then(|code| code.granted_qos());
        match granted_qos {
            Some(granted_qos) => {
                entry.state = PhysicalState::Active;
                entry.granted_qos = Some(granted_qos);
                entry.selector_resubmissions = 0;
                if let Some(previous) = entry.previous.take() {
                    Self::drop_physical(transport, connection_id, entry, &previous.selector);
                }

                let submitted_qos = entry.submitted_qos;
                for (client, subscriber) in entry.subscribers.iter_mut() {
                    if subscriber.requested_qos <= submitted_qos {
                        let notified_qos = min(subscriber.requested_qos, granted_qos);
                        if subscriber.notified_qos != Some(notified_qos) || subscriber.response.is_some() {
                            debug!("shared connection \"{}\" - client {} notified at {} on \"{}\"", connection_id, client, notified_qos, topic_filter);
                        }
                        subscriber.notified_qos = Some(notified_qos);
                        complete_subscribe(subscriber.response.take(), Ok(notified_qos));
                    }
                }

                Self::run_tasks(transport, connection_id, entry);
            }
            None => {
                let code = suback.return_codes.first().map(|code| *code as u8).unwrap_or(SubackReturnCode::Failure as u8);
                self.handle_failure(transport, connection_id, topic_filter, selector, MqttError::new_broker_rejection(PacketType::Suback, code));
                return;
            }
        }

        self.remove_if_unused(transport, connection_id, topic_filter);
    }

    fn handle_failure(&mut self, transport: &SharedTransport, connection_id: &str, topic_filter: &str, selector: &str, error: MqttError) {
        let max_resubmissions = self.max_selector_resubmissions;
        let Some(entry) = self.connections.get_mut(connection_id).and_then(|connection| connection.entries.get_mut(topic_filter)) else {
            return;
        };

        if entry.selector != selector {
            // the replaced physical subscription failed; its successor carries on
            if entry.previous.as_ref().map(|previous| previous.selector == selector).unwrap_or(false) {
                warn!("shared connection \"{}\" - superseded subscription to \"{}\" failed: {}", connection_id, topic_filter, error);
                entry.previous = None;
            }
            return;
        }

        if let MqttError::ConflictingSelector(_) = &error {
            if entry.state == PhysicalState::AwaitingAck && entry.selector_resubmissions < max_resubmissions {
                entry.selector_resubmissions += 1;
                warn!("shared connection \"{}\" - selector conflict on \"{}\"; resubmitting (attempt {})", connection_id, topic_filter, entry.selector_resubmissions);
                entry.selector = generate_selector();
                Self::submit_physical(transport, connection_id, entry);
                return;
            }
        }

        error!("shared connection \"{}\" - physical subscription to \"{}\" failed: {}", connection_id, topic_filter, error);
        entry.selector_resubmissions = 0;

        // subscribers still waiting on this submission fail; the rest keep what they had
        let failed_clients : Vec<ClientKey> = entry.subscribers.iter()
            .filter(|(_, subscriber)| subscriber.response.is_some() || subscriber.notified_qos.is_none())
            .map(|(client, _)| *client)
            .collect();

        for client in failed_clients {
            if let Some(mut subscriber) = entry.subscribers.remove(&client) {
                complete_subscribe(subscriber.response.take(), Err(error.clone()));

                // a client that was already receiving at a lower QoS keeps that subscription
                if let (Some(notified_qos), Some(_)) = (subscriber.notified_qos, &entry.previous) {
                    subscriber.requested_qos = notified_qos;
                    entry.subscribers.insert(client, subscriber);
                }
            }
        }

        match entry.previous.take() {
            Some(previous) if entry.state == PhysicalState::AwaitingAck => {
                entry.selector = previous.selector;
                entry.submitted_qos = previous.submitted_qos;
                entry.granted_qos = Some(previous.granted_qos);
                entry.state = PhysicalState::Active;
                Self::run_tasks(transport, connection_id, entry);
            }
            _ => {
                // nothing acknowledged to fall back on: the entry is gone
                entry.subscribers.clear();
                let tasks = std::mem::take(&mut entry.tasks);
                for task in tasks {
                    match task {
                        SharedSubscriptionTask::Resubscribe { response, .. } => {
                            complete_subscribe(response, Err(error.clone()));
                        }
                        SharedSubscriptionTask::Unsubscribe { response, .. } => {
                            complete_unsubscribe(response, Ok(()));
                        }
                    }
                }
            }
        }

        self.remove_if_unused(transport, connection_id, topic_filter);
    }

    fn handle_message(&mut self, connection_id: &str, topic_filter: &str, update: SharedMessageUpdate) -> Vec<SharedDelivery> {
        let Some(connection) = self.connections.get_mut(connection_id) else {
            return Vec::new();
        };

        {
            let Some(entry) = connection.entries.get_mut(topic_filter) else {
                return Vec::new();
            };

            if let Some(last_sequence) = entry.last_sequences.get(&update.destination) {
                if update.sequence <= *last_sequence {
                    debug!("shared connection \"{}\" - dropping duplicate event {} for \"{}\" on \"{}\"", connection_id, update.sequence, update.destination, topic_filter);
                    return Vec::new();
                }
            }

            entry.last_sequences.put(update.destination.clone(), update.sequence);
        }

        let Some(entry) = connection.entries.get(topic_filter) else {
            return Vec::new();
        };

        let mut deliveries = Vec::new();
        for client in entry.subscribers.keys() {
            let Some(notified_qos) = entry.notified_qos_for(*client) else {
                continue;
            };

            // deliver through exactly one filter per client: the highest notified QoS wins, ties go to the lowest filter
            let covered = connection.entries.values().any(|other| {
                if other.topic_filter == entry.topic_filter {
                    return false;
                }

                let Some(other_qos) = other.notified_qos_for(*client) else {
                    return false;
                };

                if !topic_matches_filter(&update.destination, &other.levels) {
                    return false;
                }

                other_qos > notified_qos || (other_qos == notified_qos && other.topic_filter < entry.topic_filter)
            });

            if covered {
                debug!("shared connection \"{}\" - event for \"{}\" to client {} covered by an overlapping subscription", connection_id, update.destination, client);
                continue;
            }

            deliveries.push(SharedDelivery {
                client: *client,
                message: Message {
                    destination: update.destination.clone(),
                    payload: update.payload.clone(),
                    qos: min(update.qos, notified_qos),
                    retained: update.retained,
                    duplicate: false,
                }
            });
        }

        deliveries
    }

    #[cfg(test)]
    pub(crate) fn submitted_qos(&self, connection_id: &str, topic_filter: &str) -> Option<QualityOfService> {
        self.connections.get(connection_id)
            .and_then(|connection| connection.entries.get(topic_filter))
            .map(|entry| entry.submitted_qos)
    }

    #[cfg(test)]
    pub(crate) fn has_entry(&self, connection_id: &str, topic_filter: &str) -> bool {
        self.connections.get(connection_id)
            .map(|connection| connection.entries.contains_key(topic_filter))
            .unwrap_or(false)
    }
}
