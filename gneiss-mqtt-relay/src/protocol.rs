/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Internal module that implements the per-client MQTT protocol engine on top of the push transport

use crate::client::*;
use crate::config::*;
use crate::error::{classify_server_error, MqttError, MqttResult};
use crate::logging::log_packet;
use crate::message::Message;
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::queue::*;
use crate::shared::SharedSubscriptionRegistry;
use crate::store::*;
use crate::transport::*;
use crate::validate::*;

use futures::channel::oneshot;
use log::*;

use std::cell::RefCell;
use std::collections::*;
use std::rc::Rc;
use std::time::Duration;

// Everything a client needs from its session
pub(crate) struct ClientStateConfig {
    pub key: ClientKey,
    pub broker_alias: String,
    pub client_id: Option<String>,
    pub transport: SharedTransport,
    pub shared_registry: Rc<RefCell<SharedSubscriptionRegistry>>,
    pub storage: Rc<dyn StorageBackend>,
    pub packet_ack_timeout: Duration,
}

fn complete_response(response: Option<OperationResponse>, result: MqttResult<Option<QualityOfService>>) {
    match response {
        Some(OperationResponse::Subscribe(sender)) => {
            let result = result.and_then(|qos| qos.ok_or_else(|| MqttError::new_internal_state_error("subscribe completed without a granted qos")));
            if sender.send(result).is_err() {
                debug!("subscribe completion - receiver dropped");
            }
        }
        Some(OperationResponse::Unsubscribe(sender)) => {
            if sender.send(result.map(|_| ())).is_err() {
                debug!("unsubscribe completion - receiver dropped");
            }
        }
        None => {}
    }
}

fn fail_response(response: Option<OperationResponse>, error: &MqttError) {
    complete_response(response, Err(error.clone()));
}

// packets that draw their id from the client's allocator
fn owns_packet_id(envelope: &PacketEnvelope) -> bool {
    match &envelope.packet {
        MqttPacket::Publish(publish) => { publish.qos != QualityOfService::AtMostOnce }
        MqttPacket::Pubrel(_) | MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => { true }
        _ => { false }
    }
}

// packets whose delivery state lives in the session store
fn is_persisted(envelope: &PacketEnvelope) -> bool {
    match &envelope.packet {
        MqttPacket::Publish(publish) => { publish.qos != QualityOfService::AtMostOnce }
        MqttPacket::Pubrel(_) => { true }
        _ => { false }
    }
}

fn make_fresh(mut envelope: PacketEnvelope) -> PacketEnvelope {
    envelope.processed_count = 0;
    envelope.aborted_count = 0;
    envelope.in_flight = false;
    if let MqttPacket::Publish(publish) = &mut envelope.packet {
        publish.duplicate = false;
    }

    envelope
}

pub(crate) struct ClientState {
    key: ClientKey,
    broker_alias: String,
    client_id: Option<String>,
    transport: SharedTransport,
    shared_registry: Rc<RefCell<SharedSubscriptionRegistry>>,
    storage: Rc<dyn StorageBackend>,
    packet_ack_timeout: Duration,

    status: ClientStatus,

    // bumped on every connect; scopes the connection stream tag so stale events are ignored
    stream_attempt: u64,

    // connect counter of dedicated clients, folded into the connection id
    connect_attempt: u64,

    connection_id: Option<String>,
    connection_tag: Option<SubscriptionTag>,
    connect_response: Option<oneshot::Sender<ConnectResult>>,

    queue: OutboundQueue,

    // packets processed by the transport that still wait for an MQTT acknowledgement, by packet id
    sent: HashMap<u16, PacketEnvelope>,

    // inbound QoS 2 publishes waiting for PUBREL, by packet id
    received: HashMap<u16, PublishPacket>,

    // granted subscriptions of clean-session dedicated clients, reissued after a reconnection
    active_subscriptions: BTreeMap<String, QualityOfService>,

    // topic filters a shared client is subscribed to through the aggregator
    active_shared_subscriptions: BTreeSet<String>,

    // present while a persistent dedicated client is connected or connecting
    store: Option<SessionStore>,

    allocated_packet_ids: HashSet<u16>,
    next_packet_id: u16,

    next_send_request: u64,

    // transport send request -> queue entry id
    in_flight_sends: HashMap<u64, u64>,

    events: VecDeque<ClientEvent>,
}

impl ClientState {

    pub(crate) fn new(config: ClientStateConfig) -> Self {
        ClientState {
            key: config.key,
            broker_alias: config.broker_alias,
            client_id: config.client_id,
            transport: config.transport,
            shared_registry: config.shared_registry,
            storage: config.storage,
            packet_ack_timeout: config.packet_ack_timeout,
            status: ClientStatus::Disconnected,
            stream_attempt: 0,
            connect_attempt: 0,
            connection_id: None,
            connection_tag: None,
            connect_response: None,
            queue: OutboundQueue::new(),
            sent: HashMap::new(),
            received: HashMap::new(),
            active_subscriptions: BTreeMap::new(),
            active_shared_subscriptions: BTreeSet::new(),
            store: None,
            allocated_packet_ids: HashSet::new(),
            next_packet_id: 1,
            next_send_request: 1,
            in_flight_sends: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn key(&self) -> ClientKey { self.key }

    pub(crate) fn status(&self) -> ClientStatus { self.status }

    pub(crate) fn client_id(&self) -> Option<&str> { self.client_id.as_deref() }

    pub(crate) fn broker_alias(&self) -> &str { &self.broker_alias }

    pub(crate) fn is_shared(&self) -> bool { self.client_id.is_none() }

    fn is_persistent(&self) -> bool { self.store.is_some() }

    pub(crate) fn take_events(&mut self) -> VecDeque<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    fn accepts_operations(&self) -> bool {
        matches!(self.status, ClientStatus::Connecting | ClientStatus::Connected | ClientStatus::Retry | ClientStatus::Recovery)
    }

    fn can_deliver(&self) -> bool {
        matches!(self.status, ClientStatus::Connected | ClientStatus::Disconnecting)
    }

    pub(crate) fn connect(&mut self, options: ConnectOptions) -> MqttResult<oneshot::Receiver<ConnectResult>> {
        info!("[client {}] connect - connect requested", self.key);
        if self.status != ClientStatus::Disconnected {
            error!("[client {}] connect - invalid state {} to connect", self.key, self.status);
            return Err(MqttError::new_invalid_state("connect is only valid while disconnected"));
        }

        validate_connect_options(&options, self.is_shared())?;

        let connect_attempt = if self.is_shared() { 0 } else { self.connect_attempt + 1 };
        let connection_key = ConnectionKey::new(&self.broker_alias, options.username(), options.password(), options.clean_session(), self.client_id.as_deref(), connect_attempt);
        let connection_id = connection_key.to_connection_id();

        let store = match &self.client_id {
            Some(client_id) => {
                let mut store = SessionStore::open(self.storage.clone(), client_id, &self.broker_alias)?;
                if options.clean_session() {
                    store.clear()?;
                    None
                } else {
                    Some(store)
                }
            }
            None => { None }
        };

        // ids of stored outbound publishes stay bound until the restore takes them over
        if let Some(store) = &store {
            self.reserve_stored_packet_ids(store)?;
        }
        self.store = store;

        self.connect_attempt = connect_attempt;
        self.stream_attempt += 1;

        let connect = options.to_connect_packet(self.client_id.as_deref());
        log_packet(&format!("[client {}] connect - presenting ", self.key), &MqttPacket::Connect(connect.clone()));

        let tag = SubscriptionTag::Connection { client: self.key, attempt: self.stream_attempt };
        let (sender, receiver) = oneshot::channel();

        self.connection_tag = Some(tag.clone());
        self.connection_id = Some(connection_id.clone());
        self.connect_response = Some(sender);
        self.status = ClientStatus::Connecting;

        self.transport.borrow_mut().subscribe(TransportSubscription {
            tag,
            descriptor: SubscriptionDescriptor::Connection { connection_id, connect },
        });

        Ok(receiver)
    }

    pub(crate) fn disconnect(&mut self) -> MqttResult<()> {
        info!("[client {}] disconnect - disconnect requested in state {}", self.key, self.status);
        match self.status {
            ClientStatus::Disconnected | ClientStatus::Disconnecting => {
                error!("[client {}] disconnect - invalid state {} to disconnect", self.key, self.status);
                Err(MqttError::new_invalid_state("client is not connected"))
            }
            ClientStatus::Connecting | ClientStatus::Retry | ClientStatus::Recovery => {
                self.reset(&MqttError::new_user_initiated_disconnect());
                Ok(())
            }
            ClientStatus::Connected => {
                if self.is_shared() {
                    // the broker connection belongs to every shared client; only this client's stream goes away
                    self.reset(&MqttError::new_user_initiated_disconnect());
                } else {
                    self.status = ClientStatus::Disconnecting;
                    self.enqueue(PacketEnvelope::new(MqttPacket::Disconnect(DisconnectPacket {}), false));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn send(&mut self, message: Message) -> MqttResult<()> {
        if !self.accepts_operations() {
            error!("[client {}] send - invalid state {} to send", self.key, self.status);
            return Err(MqttError::new_invalid_state("send requires a connecting or connected client"));
        }

        validate_message(&message, "Send")?;

        let qos = message.qos;
        let packet_id = if qos == QualityOfService::AtMostOnce { 0 } else { self.acquire_free_packet_id()? };
        let publish = message.to_publish_packet(packet_id);

        if qos != QualityOfService::AtMostOnce {
            if let Some(store) = self.store.as_mut() {
                if let Err(error) = store.store_sent(&publish) {
                    error!("[client {}] send - failed to persist publish {}: {}", self.key, packet_id, error);
                    self.release_packet_id(packet_id);
                    return Err(error);
                }
            }
        }

        // the transport completes the QoS handshake itself on shared connections
        let ack_required = qos != QualityOfService::AtMostOnce && !self.is_shared();

        debug!("[client {}] send - queueing {}", self.key, message);
        self.enqueue(PacketEnvelope::new(MqttPacket::Publish(publish), ack_required));
        Ok(())
    }

    pub(crate) fn subscribe(&mut self, topic_filter: &str, options: SubscribeOptions) -> MqttResult<oneshot::Receiver<SubscribeResult>> {
        if !self.accepts_operations() {
            error!("[client {}] subscribe - invalid state {} to subscribe", self.key, self.status);
            return Err(MqttError::new_invalid_state("subscribe requires a connecting or connected client"));
        }

        validate_topic_filter(topic_filter, "Subscribe")?;

        let (sender, receiver) = oneshot::channel();
        if self.is_shared() {
            let connection_id = self.connection_id.clone().ok_or_else(|| MqttError::new_internal_state_error("shared client has no connection id"))?;
            self.active_shared_subscriptions.insert(topic_filter.to_string());
            self.shared_registry.borrow_mut().subscribe(&self.transport, &connection_id, topic_filter, self.key, options.qos(), sender);
            return Ok(receiver);
        }

        let packet_id = self.acquire_free_packet_id()?;
        let subscribe = SubscribePacket {
            packet_id,
            subscriptions: vec![Subscription {
                topic_filter: topic_filter.to_string(),
                qos: options.qos(),
            }],
        };

        self.enqueue(PacketEnvelope::new(MqttPacket::Subscribe(subscribe), true).with_response(OperationResponse::Subscribe(sender)));
        Ok(receiver)
    }

    pub(crate) fn unsubscribe(&mut self, topic_filter: &str) -> MqttResult<oneshot::Receiver<UnsubscribeResult>> {
        if !self.accepts_operations() {
            error!("[client {}] unsubscribe - invalid state {} to unsubscribe", self.key, self.status);
            return Err(MqttError::new_invalid_state("unsubscribe requires a connecting or connected client"));
        }

        validate_topic_filter(topic_filter, "Unsubscribe")?;

        let (sender, receiver) = oneshot::channel();
        if self.is_shared() {
            let connection_id = self.connection_id.clone().ok_or_else(|| MqttError::new_internal_state_error("shared client has no connection id"))?;
            self.active_shared_subscriptions.remove(topic_filter);
            self.shared_registry.borrow_mut().unsubscribe(&self.transport, &connection_id, topic_filter, self.key, Some(sender));
            return Ok(receiver);
        }

        let packet_id = self.acquire_free_packet_id()?;
        let unsubscribe = UnsubscribePacket {
            packet_id,
            topic_filters: vec![topic_filter.to_string()],
        };

        self.enqueue(PacketEnvelope::new(MqttPacket::Unsubscribe(unsubscribe), true).with_response(OperationResponse::Unsubscribe(sender)));
        Ok(receiver)
    }

    /// Session shutdown: aborts whatever the client is doing
    pub(crate) fn close(&mut self) {
        if self.status == ClientStatus::Disconnected {
            return;
        }

        info!("[client {}] close - closing client in state {}", self.key, self.status);
        let error = MqttError::new_client_closed();
        if matches!(self.status, ClientStatus::Connected | ClientStatus::Retry | ClientStatus::Recovery) {
            self.events.push_back(ClientEvent::ConnectionLost(error.clone()));
        }

        self.reset(&error);
    }

    /// The application let go of the client: hand back its connection stream and shared
    /// subscriptions.  Nobody is left to hear about it, so no events are raised.
    pub(crate) fn release(&mut self) {
        if self.status == ClientStatus::Disconnected {
            return;
        }

        info!("[client {}] release - client dropped in state {}", self.key, self.status);
        self.reset(&MqttError::new_client_closed());
        self.events.clear();
    }

    pub(crate) fn deliver_shared_message(&mut self, message: Message) {
        if self.status == ClientStatus::Disconnected {
            debug!("[client {}] deliver_shared_message - dropping message for disconnected client", self.key);
            return;
        }

        self.events.push_back(ClientEvent::MessageArrived(message));
    }

    pub(crate) fn handle_status_change(&mut self, transport_status: TransportStatus) {
        debug!("[client {}] handle_status_change - transport status {} in state {}", self.key, transport_status, self.status);
        match (self.status, transport_status) {
            (ClientStatus::Disconnected, _) => {}
            (ClientStatus::Disconnecting, TransportStatus::Disconnected) => {
                self.finish_disconnect();
            }
            (_, TransportStatus::Disconnected) => {
                self.fail_connection(MqttError::new_transport_failure("transport disconnected"));
            }
            (ClientStatus::Connected | ClientStatus::Recovery, TransportStatus::DisconnectedWillRetry) => {
                info!("[client {}] handle_status_change - connection lost; waiting for the transport to reconnect", self.key);
                self.status = ClientStatus::Retry;
                self.events.push_back(ClientEvent::ReconnectionStart);
            }
            (ClientStatus::Connected, TransportStatus::DisconnectedTryingRecovery) => {
                info!("[client {}] handle_status_change - connection interrupted; waiting for the transport to recover", self.key);
                self.status = ClientStatus::Recovery;
                self.events.push_back(ClientEvent::ReconnectionStart);
            }
            (ClientStatus::Recovery, status) if status.is_connected() => {
                info!("[client {}] handle_status_change - connection recovered", self.key);
                self.status = ClientStatus::Connected;
                self.events.push_back(ClientEvent::ReconnectionComplete);
                self.flush();
            }
            _ => {}
        }
    }

    pub(crate) fn handle_connection_event(&mut self, attempt: u64, event: SubscriptionEvent) {
        let current = SubscriptionTag::Connection { client: self.key, attempt };
        if self.connection_tag.as_ref() != Some(&current) {
            debug!("[client {}] handle_connection_event - ignoring event for stale connection attempt {}", self.key, attempt);
            return;
        }

        match event {
            SubscriptionEvent::Subscribed => {
                debug!("[client {}] handle_connection_event - connection stream established", self.key);
            }
            SubscriptionEvent::Update(SubscriptionUpdate::Packet(wire_packet)) => {
                if self.connection_id.as_deref() != Some(wire_packet.connection_id.as_str()) {
                    warn!("[client {}] handle_connection_event - dropping packet for foreign connection \"{}\"", self.key, wire_packet.connection_id);
                    return;
                }

                if let Err(error) = self.handle_packet(wire_packet.packet) {
                    error!("[client {}] handle_connection_event - connection failed: {}", self.key, error);
                    self.fail_connection(error);
                }
            }
            SubscriptionEvent::Update(SubscriptionUpdate::Message(_)) => {
                warn!("[client {}] handle_connection_event - unexpected shared message on connection stream", self.key);
            }
            SubscriptionEvent::Failed { code, message } => {
                let error = classify_server_error(code, message);
                error!("[client {}] handle_connection_event - connection stream failed: {}", self.key, error);
                self.fail_connection(error);
            }
            SubscriptionEvent::Unsubscribed => {
                // the server ended the stream; there is nothing left to unsubscribe
                self.connection_tag = None;
                if self.status == ClientStatus::Disconnecting {
                    self.finish_disconnect();
                } else {
                    self.fail_connection(MqttError::new_connection_closed("server closed the connection stream"));
                }
            }
        }
    }

    pub(crate) fn handle_send_outcome(&mut self, request: u64, outcome: SendOutcome) {
        let Some(id) = self.in_flight_sends.remove(&request) else {
            debug!("[client {}] handle_send_outcome - ignoring outcome of stale send {}", self.key, request);
            return;
        };

        let Some(envelope) = self.queue.get_mut(id) else {
            debug!("[client {}] handle_send_outcome - send {} was already acknowledged", self.key, request);
            return;
        };

        envelope.in_flight = false;
        match outcome {
            SendOutcome::Processed => {
                envelope.processed_count += 1;
                self.on_send_processed(id);
            }
            SendOutcome::Discarded | SendOutcome::Aborted => {
                envelope.aborted_count += 1;
                if envelope.packet_type() == PacketType::Disconnect {
                    // nothing left to retry on a connection that is going away
                    self.finish_disconnect();
                    return;
                }
                debug!("[client {}] handle_send_outcome - send of {} not completed; redelivering", self.key, envelope);

                // outside CONNECTED the next connection flushes the queue instead
                self.flush();
            }
            SendOutcome::Denied { code, message } | SendOutcome::Error { code, message } => {
                let error = classify_server_error(code, message);
                warn!("[client {}] handle_send_outcome - send of {} refused: {}", self.key, envelope, error);
                self.on_send_failed(id, error);
            }
        }
    }

    fn on_send_processed(&mut self, id: u64) {
        let Some(envelope) = self.queue.remove(id) else {
            return;
        };

        if let MqttPacket::Disconnect(_) = &envelope.packet {
            self.finish_disconnect();
            return;
        }

        if envelope.ack_required {
            match envelope.packet_id() {
                Some(packet_id) => {
                    debug!("[client {}] on_send_processed - {} awaiting acknowledgement", self.key, envelope);
                    self.sent.insert(packet_id, envelope);
                }
                None => {
                    error!("[client {}] on_send_processed - {} requires an acknowledgement but has no packet id", self.key, envelope);
                }
            }
            return;
        }

        if let MqttPacket::Publish(_) = &envelope.packet {
            if owns_packet_id(&envelope) {
                if let Some(packet_id) = envelope.packet_id() {
                    self.release_packet_id(packet_id);
                }
            }
            self.notify_delivered(envelope);
        }
    }

    fn on_send_failed(&mut self, id: u64, error: MqttError) {
        let Some(envelope) = self.queue.remove(id) else {
            return;
        };

        if owns_packet_id(&envelope) {
            if let Some(packet_id) = envelope.packet_id() {
                self.release_packet_id(packet_id);
            }
        }

        if is_persisted(&envelope) {
            if let (Some(store), Some(packet_id)) = (self.store.as_mut(), envelope.packet_id()) {
                if let Err(store_error) = store.remove_sent(packet_id) {
                    error!("[client {}] on_send_failed - failed to drop stored publish {}: {}", self.key, packet_id, store_error);
                }
            }
        }

        match &envelope.packet {
            MqttPacket::Publish(_) => {
                if let Some(message) = envelope.message {
                    self.events.push_back(ClientEvent::MessageNotAuthorized(message, error));
                }
            }
            MqttPacket::Pubrel(pubrel) => {
                // the broker already accepted the publish; only its release was refused
                error!("[client {}] on_send_failed - PUBREL for packet id {} refused after the publish was accepted; dropping it: {}", self.key, pubrel.packet_id, error);
            }
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                fail_response(envelope.response, &error);
            }
            MqttPacket::Disconnect(_) => {
                self.finish_disconnect();
            }
            _ => {}
        }
    }

    fn notify_delivered(&mut self, envelope: PacketEnvelope) {
        if envelope.notified {
            return;
        }

        if let Some(message) = envelope.message {
            self.events.push_back(ClientEvent::MessageDelivered(message));
        }
    }

    fn enqueue(&mut self, envelope: PacketEnvelope) {
        let id = self.queue.push(envelope);
        debug!("[client {}] enqueue - queued packet #{}", self.key, id);
        self.flush();
    }

    // hands every queued packet without an outstanding send to the transport, in queue order
    fn flush(&mut self) {
        if !self.can_deliver() {
            return;
        }

        for id in self.queue.pending_delivery() {
            self.deliver(id);
        }
    }

    fn deliver(&mut self, id: u64) {
        let Some(connection_id) = self.connection_id.clone() else {
            return;
        };

        let Some(envelope) = self.queue.get_mut(id) else {
            return;
        };

        let redelivery = envelope.was_handed_off();
        if let MqttPacket::Publish(publish) = &mut envelope.packet {
            if publish.qos != QualityOfService::AtMostOnce && redelivery {
                publish.duplicate = true;
            }
        }

        envelope.in_flight = true;
        let packet = envelope.packet.clone();

        let request = self.next_send_request;
        self.next_send_request += 1;
        self.in_flight_sends.insert(request, id);

        log_packet(&format!("[client {}] deliver - sending ", self.key), &packet);
        let send = SendRequest {
            tag: SendTag { client: self.key, request },
            packet: WirePacket { connection_id, packet },
            ack_timeout: self.packet_ack_timeout,
        };

        self.transport.borrow_mut().send_packet(send);
    }

    fn finish_disconnect(&mut self) {
        info!("[client {}] finish_disconnect - disconnect complete", self.key);
        self.reset(&MqttError::new_user_initiated_disconnect());
    }

    // the client's broker connection is unusable: report it and start over
    fn fail_connection(&mut self, error: MqttError) {
        match self.status {
            ClientStatus::Disconnected => { return; }
            ClientStatus::Connected | ClientStatus::Retry | ClientStatus::Recovery => {
                self.events.push_back(ClientEvent::ConnectionLost(error.clone()));
            }
            ClientStatus::Connecting | ClientStatus::Disconnecting => {}
        }

        self.reset(&error);
    }

    // returns the client to a clean DISCONNECTED state; persisted store entries survive
    fn reset(&mut self, error: &MqttError) {
        debug!("[client {}] reset - resetting client state from {}", self.key, self.status);

        if let Some(tag) = self.connection_tag.take() {
            self.transport.borrow_mut().unsubscribe(&tag);
        }

        if let Some(sender) = self.connect_response.take() {
            if sender.send(Err(error.clone())).is_err() {
                debug!("[client {}] reset - connect receiver dropped", self.key);
            }
        }

        let queued = self.queue.drain_all();
        let sent : Vec<PacketEnvelope> = self.sent.drain().map(|(_, envelope)| envelope).collect();
        for envelope in queued.into_iter().chain(sent) {
            fail_response(envelope.response, error);
        }

        if let Some(connection_id) = &self.connection_id {
            if self.is_shared() {
                self.shared_registry.borrow_mut().remove_client(&self.transport, connection_id, self.key, error);
            }
        }

        self.received.clear();
        self.active_subscriptions.clear();
        self.active_shared_subscriptions.clear();
        self.allocated_packet_ids.clear();
        self.next_packet_id = 1;
        self.in_flight_sends.clear();
        self.connection_id = None;
        self.store = None;
        self.status = ClientStatus::Disconnected;
    }

    fn handle_packet(&mut self, packet: MqttPacket) -> MqttResult<()> {
        log_packet(&format!("[client {}] handle_packet - received ", self.key), &packet);
        match packet {
            MqttPacket::Connack(connack) => { self.handle_connack(connack) }
            MqttPacket::Publish(publish) => { self.handle_publish(publish) }
            MqttPacket::Puback(puback) => { self.handle_puback(puback) }
            MqttPacket::Pubrec(pubrec) => { self.handle_pubrec(pubrec) }
            MqttPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel) }
            MqttPacket::Pubcomp(pubcomp) => { self.handle_pubcomp(pubcomp) }
            MqttPacket::Suback(suback) => { self.handle_suback(suback) }
            MqttPacket::Unsuback(unsuback) => { self.handle_unsuback(unsuback) }
            packet => {
                error!("[client {}] handle_packet - unexpected {} from broker", self.key, mqtt_packet_to_packet_type(&packet));
                Err(MqttError::new_protocol_error("unexpected packet type from broker"))
            }
        }
    }

    fn check_session_packet_allowed(&self, function_name: &str, packet_name: &str) -> MqttResult<()> {
        match self.status {
            ClientStatus::Disconnected | ClientStatus::Connecting => {
                error!("[client {}] {} - invalid state to receive a {}", self.key, function_name, packet_name);
                Err(MqttError::new_protocol_error(format!("invalid state to receive a {}", packet_name)))
            }
            _ => { Ok(()) }
        }
    }

    fn handle_connack(&mut self, connack: ConnackPacket) -> MqttResult<()> {
        info!("[client {}] handle_connack - processing CONNACK packet", self.key);
        let reconnecting = match self.status {
            ClientStatus::Connecting => { false }
            ClientStatus::Retry => { true }
            _ => {
                error!("[client {}] handle_connack - invalid state {} to receive a CONNACK", self.key, self.status);
                return Err(MqttError::new_protocol_error("invalid state to receive a connack"));
            }
        };

        if !connack.return_code.is_success() {
            error!("[client {}] handle_connack - connection rejected with return code {}", self.key, connect_return_code_to_str(connack.return_code));
            return Err(MqttError::new_broker_rejection(PacketType::Connack, connack.return_code as u8));
        }

        // sends made on the previous broker connection can no longer complete
        self.in_flight_sends.clear();
        self.queue.reset_in_flight();

        if self.is_persistent() {
            self.restore_session(connack.session_present)?;
        } else if reconnecting && !self.is_shared() {
            self.requeue_clean_session()?;
        }

        self.status = ClientStatus::Connected;
        if reconnecting {
            info!("[client {}] handle_connack - reconnected", self.key);
            self.events.push_back(ClientEvent::ReconnectionComplete);
        } else if let Some(sender) = self.connect_response.take() {
            info!("[client {}] handle_connack - connected", self.key);
            if sender.send(Ok(ConnectionSuccess { session_present: connack.session_present })).is_err() {
                debug!("[client {}] handle_connack - connect receiver dropped", self.key);
            }
        }

        self.flush();
        Ok(())
    }

    // rebuilds the in-flight QoS state of a persistent session from the store, in original send order
    fn restore_session(&mut self, session_present: bool) -> MqttResult<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };

        if !session_present {
            info!("[client {}] restore_session - broker has no session; dropping stored inbound publishes", self.key);
            store.clear_received()?;
        }

        let items = store.items()?;

        let mut sent_entries : Vec<PacketEnvelope> = self.sent.drain().map(|(_, envelope)| envelope).collect();
        sent_entries.sort_by_key(|envelope| envelope.id);
        let requeued : Vec<PacketEnvelope> = sent_entries.into_iter().filter(|envelope| !is_persisted(envelope)).collect();

        // persisted packets that never reached the transport are not duplicates
        let never_sent : HashSet<u16> = self.queue.drain_where(is_persisted).iter()
            .filter(|envelope| !envelope.was_handed_off())
            .filter_map(|envelope| envelope.packet_id())
            .collect();
        let kept = self.queue.drain_all();

        self.received.clear();

        let mut restored = Vec::new();
        let mut highest_packet_id = 0;
        for item in items {
            let packet_id = item.body.packet_id;
            match item.state {
                StoreItemState::Sent => {
                    highest_packet_id = highest_packet_id.max(packet_id);
                    if item.pubrec_received {
                        let mut pubrel = PacketEnvelope::new(MqttPacket::Pubrel(PubrelPacket { packet_id }), true);
                        pubrel.message = Some(Message::from(&item.body));
                        restored.push(pubrel);
                    } else {
                        let mut publish = item.body;
                        publish.duplicate = !never_sent.contains(&packet_id);
                        restored.push(PacketEnvelope::new(MqttPacket::Publish(publish), true));
                    }
                }
                StoreItemState::Received => {
                    self.received.insert(packet_id, item.body);
                }
            }
        }

        info!("[client {}] restore_session - restored {} outbound and {} inbound packets", self.key, restored.len(), self.received.len());

        for envelope in restored.into_iter().chain(requeued).chain(kept) {
            self.queue.push(envelope);
        }

        self.rebuild_allocated_packet_ids();
        if highest_packet_id >= self.next_packet_id {
            self.next_packet_id = if highest_packet_id == u16::MAX { 1 } else { highest_packet_id + 1 };
        }

        Ok(())
    }

    // a clean reconnection: the broker forgot everything, so unacknowledged packets start over
    fn requeue_clean_session(&mut self) -> MqttResult<()> {
        let mut sent_entries : Vec<PacketEnvelope> = self.sent.drain().map(|(_, envelope)| envelope).collect();
        sent_entries.sort_by_key(|envelope| envelope.id);
        let kept = self.queue.drain_all();

        self.received.clear();

        let mut pending_filters = BTreeSet::new();
        for envelope in sent_entries.iter().chain(kept.iter()) {
            if let MqttPacket::Subscribe(subscribe) = &envelope.packet {
                for subscription in &subscribe.subscriptions {
                    pending_filters.insert(subscription.topic_filter.clone());
                }
            }
        }

        self.rebuild_allocated_packet_ids_from(sent_entries.iter().chain(kept.iter()));

        let resubscriptions : Vec<(String, QualityOfService)> = self.active_subscriptions.iter()
            .filter(|(topic_filter, _)| !pending_filters.contains(*topic_filter))
            .map(|(topic_filter, qos)| (topic_filter.clone(), *qos))
            .collect();

        for (topic_filter, qos) in resubscriptions {
            debug!("[client {}] requeue_clean_session - resubscribing to \"{}\"", self.key, topic_filter);
            let packet_id = self.acquire_free_packet_id()?;
            let subscribe = SubscribePacket {
                packet_id,
                subscriptions: vec![Subscription { topic_filter, qos }],
            };
            self.queue.push(PacketEnvelope::new(MqttPacket::Subscribe(subscribe), true));
        }

        info!("[client {}] requeue_clean_session - requeueing {} unacknowledged packets", self.key, sent_entries.len());
        for envelope in sent_entries.into_iter().chain(kept) {
            self.queue.push(make_fresh(envelope));
        }

        Ok(())
    }

    fn handle_publish(&mut self, publish: PublishPacket) -> MqttResult<()> {
        info!("[client {}] handle_publish - processing PUBLISH packet", self.key);
        self.check_session_packet_allowed("handle_publish", "PUBLISH")?;

        let packet_id = publish.packet_id;
        match publish.qos {
            QualityOfService::AtMostOnce => {
                self.events.push_back(ClientEvent::MessageArrived(Message::from(&publish)));
            }
            QualityOfService::AtLeastOnce => {
                self.events.push_back(ClientEvent::MessageArrived(Message::from(&publish)));
                self.enqueue(PacketEnvelope::new(MqttPacket::Puback(PubackPacket { packet_id }), false));
            }
            QualityOfService::ExactlyOnce => {
                if self.received.contains_key(&packet_id) {
                    debug!("[client {}] handle_publish - repeated QoS 2 publish {}", self.key, packet_id);
                } else {
                    match self.store.as_mut() {
                        Some(store) => {
                            // delivered once the broker releases it
                            store.store_received(&publish)?;
                        }
                        None => {
                            self.events.push_back(ClientEvent::MessageArrived(Message::from(&publish)));
                        }
                    }
                    self.received.insert(packet_id, publish);
                }

                self.enqueue(PacketEnvelope::new(MqttPacket::Pubrec(PubrecPacket { packet_id }), false));
            }
        }

        Ok(())
    }

    // removes and returns the tracked packet an inbound acknowledgement refers to
    fn take_acknowledged(&mut self, packet_id: u16, packet_types: &[PacketType]) -> Option<PacketEnvelope> {
        let in_sent_table = self.sent.get(&packet_id).map(|envelope| packet_types.contains(&envelope.packet_type())).unwrap_or(false);
        if in_sent_table {
            return self.sent.remove(&packet_id);
        }

        let id = self.queue.find_handed_off(packet_id, packet_types)?;
        self.queue.remove(id)
    }

    fn publish_qos(envelope: &PacketEnvelope) -> Option<QualityOfService> {
        match &envelope.packet {
            MqttPacket::Publish(publish) => { Some(publish.qos) }
            _ => { None }
        }
    }

    fn handle_puback(&mut self, puback: PubackPacket) -> MqttResult<()> {
        info!("[client {}] handle_puback - processing PUBACK packet", self.key);
        self.check_session_packet_allowed("handle_puback", "PUBACK")?;

        let packet_id = puback.packet_id;
        let Some(envelope) = self.take_acknowledged(packet_id, &[PacketType::Publish]) else {
            error!("[client {}] handle_puback - no matching publish corresponding to PUBACK packet id {}", self.key, packet_id);
            return Err(MqttError::new_protocol_error("no pending qos1 publish exists for incoming puback"));
        };

        if Self::publish_qos(&envelope) != Some(QualityOfService::AtLeastOnce) {
            error!("[client {}] handle_puback - PUBACK packet id {} acknowledges a publish that is not QoS 1", self.key, packet_id);
            return Err(MqttError::new_protocol_error("puback for a publish that is not qos1"));
        }

        self.release_packet_id(packet_id);
        if let Some(store) = self.store.as_mut() {
            store.remove_sent(packet_id)?;
        }

        self.notify_delivered(envelope);
        Ok(())
    }

    fn handle_pubrec(&mut self, pubrec: PubrecPacket) -> MqttResult<()> {
        info!("[client {}] handle_pubrec - processing PUBREC packet", self.key);
        self.check_session_packet_allowed("handle_pubrec", "PUBREC")?;

        let packet_id = pubrec.packet_id;
        if let Some(envelope) = self.take_acknowledged(packet_id, &[PacketType::Publish]) {
            if Self::publish_qos(&envelope) != Some(QualityOfService::ExactlyOnce) {
                error!("[client {}] handle_pubrec - PUBREC packet id {} acknowledges a publish that is not QoS 2", self.key, packet_id);
                return Err(MqttError::new_protocol_error("pubrec for a publish that is not qos2"));
            }

            if let Some(store) = self.store.as_mut() {
                store.mark_pubrec_received(packet_id)?;
            }

            let mut pubrel = PacketEnvelope::new(MqttPacket::Pubrel(PubrelPacket { packet_id }), true);
            pubrel.message = envelope.message;
            pubrel.notified = envelope.notified;
            self.enqueue(pubrel);
            return Ok(());
        }

        // the broker repeats PUBREC when it has not seen our PUBREL yet
        let pubrel_pending = self.sent.get(&packet_id).map(|envelope| envelope.packet_type() == PacketType::Pubrel).unwrap_or(false);
        if pubrel_pending {
            debug!("[client {}] handle_pubrec - repeated PUBREC for packet id {}; resending PUBREL", self.key, packet_id);
            if let Some(pubrel) = self.sent.remove(&packet_id) {
                self.enqueue(make_fresh(pubrel));
            }
            return Ok(());
        }

        if self.queue.iter().any(|envelope| envelope.packet_type() == PacketType::Pubrel && envelope.packet_id() == Some(packet_id)) {
            debug!("[client {}] handle_pubrec - repeated PUBREC for packet id {}; PUBREL already queued", self.key, packet_id);
            return Ok(());
        }

        error!("[client {}] handle_pubrec - no matching publish corresponding to PUBREC packet id {}", self.key, packet_id);
        Err(MqttError::new_protocol_error("no pending qos2 publish exists for incoming pubrec"))
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket) -> MqttResult<()> {
        info!("[client {}] handle_pubrel - processing PUBREL packet", self.key);
        self.check_session_packet_allowed("handle_pubrel", "PUBREL")?;

        let packet_id = pubrel.packet_id;
        match self.received.remove(&packet_id) {
            Some(publish) => {
                if let Some(store) = self.store.as_mut() {
                    store.remove_received(packet_id)?;
                    self.events.push_back(ClientEvent::MessageArrived(Message::from(&publish)));
                }
            }
            None => {
                warn!("[client {}] handle_pubrel - no pending QoS 2 publish for PUBREL packet id {}; completing anyway", self.key, packet_id);
            }
        }

        self.enqueue(PacketEnvelope::new(MqttPacket::Pubcomp(PubcompPacket { packet_id }), false));
        Ok(())
    }

    fn handle_pubcomp(&mut self, pubcomp: PubcompPacket) -> MqttResult<()> {
        info!("[client {}] handle_pubcomp - processing PUBCOMP packet", self.key);
        self.check_session_packet_allowed("handle_pubcomp", "PUBCOMP")?;

        let packet_id = pubcomp.packet_id;
        let Some(envelope) = self.take_acknowledged(packet_id, &[PacketType::Pubrel]) else {
            error!("[client {}] handle_pubcomp - no matching pubrel corresponding to PUBCOMP packet id {}", self.key, packet_id);
            return Err(MqttError::new_protocol_error("no pending pubrel exists for incoming pubcomp"));
        };

        self.release_packet_id(packet_id);
        if let Some(store) = self.store.as_mut() {
            store.remove_sent(packet_id)?;
        }

        self.notify_delivered(envelope);
        Ok(())
    }

    fn handle_suback(&mut self, suback: SubackPacket) -> MqttResult<()> {
        info!("[client {}] handle_suback - processing SUBACK packet", self.key);
        self.check_session_packet_allowed("handle_suback", "SUBACK")?;

        let packet_id = suback.packet_id;
        let Some(envelope) = self.take_acknowledged(packet_id, &[PacketType::Subscribe]) else {
            error!("[client {}] handle_suback - no matching subscribe corresponding to SUBACK packet id {}", self.key, packet_id);
            return Err(MqttError::new_protocol_error("no pending subscribe exists for incoming suback"));
        };

        self.release_packet_id(packet_id);

        let Some(return_code) = suback.return_codes.first().copied() else {
            error!("[client {}] handle_suback - SUBACK packet id {} carries no return codes", self.key, packet_id);
            let error = MqttError::new_protocol_error("suback without return codes");
            fail_response(envelope.response, &error);
            return Err(error);
        };

        let result = match return_code.granted_qos() {
            Some(granted_qos) => {
                if !self.is_persistent() {
                    if let MqttPacket::Subscribe(subscribe) = &envelope.packet {
                        for subscription in &subscribe.subscriptions {
                            self.active_subscriptions.insert(subscription.topic_filter.clone(), subscription.qos);
                        }
                    }
                }
                Ok(Some(granted_qos))
            }
            None => {
                warn!("[client {}] handle_suback - subscription rejected by broker", self.key);
                Err(MqttError::new_broker_rejection(PacketType::Suback, return_code as u8))
            }
        };

        complete_response(envelope.response, result);
        Ok(())
    }

    fn handle_unsuback(&mut self, unsuback: UnsubackPacket) -> MqttResult<()> {
        info!("[client {}] handle_unsuback - processing UNSUBACK packet", self.key);
        self.check_session_packet_allowed("handle_unsuback", "UNSUBACK")?;

        let packet_id = unsuback.packet_id;
        let Some(envelope) = self.take_acknowledged(packet_id, &[PacketType::Unsubscribe]) else {
            error!("[client {}] handle_unsuback - no matching unsubscribe corresponding to UNSUBACK packet id {}", self.key, packet_id);
            return Err(MqttError::new_protocol_error("no pending unsubscribe exists for incoming unsuback"));
        };

        self.release_packet_id(packet_id);
        if let MqttPacket::Unsubscribe(unsubscribe) = &envelope.packet {
            for topic_filter in &unsubscribe.topic_filters {
                self.active_subscriptions.remove(topic_filter);
            }
        }

        complete_response(envelope.response, Ok(None));
        Ok(())
    }

    fn acquire_free_packet_id(&mut self) -> MqttResult<u16> {
        let start_id = self.next_packet_id;
        let mut check_id = start_id;

        loop {
            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if self.allocated_packet_ids.insert(check_id) {
                return Ok(check_id);
            }

            if self.next_packet_id == start_id {
                error!("[client {}] acquire_free_packet_id - could not find an unbound packet id", self.key);
                return Err(MqttError::new_internal_state_error("packet id space exhausted"));
            }

            check_id = self.next_packet_id;
        }
    }

    fn reserve_stored_packet_ids(&mut self, store: &SessionStore) -> MqttResult<()> {
        let mut highest_packet_id = 0;
        for item in store.items()? {
            if item.state == StoreItemState::Sent {
                let packet_id = item.body.packet_id;
                self.allocated_packet_ids.insert(packet_id);
                highest_packet_id = highest_packet_id.max(packet_id);
            }
        }

        if highest_packet_id >= self.next_packet_id {
            self.next_packet_id = if highest_packet_id == u16::MAX { 1 } else { highest_packet_id + 1 };
        }

        debug!("[client {}] reserve_stored_packet_ids - {} stored packet ids bound; next packet id {}", self.key, self.allocated_packet_ids.len(), self.next_packet_id);
        Ok(())
    }

    fn release_packet_id(&mut self, packet_id: u16) {
        self.allocated_packet_ids.remove(&packet_id);
    }

    fn rebuild_allocated_packet_ids(&mut self) {
        let ids : HashSet<u16> = self.queue.iter().chain(self.sent.values())
            .filter(|envelope| owns_packet_id(envelope))
            .filter_map(|envelope| envelope.packet_id())
            .collect();

        self.allocated_packet_ids = ids;
    }

    fn rebuild_allocated_packet_ids_from<'a>(&mut self, envelopes: impl Iterator<Item = &'a PacketEnvelope>) {
        self.allocated_packet_ids = envelopes
            .filter(|envelope| owns_packet_id(envelope))
            .filter_map(|envelope| envelope.packet_id())
            .collect();
    }

    #[cfg(test)]
    pub(crate) fn queued_packet_count(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn sent_packet_count(&self) -> usize {
        self.sent.len()
    }

    #[cfg(test)]
    pub(crate) fn received_packet_count(&self) -> usize {
        self.received.len()
    }

    #[cfg(test)]
    pub(crate) fn allocated_packet_id_count(&self) -> usize {
        self.allocated_packet_ids.len()
    }
}
