/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A session owns the clients talking through one push transport and routes everything the
transport reports back to the client (or shared subscription) it belongs to.
 */

use crate::client::{ClientInner, MqttClient};
use crate::config::SessionConfig;
use crate::error::{MqttError, MqttResult};
use crate::protocol::{ClientState, ClientStateConfig};
use crate::shared::SharedSubscriptionRegistry;
use crate::store::{self_test, MemoryStorageBackend, StorageBackend};
use crate::transport::*;
use crate::validate::{validate_broker_alias, validate_client_id};

use log::*;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Factory and event router for the clients of one push transport.
///
/// The application feeds every event the transport produces into
/// [`handle_transport_event`](Session::handle_transport_event).  Events are processed one at a
/// time; client handlers run before the call returns.
pub struct Session {
    session_id: String,
    transport: SharedTransport,
    config: SessionConfig,
    shared_registry: Rc<RefCell<SharedSubscriptionRegistry>>,
    clients: HashMap<ClientKey, Weak<ClientInner>>,
    next_client_key: u64,
    closed: bool,
}

impl Session {

    /// Creates a session on top of a transport.  A storage backend that fails its self-test is
    /// replaced by an in-memory one.
    pub fn new(session_id: &str, transport: SharedTransport, mut config: SessionConfig) -> Session {
        if !self_test(config.storage.as_ref()) {
            error!("session \"{}\" - storage backend failed its self-test; falling back to in-memory storage", session_id);
            config.storage = Rc::new(MemoryStorageBackend::new());
        }

        info!("session \"{}\" - created with {:?}", session_id, config);

        Session {
            session_id: session_id.to_string(),
            shared_registry: Rc::new(RefCell::new(SharedSubscriptionRegistry::new(config.max_tracked_destinations, config.max_selector_resubmissions))),
            transport,
            config,
            clients: HashMap::new(),
            next_client_key: 1,
            closed: false,
        }
    }

    /// Id the session was created with
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn live_clients(&mut self) -> Vec<MqttClient> {
        self.clients.retain(|_, inner| inner.strong_count() > 0);
        self.clients.values()
            .filter_map(|inner| inner.upgrade())
            .map(MqttClient::from_inner)
            .collect()
    }

    fn find_client(&self, key: ClientKey) -> Option<MqttClient> {
        self.clients.get(&key)
            .and_then(|inner| inner.upgrade())
            .map(MqttClient::from_inner)
    }

    /// Creates a client for a broker alias.  Supplying a client id gives the client a dedicated
    /// broker connection; omitting it makes the client share one.
    pub fn create_client(&mut self, broker_alias: &str, client_id: Option<&str>) -> MqttResult<MqttClient> {
        if self.closed {
            error!("session \"{}\" - create_client called on a closed session", self.session_id);
            return Err(MqttError::new_invalid_state("session is closed"));
        }

        validate_broker_alias(broker_alias)?;
        let client_id = client_id.map(str::to_string);
        validate_client_id(&client_id)?;

        if let Some(client_id) = &client_id {
            let in_use = self.live_clients().iter()
                .any(|client| client.client_id().as_ref() == Some(client_id) && client.broker_alias() == broker_alias);
            if in_use {
                error!("session \"{}\" - client id \"{}\" already in use for broker \"{}\"", self.session_id, client_id, broker_alias);
                return Err(MqttError::new_invalid_argument("client id already in use for this broker"));
            }
        }

        let key = ClientKey(self.next_client_key);
        self.next_client_key += 1;

        let state = ClientState::new(ClientStateConfig {
            key,
            broker_alias: broker_alias.to_string(),
            client_id,
            transport: self.transport.clone(),
            shared_registry: self.shared_registry.clone(),
            storage: self.config.storage.clone(),
            packet_ack_timeout: self.config.packet_ack_timeout,
        });

        let client = MqttClient::new(state);
        self.clients.insert(key, client.downgrade());

        info!("session \"{}\" - created client {} for broker \"{}\"", self.session_id, key, broker_alias);
        Ok(client)
    }

    /// Processes one event reported by the transport
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StatusChanged(status) => {
                info!("session \"{}\" - transport status changed to {}", self.session_id, status);
                for client in self.live_clients() {
                    client.with_state(|state| state.handle_status_change(status));
                }
            }
            TransportEvent::Subscription { tag: SubscriptionTag::Connection { client, attempt }, event } => {
                match self.find_client(client) {
                    Some(client) => {
                        client.with_state(|state| state.handle_connection_event(attempt, event));
                    }
                    None => {
                        debug!("session \"{}\" - dropping connection event for unknown client {}", self.session_id, client);
                    }
                }
            }
            TransportEvent::Subscription { tag: SubscriptionTag::SharedTopic { connection_id, topic_filter, selector }, event } => {
                let deliveries = self.shared_registry.borrow_mut().handle_subscription_event(&self.transport, &connection_id, &topic_filter, &selector, event);
                for delivery in deliveries {
                    match self.find_client(delivery.client) {
                        Some(client) => {
                            client.with_state(|state| state.deliver_shared_message(delivery.message));
                        }
                        None => {
                            debug!("session \"{}\" - dropping shared message for unknown client {}", self.session_id, delivery.client);
                        }
                    }
                }
            }
            TransportEvent::SendOutcome { tag, outcome } => {
                match self.find_client(tag.client) {
                    Some(client) => {
                        client.with_state(|state| state.handle_send_outcome(tag.request, outcome));
                    }
                    None => {
                        debug!("session \"{}\" - dropping send outcome for unknown client {}", self.session_id, tag.client);
                    }
                }
            }
        }
    }

    /// Shuts every client down.  Clients with a connection report it lost with
    /// [`MqttError::ClientClosed`]; pending operations fail the same way.
    pub fn close(&mut self) {
        info!("session \"{}\" - closing", self.session_id);
        for client in self.live_clients() {
            client.with_state(|state| state.close());
        }

        self.clients.clear();
        self.closed = true;
    }
}
