/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public MQTT client and associated types necessary to invoke operations on it.
 */

use crate::config::*;
use crate::error::{MqttError, MqttResult};
use crate::message::Message;
use crate::mqtt::QualityOfService;
use crate::protocol::*;
use crate::transport::ClientKey;

use futures::channel::oneshot;
use log::*;

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Lifecycle states of a client
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientStatus {

    /// Not connected; the only state `connect` is valid in
    Disconnected,

    /// Waiting for the broker's CONNACK
    Connecting,

    /// Connected to the broker
    Connected,

    /// The transport lost its connection and is establishing a new one
    Retry,

    /// The transport is trying to resume an interrupted connection without loss
    Recovery,

    /// A graceful DISCONNECT is on its way to the broker
    Disconnecting,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientStatus::Disconnected => { write!(f, "Disconnected") }
            ClientStatus::Connecting => { write!(f, "Connecting") }
            ClientStatus::Connected => { write!(f, "Connected") }
            ClientStatus::Retry => { write!(f, "Retry") }
            ClientStatus::Recovery => { write!(f, "Recovery") }
            ClientStatus::Disconnecting => { write!(f, "Disconnecting") }
        }
    }
}

/// Successful outcome of a connect
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionSuccess {

    /// Whether the broker resumed an existing session
    pub session_present: bool,
}

/// Result type for a connect operation
pub type ConnectResult = MqttResult<ConnectionSuccess>;

/// Return type of a connect operation
pub type ConnectResultFuture = Pin<Box<dyn Future<Output = ConnectResult>>>;

/// Result type for a subscribe operation.  On success, carries the QoS messages on the
/// subscription are delivered with.
pub type SubscribeResult = MqttResult<QualityOfService>;

/// Return type of a subscribe operation
pub type SubscribeResultFuture = Pin<Box<dyn Future<Output = SubscribeResult>>>;

/// Result type for an unsubscribe operation
pub type UnsubscribeResult = MqttResult<()>;

/// Return type of an unsubscribe operation
pub type UnsubscribeResultFuture = Pin<Box<dyn Future<Output = UnsubscribeResult>>>;

fn make_result_future<T: 'static>(receiver: oneshot::Receiver<MqttResult<T>>) -> Pin<Box<dyn Future<Output = MqttResult<T>>>> {
    Box::pin(async move {
        receiver.await?
    })
}

// Notifications produced by the protocol engine, dispatched once the engine is no longer borrowed
pub(crate) enum ClientEvent {
    ConnectionLost(MqttError),
    ReconnectionStart,
    ReconnectionComplete,
    MessageArrived(Message),
    MessageDelivered(Message),
    MessageNotAuthorized(Message, MqttError),
}

/// Callback invoked when an established connection is lost
pub type ConnectionLostHandler = Rc<dyn Fn(&MqttError)>;

/// Callback invoked when the client starts or finishes re-establishing a connection
pub type ReconnectionHandler = Rc<dyn Fn()>;

/// Callback invoked with an application message
pub type MessageHandler = Rc<dyn Fn(&Message)>;

/// Callback invoked with a message the server refused to accept
pub type MessageNotAuthorizedHandler = Rc<dyn Fn(&Message, &MqttError)>;

#[derive(Default)]
pub(crate) struct ClientHandlers {
    on_connection_lost: Option<ConnectionLostHandler>,
    on_reconnection_start: Option<ReconnectionHandler>,
    on_reconnection_complete: Option<ReconnectionHandler>,
    on_message_arrived: Option<MessageHandler>,
    on_message_delivered: Option<MessageHandler>,
    on_message_not_authorized: Option<MessageNotAuthorizedHandler>,
}

pub(crate) struct ClientInner {
    pub(crate) state: RefCell<ClientState>,
    handlers: RefCell<ClientHandlers>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.state.get_mut().release();
    }
}

/// An MQTT client bound to one broker alias, created by a [`Session`](crate::session::Session).
///
/// A client with a client id owns a dedicated broker connection; a client without one shares a
/// broker connection with every other shared client of the session that uses the same broker
/// and credentials.
///
/// Operations never block.  `connect`, `subscribe` and `unsubscribe` return futures that resolve
/// once the broker answered; invalid arguments and invalid states are reported synchronously.
/// Everything else the client has to say is delivered through the optional handlers.
///
/// Handles are cheap to clone; every clone refers to the same client.
#[derive(Clone)]
pub struct MqttClient {
    inner: Rc<ClientInner>,
}

impl MqttClient {

    pub(crate) fn new(state: ClientState) -> Self {
        MqttClient {
            inner: Rc::new(ClientInner {
                state: RefCell::new(state),
                handlers: RefCell::new(ClientHandlers::default()),
            })
        }
    }

    pub(crate) fn from_inner(inner: Rc<ClientInner>) -> Self {
        MqttClient { inner }
    }

    pub(crate) fn downgrade(&self) -> std::rc::Weak<ClientInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn key(&self) -> ClientKey {
        self.inner.state.borrow().key()
    }

    /// Runs a closure against the engine, then dispatches whatever the engine had to report
    pub(crate) fn with_state<T, F>(&self, f: F) -> T where F : FnOnce(&mut ClientState) -> T {
        let (result, events) = {
            let mut state = self.inner.state.borrow_mut();
            let result = f(&mut state);
            (result, state.take_events())
        };

        for event in events {
            self.dispatch(event);
        }

        result
    }

    fn dispatch(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionLost(error) => {
                let handler = self.inner.handlers.borrow().on_connection_lost.clone();
                if let Some(handler) = handler {
                    handler(&error);
                }
            }
            ClientEvent::ReconnectionStart => {
                let handler = self.inner.handlers.borrow().on_reconnection_start.clone();
                if let Some(handler) = handler {
                    handler();
                }
            }
            ClientEvent::ReconnectionComplete => {
                let handler = self.inner.handlers.borrow().on_reconnection_complete.clone();
                if let Some(handler) = handler {
                    handler();
                }
            }
            ClientEvent::MessageArrived(message) => {
                let handler = self.inner.handlers.borrow().on_message_arrived.clone();
                if let Some(handler) = handler {
                    handler(&message);
                }
            }
            ClientEvent::MessageDelivered(message) => {
                let handler = self.inner.handlers.borrow().on_message_delivered.clone();
                if let Some(handler) = handler {
                    handler(&message);
                }
            }
            ClientEvent::MessageNotAuthorized(message, error) => {
                let handler = self.inner.handlers.borrow().on_message_not_authorized.clone();
                if let Some(handler) = handler {
                    handler(&message, &error);
                }
            }
        }
    }

    /// Starts connecting to the broker.  Only valid while the client is disconnected.
    ///
    /// The returned future resolves once the broker accepted or refused the connection.  An
    /// authorization denial resolves to [`MqttError::NotAuthorized`].
    pub fn connect(&self, options: ConnectOptions) -> MqttResult<ConnectResultFuture> {
        let receiver = self.with_state(|state| state.connect(options))?;
        Ok(make_result_future(receiver))
    }

    /// Disconnects from the broker.  A connected client sends a DISCONNECT after everything
    /// queued before it; a client that is still (re)connecting gives up immediately.
    pub fn disconnect(&self) -> MqttResult<()> {
        self.with_state(|state| state.disconnect())
    }

    /// Subscribes to a topic filter.  On success the future yields the QoS matching messages
    /// are delivered with.
    pub fn subscribe(&self, topic_filter: &str, options: SubscribeOptions) -> MqttResult<SubscribeResultFuture> {
        let receiver = self.with_state(|state| state.subscribe(topic_filter, options))?;
        Ok(make_result_future(receiver))
    }

    /// Unsubscribes from a topic filter
    pub fn unsubscribe(&self, topic_filter: &str) -> MqttResult<UnsubscribeResultFuture> {
        let receiver = self.with_state(|state| state.unsubscribe(topic_filter))?;
        Ok(make_result_future(receiver))
    }

    /// Sends an application message.  Delivery of QoS 1 and QoS 2 messages is reported through
    /// the message-delivered handler, refusals through the message-not-authorized handler.
    pub fn send(&self, message: Message) -> MqttResult<()> {
        self.with_state(|state| state.send(message))
    }

    /// Sends an application message built from its parts
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, retained: bool) -> MqttResult<()> {
        self.send(Message::new(topic, payload).with_qos(qos).with_retained(retained))
    }

    /// Current lifecycle state
    pub fn status(&self) -> ClientStatus {
        self.inner.state.borrow().status()
    }

    /// Client id of a dedicated client; None for shared clients
    pub fn client_id(&self) -> Option<String> {
        self.inner.state.borrow().client_id().map(str::to_string)
    }

    /// Alias of the broker this client talks to
    pub fn broker_alias(&self) -> String {
        self.inner.state.borrow().broker_alias().to_string()
    }

    /// Returns true if this client multiplexes a broker connection with other clients
    pub fn is_shared(&self) -> bool {
        self.inner.state.borrow().is_shared()
    }

    /// Sets the handler invoked when an established connection is lost for good
    pub fn set_on_connection_lost(&self, handler: Option<ConnectionLostHandler>) {
        self.inner.handlers.borrow_mut().on_connection_lost = handler;
    }

    /// Sets the handler invoked when the transport starts re-establishing a lost connection
    pub fn set_on_reconnection_start(&self, handler: Option<ReconnectionHandler>) {
        self.inner.handlers.borrow_mut().on_reconnection_start = handler;
    }

    /// Sets the handler invoked when a lost connection is re-established
    pub fn set_on_reconnection_complete(&self, handler: Option<ReconnectionHandler>) {
        self.inner.handlers.borrow_mut().on_reconnection_complete = handler;
    }

    /// Sets the handler invoked for every inbound application message
    pub fn set_on_message_arrived(&self, handler: Option<MessageHandler>) {
        self.inner.handlers.borrow_mut().on_message_arrived = handler;
    }

    /// Sets the handler invoked once a sent message is delivered
    pub fn set_on_message_delivered(&self, handler: Option<MessageHandler>) {
        self.inner.handlers.borrow_mut().on_message_delivered = handler;
    }

    /// Sets the handler invoked when the server refuses a sent message
    pub fn set_on_message_not_authorized(&self, handler: Option<MessageNotAuthorizedHandler>) {
        self.inner.handlers.borrow_mut().on_message_not_authorized = handler;
    }

    /// Removes every handler
    pub fn clear_handlers(&self) {
        debug!("[client {}] clear_handlers - removing all handlers", self.key());
        *self.inner.handlers.borrow_mut() = ClientHandlers::default();
    }
}

impl fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("MqttClient")
            .field("key", &state.key())
            .field("broker_alias", &state.broker_alias())
            .field("client_id", &state.client_id())
            .field("status", &state.status())
            .finish()
    }
}
