/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The interface between clients and the push transport that carries their packets.

The transport is an external collaborator: it owns the real-time connection to the server,
carries subscriptions (streams of updates) and one-shot packet sends.  Clients only ever touch it
through [`PushTransport`]; everything the transport reports back flows into
[`Session::handle_transport_event`](crate::session::Session::handle_transport_event) as a
[`TransportEvent`].
 */

use crate::mqtt::{ConnectPacket, QualityOfService, WirePacket};

use sha2::{Digest, Sha256};

use std::cell::RefCell;
use std::fmt;
use std::fmt::Write;
use std::rc::Rc;
use std::time::Duration;

/// Session-scoped identity of a client
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ClientKey(pub(crate) u64);

impl ClientKey {

    /// Raw numeric value of the key
    pub fn value(&self) -> u64 { self.0 }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one transport subscription.  The transport echoes it back with every event for that
/// subscription.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum SubscriptionTag {

    /// A client's connection stream for one connect attempt
    Connection {

        /// owning client
        client: ClientKey,

        /// connect attempt the stream belongs to
        attempt: u64,
    },

    /// A physical subscription shared by all clients of a shared connection
    SharedTopic {

        /// id of the shared broker connection
        connection_id: String,

        /// topic filter of the physical subscription
        topic_filter: String,

        /// selector distinguishing this submission from earlier ones for the same filter
        selector: String,
    },
}

/// What a transport subscription asks the server for
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionDescriptor {

    /// Open (or join) a broker connection and stream its inbound packets
    Connection {

        /// id of the broker connection
        connection_id: String,

        /// CONNECT presented to the broker
        connect: ConnectPacket,
    },

    /// Subscribe a shared broker connection to a topic filter
    SharedTopic {

        /// id of the shared broker connection
        connection_id: String,

        /// topic filter to subscribe to
        topic_filter: String,

        /// QoS the broker subscription is requested at
        qos: QualityOfService,

        /// opaque selector for this submission
        selector: String,
    },
}

/// A subscription request handed to [`PushTransport::subscribe`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportSubscription {

    /// Tag the transport must attach to every event of this subscription
    pub tag: SubscriptionTag,

    /// What to subscribe to
    pub descriptor: SubscriptionDescriptor,
}

/// Identifies one packet send.  Echoed back with the send's outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SendTag {

    /// client that sent the packet
    pub client: ClientKey,

    /// client-local request number
    pub request: u64,
}

/// A packet send handed to [`PushTransport::send_packet`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendRequest {

    /// Tag the transport must attach to the send outcome
    pub tag: SendTag,

    /// Packet to deliver
    pub packet: WirePacket,

    /// How long the transport may wait for delivery before reporting an abort
    pub ack_timeout: Duration,
}

/// Connection status vocabulary of the push transport
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportStatus {

    /// The transport is establishing its connection
    Connecting,

    /// Connected with a streaming channel
    ConnectedStreaming,

    /// Connected with a polling channel
    ConnectedPolling,

    /// Connection lost; the transport will open a new connection and reissue subscriptions
    DisconnectedWillRetry,

    /// Connection interrupted; the transport is trying to resume the same stream without loss
    DisconnectedTryingRecovery,

    /// Connection terminated for good
    Disconnected,
}

impl TransportStatus {

    /// Returns true for the connected statuses
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStatus::ConnectedStreaming | TransportStatus::ConnectedPolling)
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportStatus::Connecting => { write!(f, "Connecting") }
            TransportStatus::ConnectedStreaming => { write!(f, "ConnectedStreaming") }
            TransportStatus::ConnectedPolling => { write!(f, "ConnectedPolling") }
            TransportStatus::DisconnectedWillRetry => { write!(f, "DisconnectedWillRetry") }
            TransportStatus::DisconnectedTryingRecovery => { write!(f, "DisconnectedTryingRecovery") }
            TransportStatus::Disconnected => { write!(f, "Disconnected") }
        }
    }
}

/// A message delivered on a physical shared subscription
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedMessageUpdate {

    /// concrete topic the message was published to
    pub destination: String,

    /// message payload
    pub payload: Vec<u8>,

    /// QoS the message was delivered with
    pub qos: QualityOfService,

    /// retained flag
    pub retained: bool,

    /// monotonic sequence number scoped to the destination
    pub sequence: u64,
}

/// Content of one subscription update
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionUpdate {

    /// A packet from the broker
    Packet(WirePacket),

    /// A message fanned out on a shared subscription
    Message(SharedMessageUpdate),
}

/// Event reported by the transport for one subscription
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionEvent {

    /// The server accepted the subscription
    Subscribed,

    /// A new update arrived
    Update(SubscriptionUpdate),

    /// The server refused or terminated the subscription
    Failed {

        /// server error code; negative for denials
        code: i32,

        /// opaque message
        message: Option<String>,
    },

    /// The subscription ended
    Unsubscribed,
}

/// Final outcome of a packet send
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SendOutcome {

    /// The server processed the packet
    Processed,

    /// The server dropped the packet without processing it
    Discarded,

    /// The send was interrupted by a connection problem or timed out
    Aborted,

    /// The server denied the packet
    Denied {

        /// negative denial code
        code: i32,

        /// opaque message
        message: Option<String>,
    },

    /// The server failed while processing the packet
    Error {

        /// server error code
        code: i32,

        /// opaque message
        message: Option<String>,
    },
}

/// Everything the transport reports back to a session
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {

    /// The transport's connection status changed
    StatusChanged(TransportStatus),

    /// Something happened on a subscription
    Subscription {

        /// tag of the subscription
        tag: SubscriptionTag,

        /// what happened
        event: SubscriptionEvent,
    },

    /// A packet send completed
    SendOutcome {

        /// tag of the send
        tag: SendTag,

        /// how it completed
        outcome: SendOutcome,
    },
}

/// The primitives a push transport offers to clients.
///
/// Implementations must not report events synchronously from inside these calls; events are
/// fed back later through the owning session.  Subscriptions are expected to survive transport
/// reconnections (the transport reissues them).
pub trait PushTransport {

    /// Starts a subscription
    fn subscribe(&mut self, subscription: TransportSubscription);

    /// Ends a subscription previously started with the same tag
    fn unsubscribe(&mut self, tag: &SubscriptionTag);

    /// Sends a packet; exactly one outcome is reported later for the request's tag
    fn send_packet(&mut self, request: SendRequest);
}

/// Handle to the transport shared by every client of a session
pub type SharedTransport = Rc<RefCell<dyn PushTransport>>;

/// Everything that identifies one broker connection.  Renders deterministically to the
/// connection id the server uses to route packets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConnectionKey {
    pub broker_alias: String,
    pub username: Option<String>,
    pub password_digest: Option<String>,
    pub clean_session: bool,
    pub client_id: Option<String>,
    pub attempt: u64,
}

impl ConnectionKey {

    pub(crate) fn new(broker_alias: &str, username: Option<&str>, password: Option<&[u8]>, clean_session: bool, client_id: Option<&str>, attempt: u64) -> Self {
        ConnectionKey {
            broker_alias: broker_alias.to_string(),
            username: username.map(str::to_string),
            password_digest: password.map(|password| format!("{:x}", Sha256::digest(password))),
            clean_session,
            client_id: client_id.map(str::to_string),
            attempt,
        }
    }

    pub(crate) fn to_connection_id(&self) -> String {
        let mut id = String::new();
        write_length_prefixed(&mut id, Some(&self.broker_alias));
        write_length_prefixed(&mut id, self.username.as_deref());
        write_length_prefixed(&mut id, self.password_digest.as_deref());
        id.push_str(if self.clean_session { "c|" } else { "p|" });
        write_length_prefixed(&mut id, self.client_id.as_deref());
        write!(&mut id, "{}", self.attempt).ok();
        id
    }
}

fn write_length_prefixed(id: &mut String, value: Option<&str>) {
    match value {
        Some(value) => { write!(id, "{}:{}|", value.len(), value).ok(); }
        None => { id.push_str("-|"); }
    }
}
