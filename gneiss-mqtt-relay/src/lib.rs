/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
An MQTT 3.1.1 client protocol engine that speaks to its broker through a push transport rather
than a socket.

The transport (an external collaborator implementing [`PushTransport`]) carries subscriptions
and one-shot packet sends; a [`Session`] creates clients on top of it and routes every transport
event back to the client or shared subscription it belongs to.

Clients created with a client id get a dedicated broker connection with full QoS 0/1/2 flows and
optional persistent sessions backed by a [`StorageBackend`].  Clients created without one share a
broker connection; their subscriptions are aggregated into one physical subscription per topic
filter.

Everything runs on a single thread.  Operations never block: connect, subscribe and unsubscribe
return futures that resolve as the session processes transport events, and everything else is
reported through optional handlers on the client.
 */

pub mod client;
pub mod config;
pub mod error;
mod logging;
pub mod message;
pub mod mqtt;
mod protocol;
mod queue;
pub mod session;
mod shared;
pub mod store;
pub mod transport;
mod validate;


/* Re-export the commonly used types at the root level */
pub use client::*;
pub use config::*;
pub use error::{MqttError, MqttResult};
pub use message::Message;
pub use mqtt::QualityOfService;
pub use session::Session;
pub use store::{MemoryStorageBackend, StorageBackend};
pub use transport::{PushTransport, SharedTransport, TransportEvent};
