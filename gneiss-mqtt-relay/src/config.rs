/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring sessions, connections and subscriptions.
 */

use crate::message::Message;
use crate::mqtt::{ConnectPacket, QualityOfService};
use crate::store::{MemoryStorageBackend, StorageBackend};

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

const DEFAULT_PACKET_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_TRACKED_DESTINATIONS: usize = 4096;
const DEFAULT_MAX_SELECTOR_RESUBMISSIONS: u32 = 8;

/// Configuration options that determine the CONNECT packet a client presents to its broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOptions {
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) clean_session: bool,
    pub(crate) will: Option<Message>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            username: None,
            password: None,
            clean_session: true,
            will: None,
        }
    }
}

impl ConnectOptions {

    /// Creates a new builder object for ConnectOptions
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::new()
    }

    /// Returns the user name presented to the broker, if any
    pub fn username(&self) -> Option<&str> { self.username.as_deref() }

    /// Returns the password presented to the broker, if any
    pub fn password(&self) -> Option<&[u8]> { self.password.as_deref() }

    /// Returns whether the broker should discard prior session state on connect
    pub fn clean_session(&self) -> bool { self.clean_session }

    /// Returns the will message, if any
    pub fn will(&self) -> Option<&Message> { self.will.as_ref() }

    pub(crate) fn to_connect_packet(&self, client_id: Option<&str>) -> ConnectPacket {
        ConnectPacket {
            client_id: client_id.map(str::to_string),
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.as_ref().map(|will| will.to_will_message()),
        }
    }
}

/// A builder for connection-related options on the client.
///
/// These options determine the CONNECT packet the client presents on each connection attempt.
#[derive(Debug, Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder object for ConnectOptions
    pub fn new() -> Self {
        ConnectOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets a string value that the broker may use for client authentication and authorization.
    pub fn with_username(&mut self, username: &str) -> &mut Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets opaque binary data that the broker may use for client authentication and authorization.
    pub fn with_password(&mut self, password: &[u8]) -> &mut Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Sets whether the broker should discard any prior session state for this client.  A
    /// persistent session (false) is only meaningful for clients with an explicit client id.
    pub fn with_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets a message the broker publishes if the client's broker connection ends without a
    /// graceful disconnect.
    pub fn with_will(&mut self, will: Message) -> &mut Self {
        self.options.will = Some(will);
        self
    }

    /// Builds a new ConnectOptions object for client construction
    pub fn build(&self) -> ConnectOptions {
        self.options.clone()
    }
}

/// Options for a subscribe operation
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubscribeOptions {
    pub(crate) qos: QualityOfService,
}

impl SubscribeOptions {

    /// Creates a new builder object for SubscribeOptions
    pub fn builder() -> SubscribeOptionsBuilder {
        SubscribeOptionsBuilder::new()
    }

    /// Maximum QoS requested for messages matching the subscription
    pub fn qos(&self) -> QualityOfService { self.qos }
}

/// Builder type for SubscribeOptions
#[derive(Debug, Default)]
pub struct SubscribeOptionsBuilder {
    options: SubscribeOptions
}

impl SubscribeOptionsBuilder {

    /// Creates a new builder object for SubscribeOptions
    pub fn new() -> Self {
        SubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the maximum QoS requested for messages matching the subscription
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.options.qos = qos;
        self
    }

    /// Creates a new SubscribeOptions object from what was configured on the builder.
    pub fn build(self) -> SubscribeOptions {
        self.options
    }
}

/// Session-wide configuration shared by every client the session creates.
#[derive(Clone)]
pub struct SessionConfig {
    pub(crate) storage: Rc<dyn StorageBackend>,
    pub(crate) packet_ack_timeout: Duration,
    pub(crate) max_tracked_destinations: usize,
    pub(crate) max_selector_resubmissions: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            storage: Rc::new(MemoryStorageBackend::new()),
            packet_ack_timeout: DEFAULT_PACKET_ACK_TIMEOUT,
            max_tracked_destinations: DEFAULT_MAX_TRACKED_DESTINATIONS,
            max_selector_resubmissions: DEFAULT_MAX_SELECTOR_RESUBMISSIONS,
        }
    }
}

impl SessionConfig {

    /// Creates a new builder object for SessionConfig
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Delivery acknowledgement timeout handed to the transport with every packet
    pub fn packet_ack_timeout(&self) -> Duration { self.packet_ack_timeout }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("packet_ack_timeout", &self.packet_ack_timeout)
            .field("max_tracked_destinations", &self.max_tracked_destinations)
            .field("max_selector_resubmissions", &self.max_selector_resubmissions)
            .finish_non_exhaustive()
    }
}

/// Builder type for SessionConfig
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig
}

impl SessionConfigBuilder {

    /// Creates a new builder object for SessionConfig
    pub fn new() -> Self {
        SessionConfigBuilder {
            ..Default::default()
        }
    }

    /// Sets the backend that persistent dedicated clients store their in-flight packets in.
    /// Defaults to a process-local in-memory backend.
    pub fn with_storage(mut self, storage: Rc<dyn StorageBackend>) -> Self {
        self.config.storage = storage;
        self
    }

    /// Sets the delivery acknowledgement timeout handed to the transport with every packet.
    pub fn with_packet_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.packet_ack_timeout = timeout;
        self
    }

    /// Sets how many destinations each shared subscription tracks sequence numbers for.
    pub fn with_max_tracked_destinations(mut self, max_tracked_destinations: usize) -> Self {
        self.config.max_tracked_destinations = max_tracked_destinations;
        self
    }

    /// Sets how many times a shared subscription is resubmitted after selector conflicts before
    /// the subscribe fails.
    pub fn with_max_selector_resubmissions(mut self, max_selector_resubmissions: u32) -> Self {
        self.config.max_selector_resubmissions = max_selector_resubmissions;
        self
    }

    /// Builds a new SessionConfig
    pub fn build(self) -> SessionConfig {
        self.config
    }
}
