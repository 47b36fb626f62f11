/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The application message type exchanged with the broker.
 */

use crate::mqtt::{PublishPacket, QualityOfService, WillMessage};

use std::fmt;

/// An MQTT application message.
///
/// The destination topic must not contain wildcard characters; this is checked when the message
/// is handed to a client.  The duplicate flag is read-only: it is only ever set on inbound
/// redeliveries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub(crate) destination: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QualityOfService,
    pub(crate) retained: bool,
    pub(crate) duplicate: bool,
}

impl Message {

    /// Creates a QoS 0, non-retained message
    pub fn new(destination: &str, payload: &[u8]) -> Self {
        Message {
            destination: destination.to_string(),
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    /// Sets the delivery quality of service
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the retained flag
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Topic the message is published to
    pub fn destination(&self) -> &str { self.destination.as_str() }

    /// Message payload
    pub fn payload(&self) -> &[u8] { self.payload.as_slice() }

    /// Delivery quality of service
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Whether the broker retains the message
    pub fn retained(&self) -> bool { self.retained }

    /// Whether this is a possible redelivery of an earlier message
    pub fn duplicate(&self) -> bool { self.duplicate }

    pub(crate) fn to_publish_packet(&self, packet_id: u16) -> PublishPacket {
        PublishPacket {
            packet_id,
            topic: self.destination.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retained,
            duplicate: false,
        }
    }

    pub(crate) fn to_will_message(&self) -> WillMessage {
        WillMessage {
            topic: self.destination.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retained,
        }
    }
}

impl From<&PublishPacket> for Message {
    fn from(publish: &PublishPacket) -> Self {
        Message {
            destination: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.duplicate,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Message {{ destination:\"{}\" qos:{} retained:{} duplicate:{} payload:<{} Bytes> }}",
            self.destination, self.qos, self.retained, self.duplicate, self.payload.len())
    }
}
