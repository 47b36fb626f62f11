/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model the MQTT 3.1.1 control packets the
client exchanges with a broker through the push transport.
 */

use serde::{Deserialize, Serialize};

use crate::error::MqttError;

pub(crate) mod ack;
pub(crate) mod connect;
pub(crate) mod publish;
pub(crate) mod subscribe;
pub mod utils;

/// MQTT message delivery quality of service.
///
/// Enum values match the MQTT 3.1.1 encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

/// Return code carried by a CONNACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectReturnCode {

    /// The connection was accepted.
    #[default]
    Accepted = 0,

    /// The broker does not support the requested protocol level.
    UnacceptableProtocolVersion = 1,

    /// The client identifier is well-formed but not allowed by the broker.
    IdentifierRejected = 2,

    /// The MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The user name or password is malformed.
    BadUsernameOrPassword = 4,

    /// The client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {

    /// Returns whether or not the return code represents a successful connection
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

/// Per-subscription return code carried by a SUBACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubackReturnCode {

    /// Subscription accepted, maximum granted QoS 0
    #[default]
    GrantedQos0 = 0,

    /// Subscription accepted, maximum granted QoS 1
    GrantedQos1 = 1,

    /// Subscription accepted, maximum granted QoS 2
    GrantedQos2 = 2,

    /// The broker refused the subscription
    Failure = 128,
}

impl SubackReturnCode {

    /// Returns whether or not the return code represents a successful subscription
    pub fn is_success(&self) -> bool {
        !matches!(self, SubackReturnCode::Failure)
    }

    /// Returns the QoS granted by the broker, or None if the subscription was refused
    pub fn granted_qos(&self) -> Option<QualityOfService> {
        match self {
            SubackReturnCode::GrantedQos0 => { Some(QualityOfService::AtMostOnce) }
            SubackReturnCode::GrantedQos1 => { Some(QualityOfService::AtLeastOnce) }
            SubackReturnCode::GrantedQos2 => { Some(QualityOfService::ExactlyOnce) }
            SubackReturnCode::Failure => { None }
        }
    }
}

impl From<QualityOfService> for SubackReturnCode {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => { SubackReturnCode::GrantedQos0 }
            QualityOfService::AtLeastOnce => { SubackReturnCode::GrantedQos1 }
            QualityOfService::ExactlyOnce => { SubackReturnCode::GrantedQos2 }
        }
    }
}

/// An enum indicating the kind of MQTT packet
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    /// A [Connect](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028) packet
    Connect,

    /// A [Connack](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033) packet
    Connack,

    /// A [Publish](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037) packet
    Publish,

    /// A [Puback](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718043) packet
    Puback,

    /// A [Pubrec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718048) packet
    Pubrec,

    /// A [Pubrel](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718053) packet
    Pubrel,

    /// A [Pubcomp](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718058) packet
    Pubcomp,

    /// A [Subscribe](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063) packet
    Subscribe,

    /// A [Suback](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718068) packet
    Suback,

    /// An [Unsubscribe](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718072) packet
    Unsubscribe,

    /// An [Unsuback](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718077) packet
    Unsuback,

    /// A [Disconnect](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718090) packet
    Disconnect,
}

/// Will message attached to a CONNECT packet.  Published by the broker if the client's broker
/// connection ends without a DISCONNECT.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WillMessage {

    /// Topic the will is published to
    pub topic: String,

    /// Will payload
    pub payload: Vec<u8>,

    /// Delivery QoS of the will
    pub qos: QualityOfService,

    /// Whether the broker retains the will
    pub retain: bool,
}

/// Data model of a CONNECT packet.  Travels inside the connection subscription descriptor
/// rather than through a packet send.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPacket {

    /// Client identifier; None for shared connections
    pub client_id: Option<String>,

    /// Clean session flag
    pub clean_session: bool,

    /// Optional user name
    pub username: Option<String>,

    /// Optional password
    pub password: Option<Vec<u8>>,

    /// Optional will message
    pub will: Option<WillMessage>,
}

/// Data model of a CONNACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnackPacket {

    /// Whether the broker resumed an existing session
    pub session_present: bool,

    /// Outcome of the connect
    pub return_code: ConnectReturnCode,
}

/// Data model of a PUBLISH packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPacket {

    /// Packet identifier; zero for QoS 0
    pub packet_id: u16,

    /// Destination topic
    pub topic: String,

    /// Message payload
    pub payload: Vec<u8>,

    /// Delivery QoS
    pub qos: QualityOfService,

    /// Retain flag
    pub retain: bool,

    /// Duplicate delivery flag
    pub duplicate: bool,
}

/// Data model of a PUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubackPacket {

    /// Id of the QoS 1 publish this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of a PUBREC packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubrecPacket {

    /// Id of the QoS 2 publish this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of a PUBREL packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubrelPacket {

    /// Id of the QoS 2 publish this packet corresponds to
    pub packet_id: u16,
}

/// Data model of a PUBCOMP packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubcompPacket {

    /// Id of the QoS 2 publish this packet corresponds to
    pub packet_id: u16,
}

/// A single topic filter and requested QoS inside a SUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {

    /// Topic filter to subscribe to
    pub topic_filter: String,

    /// Maximum QoS requested for matching messages
    pub qos: QualityOfService,
}

/// Data model of a SUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePacket {

    /// Packet identifier
    pub packet_id: u16,

    /// Topic filters to subscribe to
    pub subscriptions: Vec<Subscription>,
}

/// Data model of a SUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubackPacket {

    /// Id of the SUBSCRIBE this packet is acknowledging
    pub packet_id: u16,

    /// One return code per requested subscription, in order
    pub return_codes: Vec<SubackReturnCode>,
}

/// Data model of an UNSUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePacket {

    /// Packet identifier
    pub packet_id: u16,

    /// Topic filters to unsubscribe from
    pub topic_filters: Vec<String>,
}

/// Data model of an UNSUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubackPacket {

    /// Id of the UNSUBSCRIBE this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of a DISCONNECT packet
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPacket {}

/// Algebraic union of all MQTT packets the client exchanges with the broker.
///
/// Serializes as a flat structure tagged by packet `type`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum MqttPacket {

    /// Connection request (client to broker)
    Connect(ConnectPacket),

    /// Connection acknowledgement (broker to client)
    Connack(ConnackPacket),

    /// Application message (both directions)
    Publish(PublishPacket),

    /// QoS 1 acknowledgement (both directions)
    Puback(PubackPacket),

    /// QoS 2 first acknowledgement (both directions)
    Pubrec(PubrecPacket),

    /// QoS 2 release (both directions)
    Pubrel(PubrelPacket),

    /// QoS 2 completion (both directions)
    Pubcomp(PubcompPacket),

    /// Subscription request (client to broker)
    Subscribe(SubscribePacket),

    /// Subscription acknowledgement (broker to client)
    Suback(SubackPacket),

    /// Unsubscribe request (client to broker)
    Unsubscribe(UnsubscribePacket),

    /// Unsubscribe acknowledgement (broker to client)
    Unsuback(UnsubackPacket),

    /// Graceful disconnect (client to broker)
    Disconnect(DisconnectPacket),
}

/// A packet as it crosses the push transport: the packet body plus the id of the broker
/// connection it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePacket {

    /// Id of the broker connection this packet belongs to
    pub connection_id: String,

    /// The packet itself
    pub packet: MqttPacket,
}
