/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing miscellaneous conversion functions for the packet model.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

use std::fmt;

/// Converts an integer to an MQTT quality of service value, failing on anything outside 0..=2
pub fn convert_u8_to_quality_of_service(value: u8) -> MqttResult<QualityOfService> {
    match value {
        0 => { Ok(QualityOfService::AtMostOnce) }
        1 => { Ok(QualityOfService::AtLeastOnce) }
        2 => { Ok(QualityOfService::ExactlyOnce) }
        _ => { Err(MqttError::new_invalid_argument(format!("invalid quality of service value: {}", value))) }
    }
}

pub(crate) fn quality_of_service_to_str(qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce (0)" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce (1)" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce (2)" }
    }
}

pub(crate) fn connect_return_code_to_str(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Accepted => { "Accepted" }
        ConnectReturnCode::UnacceptableProtocolVersion => { "UnacceptableProtocolVersion" }
        ConnectReturnCode::IdentifierRejected => { "IdentifierRejected" }
        ConnectReturnCode::ServerUnavailable => { "ServerUnavailable" }
        ConnectReturnCode::BadUsernameOrPassword => { "BadUsernameOrPassword" }
        ConnectReturnCode::NotAuthorized => { "NotAuthorized" }
    }
}

pub(crate) fn suback_return_code_to_str(code: SubackReturnCode) -> &'static str {
    match code {
        SubackReturnCode::GrantedQos0 => { "GrantedQos0" }
        SubackReturnCode::GrantedQos1 => { "GrantedQos1" }
        SubackReturnCode::GrantedQos2 => { "GrantedQos2" }
        SubackReturnCode::Failure => { "Failure" }
    }
}

pub(crate) fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish}
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
    }
}

pub(crate) fn packet_type_to_str(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::Connect => { "CONNECT" }
        PacketType::Connack => { "CONNACK" }
        PacketType::Publish => { "PUBLISH" }
        PacketType::Puback => { "PUBACK" }
        PacketType::Pubrec => { "PUBREC" }
        PacketType::Pubrel => { "PUBREL" }
        PacketType::Pubcomp => { "PUBCOMP" }
        PacketType::Subscribe => { "SUBSCRIBE" }
        PacketType::Suback => { "SUBACK" }
        PacketType::Unsubscribe => { "UNSUBSCRIBE" }
        PacketType::Unsuback => { "UNSUBACK" }
        PacketType::Disconnect => { "DISCONNECT" }
    }
}

/// Packet id of the packet, for the packet types that carry one
pub(crate) fn mqtt_packet_to_packet_id(packet: &MqttPacket) -> Option<u16> {
    match packet {
        MqttPacket::Publish(publish) => {
            if publish.qos == QualityOfService::AtMostOnce {
                None
            } else {
                Some(publish.packet_id)
            }
        }
        MqttPacket::Puback(puback) => { Some(puback.packet_id) }
        MqttPacket::Pubrec(pubrec) => { Some(pubrec.packet_id) }
        MqttPacket::Pubrel(pubrel) => { Some(pubrel.packet_id) }
        MqttPacket::Pubcomp(pubcomp) => { Some(pubcomp.packet_id) }
        MqttPacket::Subscribe(subscribe) => { Some(subscribe.packet_id) }
        MqttPacket::Suback(suback) => { Some(suback.packet_id) }
        MqttPacket::Unsubscribe(unsubscribe) => { Some(unsubscribe.packet_id) }
        MqttPacket::Unsuback(unsuback) => { Some(unsuback.packet_id) }
        _ => { None }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", packet_type_to_str(*self))
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", quality_of_service_to_str(*self))
    }
}
