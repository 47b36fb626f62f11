/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::*;
use crate::mqtt::utils::mqtt_packet_to_packet_type;
use log::*;
use std::fmt;

/// Writes one ` name:value` pair of a packet's display form.
///
/// The leading keyword picks how the value is rendered:
/// `plain` uses its Display impl, `text` quotes it, `via` runs it through a converter fn,
/// `maybe` quotes an optional value when present, `secret` only notes that a value is present,
/// and `bytes` prints a payload's length.
macro_rules! packet_field {
    (plain $f:expr, $name:literal, $value:expr) => {
        write!($f, " {}:{}", $name, $value)?
    };
    (text $f:expr, $name:literal, $value:expr) => {
        write!($f, " {}:\"{}\"", $name, $value)?
    };
    (via $converter:path; $f:expr, $name:literal, $value:expr) => {
        write!($f, " {}:{}", $name, $converter($value))?
    };
    (maybe $f:expr, $name:literal, $value:expr) => {
        if let Some(present) = $value.as_ref() {
            write!($f, " {}:\"{}\"", $name, present)?
        }
    };
    (secret $f:expr, $name:literal, $value:expr) => {
        if $value.is_some() {
            write!($f, " {}:<redacted>", $name)?
        }
    };
    (bytes $f:expr, $name:literal, $value:expr) => {
        write!($f, " {}:<{} bytes>", $name, $value.len())?
    };
}

pub(crate) use packet_field;

/// Display for the packets whose only content is a packet id
macro_rules! impl_id_only_display {
    ($($packet:ident),+ $(,)?) => {
        $(
            impl std::fmt::Display for $packet {
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    f.write_str(stringify!($packet))?;
                    f.write_str(" {")?;
                    crate::logging::packet_field!(plain f, "packet_id", self.packet_id);
                    f.write_str(" }")
                }
            }
        )+
    };
}

pub(crate) use impl_id_only_display;

impl fmt::Display for MqttPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner: &dyn fmt::Display = match self {
            MqttPacket::Connect(packet) => packet,
            MqttPacket::Connack(packet) => packet,
            MqttPacket::Publish(packet) => packet,
            MqttPacket::Puback(packet) => packet,
            MqttPacket::Pubrec(packet) => packet,
            MqttPacket::Pubrel(packet) => packet,
            MqttPacket::Pubcomp(packet) => packet,
            MqttPacket::Subscribe(packet) => packet,
            MqttPacket::Suback(packet) => packet,
            MqttPacket::Unsubscribe(packet) => packet,
            MqttPacket::Unsuback(packet) => packet,
            MqttPacket::Disconnect(_) => return f.write_str("DisconnectPacket { }"),
        };

        inner.fmt(f)
    }
}

/// Logs a packet crossing the transport.
///
/// With debug logging enabled the whole packet is written out; otherwise only its type is
/// logged at info.
pub(crate) fn log_packet(prefix: &str, packet: &MqttPacket) {
    if log_enabled!(Level::Debug) {
        debug!("{}{}", prefix, packet);
    } else {
        info!("{}{} {{ .. }}", prefix, mqtt_packet_to_packet_type(packet));
    }
}
