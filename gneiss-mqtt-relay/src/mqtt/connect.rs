/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use std::fmt;

impl fmt::Display for WillMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        packet_field!(text f, "topic", self.topic);
        packet_field!(via quality_of_service_to_str; f, "qos", self.qos);
        packet_field!(plain f, "retain", self.retain);
        packet_field!(bytes f, "payload", self.payload);
        write!(f, " }}")
    }
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        packet_field!(maybe f, "client_id", self.client_id);
        packet_field!(plain f, "clean_session", self.clean_session);
        packet_field!(maybe f, "username", self.username);
        packet_field!(secret f, "password", self.password);
        if let Some(will) = &self.will {
            write!(f, " will:{}", will)?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        packet_field!(plain f, "session_present", self.session_present);
        packet_field!(via connect_return_code_to_str; f, "return_code", self.return_code);
        write!(f, " }}")
    }
}
