/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use std::fmt;

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        packet_field!(plain f, "packet_id", self.packet_id);
        packet_field!(text f, "topic", self.topic);
        packet_field!(via quality_of_service_to_str; f, "qos", self.qos);
        packet_field!(plain f, "duplicate", self.duplicate);
        packet_field!(plain f, "retain", self.retain);
        packet_field!(bytes f, "payload", self.payload);
        write!(f, " }}")
    }
}
