/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use std::fmt;

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        packet_field!(text f, "topic_filter", self.topic_filter);
        packet_field!(via quality_of_service_to_str; f, "qos", self.qos);
        write!(f, " }}")
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        packet_field!(plain f, "packet_id", self.packet_id);
        write!(f, " subscriptions: [")?;
        for subscription in &self.subscriptions {
            write!(f, " {}", subscription)?;
        }
        write!(f, " ] }}")
    }
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        packet_field!(plain f, "packet_id", self.packet_id);
        write!(f, " return_codes: [")?;
        for code in &self.return_codes {
            write!(f, " {}", suback_return_code_to_str(*code))?;
        }
        write!(f, " ] }}")
    }
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        packet_field!(plain f, "packet_id", self.packet_id);
        write!(f, " topic_filters: [")?;
        for filter in &self.topic_filters {
            write!(f, " \"{}\"", filter)?;
        }
        write!(f, " ] }}")
    }
}
