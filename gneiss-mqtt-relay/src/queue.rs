/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Ordered queue of outbound packets that the transport has not fully processed yet, plus the
per-packet delivery bookkeeping the engine needs to redeliver and acknowledge them.
 */

use crate::client::{SubscribeResult, UnsubscribeResult};
use crate::message::Message;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use futures::channel::oneshot;

use std::collections::VecDeque;
use std::fmt;

/// Completion channel of a user-submitted subscribe or unsubscribe
pub(crate) enum OperationResponse {
    Subscribe(oneshot::Sender<SubscribeResult>),
    Unsubscribe(oneshot::Sender<UnsubscribeResult>),
}

/// An outbound packet and its delivery bookkeeping
pub(crate) struct PacketEnvelope {
    pub id: u64,
    pub packet: MqttPacket,

    /// message to report on delivery; carried over from a PUBLISH to its PUBREL
    pub message: Option<Message>,

    pub processed_count: u32,
    pub aborted_count: u32,

    /// true if an MQTT-level acknowledgement must arrive before the packet is done
    pub ack_required: bool,

    /// true once the application was told about the delivery outcome
    pub notified: bool,

    /// true while a transport send for this packet has no outcome yet
    pub in_flight: bool,

    pub response: Option<OperationResponse>,
}

impl PacketEnvelope {

    pub(crate) fn new(packet: MqttPacket, ack_required: bool) -> Self {
        let message = match &packet {
            MqttPacket::Publish(publish) => { Some(Message::from(publish)) }
            _ => { None }
        };

        PacketEnvelope {
            id: 0,
            packet,
            message,
            processed_count: 0,
            aborted_count: 0,
            ack_required,
            notified: false,
            in_flight: false,
            response: None,
        }
    }

    pub(crate) fn with_response(mut self, response: OperationResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub(crate) fn packet_type(&self) -> PacketType {
        mqtt_packet_to_packet_type(&self.packet)
    }

    pub(crate) fn packet_id(&self) -> Option<u16> {
        mqtt_packet_to_packet_id(&self.packet)
    }

    /// Whether the transport has seen this packet at least once
    pub(crate) fn was_handed_off(&self) -> bool {
        self.in_flight || self.processed_count > 0 || self.aborted_count > 0
    }
}

impl fmt::Display for PacketEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} {} (processed:{} aborted:{} ack_required:{} in_flight:{})",
            self.id, self.packet_type(), self.processed_count, self.aborted_count, self.ack_required, self.in_flight)
    }
}

/// Packets in submission order
#[derive(Default)]
pub(crate) struct OutboundQueue {
    entries: VecDeque<PacketEnvelope>,
    next_id: u64,
}

impl OutboundQueue {

    pub(crate) fn new() -> Self {
        OutboundQueue {
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Appends a packet to the tail and returns its queue id
    pub(crate) fn push(&mut self, mut envelope: PacketEnvelope) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        envelope.id = id;
        self.entries.push_back(envelope);
        id
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut PacketEnvelope> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<PacketEnvelope> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(index)
    }

    /// Finds a packet of one of the given types with the given packet id that the transport has
    /// already seen.  Such a packet may be acknowledged by the broker before the transport
    /// reports its own outcome.
    pub(crate) fn find_handed_off(&self, packet_id: u16, packet_types: &[PacketType]) -> Option<u64> {
        self.entries.iter()
            .find(|entry| entry.was_handed_off() && entry.packet_id() == Some(packet_id) && packet_types.contains(&entry.packet_type()))
            .map(|entry| entry.id)
    }

    /// Ids of every packet not currently waiting on a transport outcome, in queue order
    pub(crate) fn pending_delivery(&self) -> Vec<u64> {
        self.entries.iter().filter(|entry| !entry.in_flight).map(|entry| entry.id).collect()
    }

    /// Forgets about every outstanding transport send.  Used when a new broker connection
    /// replaces the one the sends were made on.
    pub(crate) fn reset_in_flight(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.in_flight = false;
        }
    }

    /// Removes and returns (in queue order) every entry matching the predicate
    pub(crate) fn drain_where<F>(&mut self, predicate: F) -> Vec<PacketEnvelope> where F : Fn(&PacketEnvelope) -> bool {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry) {
                drained.push(entry);
            } else {
                kept.push_back(entry);
            }
        }

        self.entries = kept;
        drained
    }

    pub(crate) fn drain_all(&mut self) -> Vec<PacketEnvelope> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PacketEnvelope> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
