/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Durable per-client log of in-flight QoS 1 and QoS 2 publishes.

Only dedicated clients with persistent sessions use a store.  Every entry is keyed by
`(client id, broker alias, direction, packet id)` and carries a sequence number so a session
restore can replay entries in their original order.
 */

mod memory;

pub use memory::MemoryStorageBackend;

use crate::error::{MqttError, MqttResult};
use crate::mqtt::PublishPacket;

use log::*;
use serde::{Deserialize, Serialize};

use std::rc::Rc;

const SELF_TEST_KEY: &str = "gneiss-mqtt-relay/self-test";
const SELF_TEST_VALUE: &str = "self-test-value";

/// A string key/value storage backend, typically wrapping some environment-specific persistence
/// API.  Methods take `&self`; backends use interior mutability.
pub trait StorageBackend {

    /// Reads the value stored under a key
    fn get(&self, key: &str) -> MqttResult<Option<String>>;

    /// Stores a value under a key, replacing any previous value
    fn set(&self, key: &str, value: &str) -> MqttResult<()>;

    /// Deletes a key; deleting a missing key is not an error
    fn remove(&self, key: &str) -> MqttResult<()>;

    /// Lists every stored key
    fn keys(&self) -> MqttResult<Vec<String>>;
}

/// Writes, reads back and deletes a test entry.  Returns false if the backend cannot be trusted.
pub fn self_test(backend: &dyn StorageBackend) -> bool {
    let round_trip = || -> MqttResult<bool> {
        backend.set(SELF_TEST_KEY, SELF_TEST_VALUE)?;
        let read_back = backend.get(SELF_TEST_KEY)?;
        backend.remove(SELF_TEST_KEY)?;
        let after_remove = backend.get(SELF_TEST_KEY)?;

        Ok(read_back.as_deref() == Some(SELF_TEST_VALUE) && after_remove.is_none())
    };

    match round_trip() {
        Ok(true) => { true }
        Ok(false) => {
            error!("storage self-test - test entry did not round trip");
            false
        }
        Err(error) => {
            error!("storage self-test - backend failed: {}", error);
            false
        }
    }
}

/// Whether a stored publish was sent by or received by the client
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StoreItemState {
    Sent,
    Received,
}

#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
struct StoreKey(String, String, StoreItemState, u16);

/// One persisted in-flight publish
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreItem {
    pub sequence: u64,
    pub state: StoreItemState,
    pub pubrec_received: bool,
    pub body: PublishPacket,
}

/// A client's view of the storage backend
pub(crate) struct SessionStore {
    backend: Rc<dyn StorageBackend>,
    client_id: String,
    broker_alias: String,
    next_sequence: u64,
}

impl SessionStore {

    pub(crate) fn open(backend: Rc<dyn StorageBackend>, client_id: &str, broker_alias: &str) -> MqttResult<SessionStore> {
        let mut store = SessionStore {
            backend,
            client_id: client_id.to_string(),
            broker_alias: broker_alias.to_string(),
            next_sequence: 1,
        };

        let highest_sequence = store.items()?.iter().map(|item| item.sequence).max().unwrap_or(0);
        store.next_sequence = highest_sequence + 1;

        debug!("session store for client \"{}\" on broker \"{}\" opened; next sequence {}", store.client_id, store.broker_alias, store.next_sequence);

        Ok(store)
    }

    fn key_for(&self, state: StoreItemState, packet_id: u16) -> MqttResult<String> {
        let key = StoreKey(self.client_id.clone(), self.broker_alias.clone(), state, packet_id);
        Ok(serde_json::to_string(&key)?)
    }

    fn parse_own_key(&self, key: &str) -> Option<(StoreItemState, u16)> {
        match serde_json::from_str::<StoreKey>(key) {
            Ok(StoreKey(client_id, broker_alias, state, packet_id)) => {
                if client_id == self.client_id && broker_alias == self.broker_alias {
                    Some((state, packet_id))
                } else {
                    None
                }
            }
            Err(_) => { None }
        }
    }

    fn write_item(&self, item: &StoreItem) -> MqttResult<()> {
        let key = self.key_for(item.state, item.body.packet_id)?;
        let value = serde_json::to_string(item)?;
        self.backend.set(&key, &value)
    }

    fn read_item(&self, state: StoreItemState, packet_id: u16) -> MqttResult<Option<StoreItem>> {
        let key = self.key_for(state, packet_id)?;
        match self.backend.get(&key)? {
            Some(value) => { Ok(Some(serde_json::from_str(&value)?)) }
            None => { Ok(None) }
        }
    }

    fn append(&mut self, state: StoreItemState, publish: &PublishPacket) -> MqttResult<()> {
        let item = StoreItem {
            sequence: self.next_sequence,
            state,
            pubrec_received: false,
            body: publish.clone(),
        };

        self.write_item(&item)?;
        self.next_sequence += 1;
        Ok(())
    }

    /// Records an outbound QoS 1 or QoS 2 publish
    pub(crate) fn store_sent(&mut self, publish: &PublishPacket) -> MqttResult<()> {
        self.append(StoreItemState::Sent, publish)
    }

    /// Records an inbound QoS 2 publish awaiting its PUBREL
    pub(crate) fn store_received(&mut self, publish: &PublishPacket) -> MqttResult<()> {
        self.append(StoreItemState::Received, publish)
    }

    /// Flags an outbound QoS 2 publish as acknowledged by PUBREC, keeping its sequence
    pub(crate) fn mark_pubrec_received(&mut self, packet_id: u16) -> MqttResult<()> {
        match self.read_item(StoreItemState::Sent, packet_id)? {
            Some(mut item) => {
                item.pubrec_received = true;
                self.write_item(&item)
            }
            None => {
                Err(MqttError::new_storage_failure(format!("no stored publish with packet id {} to mark as pubrec received", packet_id)))
            }
        }
    }

    pub(crate) fn remove_sent(&mut self, packet_id: u16) -> MqttResult<()> {
        let key = self.key_for(StoreItemState::Sent, packet_id)?;
        self.backend.remove(&key)
    }

    pub(crate) fn remove_received(&mut self, packet_id: u16) -> MqttResult<()> {
        let key = self.key_for(StoreItemState::Received, packet_id)?;
        self.backend.remove(&key)
    }

    /// Deletes every received entry, keeping sent ones
    pub(crate) fn clear_received(&mut self) -> MqttResult<()> {
        for item in self.items()? {
            if item.state == StoreItemState::Received {
                self.remove_received(item.body.packet_id)?;
            }
        }

        Ok(())
    }

    /// Deletes every entry of this client
    pub(crate) fn clear(&mut self) -> MqttResult<()> {
        for key in self.backend.keys()? {
            if self.parse_own_key(&key).is_some() {
                self.backend.remove(&key)?;
            }
        }

        self.next_sequence = 1;
        Ok(())
    }

    /// Every entry of this client, in ascending sequence order
    pub(crate) fn items(&self) -> MqttResult<Vec<StoreItem>> {
        let mut items = Vec::new();
        for key in self.backend.keys()? {
            if let Some((state, packet_id)) = self.parse_own_key(&key) {
                if let Some(item) = self.read_item(state, packet_id)? {
                    items.push(item);
                }
            }
        }

        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }
}
