/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::MqttResult;
use crate::store::StorageBackend;

use std::cell::RefCell;
use std::collections::BTreeMap;

/// Process-local storage backend.  Survives client resets and reconnections but not the process.
#[derive(Debug, Default)]
pub struct MemoryStorageBackend {
    entries: RefCell<BTreeMap<String, String>>,
}

impl MemoryStorageBackend {

    /// Creates an empty backend
    pub fn new() -> Self {
        MemoryStorageBackend {
            ..Default::default()
        }
    }

    /// Number of stored entries, across all clients
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl StorageBackend for MemoryStorageBackend {
    fn get(&self, key: &str) -> MqttResult<Option<String>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> MqttResult<()> {
        self.entries.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> MqttResult<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> MqttResult<Vec<String>> {
        Ok(self.entries.borrow().keys().cloned().collect())
    }
}
