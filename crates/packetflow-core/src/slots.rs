// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-session mutual exclusion.
//!
//! Every session write (control operations and the packet loop's
//! status-sensitive writes) happens while holding the session's slot lock.
//! The slot also tracks whether a loop task is currently running for the key
//! so start/resume never spawn a second loop. Idle slots are pruned each time
//! a loop exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::persistence::SessionKey;

/// State guarded by a session slot.
#[derive(Debug, Default)]
pub struct SlotState {
    /// A loop task owns this session and has not exited yet.
    pub loop_active: bool,
}

pub type SessionSlot = Arc<AsyncMutex<SlotState>>;

/// Registry of slots keyed by session identity.
#[derive(Debug, Default)]
pub struct SessionSlots {
    slots: Mutex<HashMap<SessionKey, SessionSlot>>,
}

impl SessionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `key`, created on first use. The same `Arc` is returned as
    /// long as anyone holds it.
    pub fn slot(&self, key: &SessionKey) -> SessionSlot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Drop slots nobody holds and no loop owns.
    ///
    /// An entry is removed only while the map lock is held and the map owns
    /// the sole reference, so no caller can be holding a copy of it. Returns
    /// the number of slots removed.
    pub fn prune(&self) -> usize {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = slots.len();
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.try_lock().map(|state| state.loop_active).unwrap_or(true)
        });
        before - slots.len()
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a loop is currently registered for `key`.
    pub async fn is_loop_active(&self, key: &SessionKey) -> bool {
        self.slot(key).lock().await.loop_active
    }
}
