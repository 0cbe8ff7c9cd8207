//! Short-lived key/value entries: SMS codes and presence markers.
//!
//! Keys follow the layout `auth:code:{phone}`, `auth:signup:{phone}` and `user:online:{id}`.
//! Expired entries are invisible to readers and reclaimed by [`EphemeralStore::purge_expired`].

use dashmap::DashMap;
use std::time::{Duration, Instant};

pub fn code_key(phone: &str) -> String {
    format!("auth:code:{}", phone)
}

/// Set when a sign-in asks for registration; holds the client's `phone_code_hash`.
pub fn signup_key(phone: &str) -> String {
    format!("auth:signup:{}", phone)
}

pub fn online_key(user_id: i64) -> String {
    format!("user:online:{}", user_id)
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct EphemeralStore {
    entries: DashMap<String, Entry>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Remove `key` only if it still holds `expected`. Returns whether it did.
    pub fn take_if_eq(&self, key: &str, expected: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove_if(key, |_, entry| {
                entry.expires_at > now && crate::crypto::constant_time_eq(&entry.value, expected)
            })
            .is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}
