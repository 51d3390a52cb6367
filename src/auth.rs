//! Credential storage with bounded concurrent access.
//!
//! The protocol step consults one injected `CredentialStore` during request
//! handling; tests inject fakes. The production implementation is an
//! in-memory user directory behind a counting gate sized at startup, giving
//! it the shape of a fixed handle pool to an external store: at most
//! `capacity` lookups run at once and later callers wait for a slot.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{debug, info, warn};

/// Which credential operation a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAttempt {
    Login,
    Register,
}

/// Credential check contract consulted by the protocol step.
pub trait CredentialStore: Send + Sync {
    /// Returns whether the attempt succeeds. Login compares the stored
    /// password; register inserts a new user and fails on duplicates.
    /// Empty names or passwords always fail.
    fn verify(&self, user: &str, password: &str, attempt: AuthAttempt) -> bool;
}

/// Counting gate: acquire a slot, do the lookup, give the slot back.
struct Gate {
    slots: Mutex<usize>,
    available: Condvar,
}

struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Gate {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(capacity),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> GateGuard<'_> {
        if let Ok(mut slots) = self.slots.lock() {
            loop {
                if *slots > 0 {
                    *slots -= 1;
                    break;
                }
                match self.available.wait(slots) {
                    Ok(guard) => slots = guard,
                    Err(_) => break,
                }
            }
        }
        GateGuard { gate: self }
    }

    fn release(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            *slots += 1;
            drop(slots);
            self.available.notify_one();
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// In-memory user directory, optionally seeded from configuration.
pub struct UserDirectory {
    users: RwLock<HashMap<String, String>>,
    gate: Gate,
}

impl UserDirectory {
    /// Create a directory with `capacity` concurrent lookup slots. Seeds
    /// are `user:password` entries; malformed ones are skipped.
    pub fn new(capacity: usize, seeds: &[String]) -> Arc<Self> {
        let mut users = HashMap::new();
        for seed in seeds {
            match seed.split_once(':') {
                Some((user, password)) if !user.is_empty() => {
                    users.insert(user.to_string(), password.to_string());
                }
                _ => warn!(%seed, "Ignoring malformed credential seed"),
            }
        }
        info!(
            capacity,
            seeded = users.len(),
            "Initializing credential directory"
        );
        Arc::new(Self {
            users: RwLock::new(users),
            gate: Gate::new(capacity),
        })
    }
}

impl CredentialStore for UserDirectory {
    fn verify(&self, user: &str, password: &str, attempt: AuthAttempt) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }
        let _slot = self.gate.acquire();
        match attempt {
            AuthAttempt::Login => self
                .users
                .read()
                .ok()
                .map(|users| users.get(user).map(|stored| stored == password).unwrap_or(false))
                .unwrap_or(false),
            AuthAttempt::Register => match self.users.write() {
                Ok(mut users) => {
                    if users.contains_key(user) {
                        debug!(user, "Register rejected, name taken");
                        false
                    } else {
                        users.insert(user.to_string(), password.to_string());
                        info!(user, "Registered new user");
                        true
                    }
                }
                Err(_) => false,
            },
        }
    }
}
