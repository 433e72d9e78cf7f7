//! Process-wide record of which artifacts have a resolution in flight.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct Registry {
    inflight: Arc<DashMap<String, Instant>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name` unless it is already claimed. The claim is released when the returned
    /// guard drops, including during unwinding.
    pub fn try_claim(&self, name: &str) -> Option<Claim> {
        match self.inflight.entry(name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(Claim {
                    inflight: Arc::clone(&self.inflight),
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.inflight.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[derive(Debug)]
pub struct Claim {
    inflight: Arc<DashMap<String, Instant>>,
    name: String,
}

impl Claim {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some((_, since)) = self.inflight.remove(&self.name) {
            let held: Duration = since.elapsed();
            debug!(name = %self.name, ?held, "released claim");
        }
    }
}
