//! Destination denylist.

use std::collections::HashSet;

use alloy_primitives::Address;

/// Blocked-destination lookup. Synchronous and side-effect free.
pub trait Denylist: Send + Sync {
    fn is_blocked(&self, destination: &Address) -> bool;
}

/// Fixed set of blocked addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticDenylist {
    blocked: HashSet<Address>,
}

impl StaticDenylist {
    pub fn new(blocked: impl IntoIterator<Item = Address>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

impl Denylist for StaticDenylist {
    fn is_blocked(&self, destination: &Address) -> bool {
        self.blocked.contains(destination)
    }
}
