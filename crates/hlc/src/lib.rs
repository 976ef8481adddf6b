//! Hybrid logical clock timestamps for prepare and commit ordering.
//!
//! Participants stamp their prepare votes with an HLC timestamp; the coordinator
//! derives the commit timestamp from the largest prepare timestamp plus one
//! logical tick, so that a commit is causally after every prepare it depends on.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier for HLC timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Derive a node ID from a textual name (participant or coordinator ID)
    pub fn from_name(name: &str) -> Self {
        // FNV-1a keeps the mapping stable across processes
        let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
        NodeId(hash)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable HLC timestamp with total ordering.
///
/// The total ordering is: physical time, then logical counter, then node ID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HlcTimestamp {
    /// Physical time component (microseconds since Unix epoch)
    pub physical: u64,
    /// Logical counter for ordering within the same physical time
    pub logical: u32,
    /// Node that generated this timestamp
    pub node_id: NodeId,
}

impl HlcTimestamp {
    /// Create a new HLC timestamp.
    pub const fn new(physical: u64, logical: u32, node_id: NodeId) -> Self {
        Self {
            physical,
            logical,
            node_id,
        }
    }

    /// The timestamp one logical tick after this one.
    ///
    /// Carries into the physical component if the logical counter is exhausted.
    pub fn tick(&self) -> Self {
        match self.logical.checked_add(1) {
            Some(logical) => Self::new(self.physical, logical, self.node_id),
            None => Self::new(self.physical + 1, 0, self.node_id),
        }
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.physical
            .cmp(&other.physical)
            .then(self.logical.cmp(&other.logical))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.physical, self.logical, self.node_id)
    }
}

/// Where the clock reads physical time from
enum PhysicalSource {
    System,
    /// Physical time frozen at a value that only moves when set explicitly
    Manual(u64),
}

struct ClockState {
    source: PhysicalSource,
    last_physical: u64,
    last_logical: u32,
}

impl ClockState {
    fn physical_now(&self) -> u64 {
        match self.source {
            PhysicalSource::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
            PhysicalSource::Manual(physical) => physical,
        }
    }
}

/// HLC clock for generating timestamps.
pub struct HlcClock {
    node_id: NodeId,
    state: Mutex<ClockState>,
}

impl HlcClock {
    /// Create a new HLC clock for a node reading the system clock.
    pub fn new(node_id: NodeId) -> Self {
        Self::with_source(node_id, PhysicalSource::System)
    }

    /// Create a clock whose physical component stays at zero until set.
    ///
    /// Every timestamp it issues differs only in the logical counter, which
    /// makes prepare and commit timestamps predictable in tests and demos.
    pub fn manual(node_id: NodeId) -> Self {
        Self::with_source(node_id, PhysicalSource::Manual(0))
    }

    fn with_source(node_id: NodeId, source: PhysicalSource) -> Self {
        Self {
            node_id,
            state: Mutex::new(ClockState {
                source,
                last_physical: 0,
                last_logical: 0,
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Generate a new HLC timestamp.
    pub fn now(&self) -> HlcTimestamp {
        let mut state = self.state.lock();
        let physical = state.physical_now();

        if physical > state.last_physical {
            state.last_physical = physical;
            state.last_logical = 0;
        } else {
            state.last_logical += 1;
        }
        HlcTimestamp::new(state.last_physical, state.last_logical, self.node_id)
    }

    /// Update the clock based on a received timestamp.
    ///
    /// The returned timestamp is greater than both the received one and every
    /// timestamp previously issued by this clock.
    pub fn update(&self, received: &HlcTimestamp) -> HlcTimestamp {
        let mut state = self.state.lock();
        let physical = state.physical_now();
        let max_physical = physical.max(received.physical).max(state.last_physical);

        let logical = if max_physical == state.last_physical && max_physical == received.physical
        {
            state.last_logical.max(received.logical) + 1
        } else if max_physical == state.last_physical {
            state.last_logical + 1
        } else if max_physical == received.physical {
            received.logical + 1
        } else {
            0
        };

        state.last_physical = max_physical;
        state.last_logical = logical;
        HlcTimestamp::new(max_physical, logical, self.node_id)
    }

    /// Reset the clock as if `last` were the most recent timestamp it issued.
    ///
    /// Only meaningful for manual clocks; the next call to [`HlcClock::now`]
    /// returns `last` plus one logical tick while physical time stays put.
    pub fn reset_to(&self, last: HlcTimestamp) {
        let mut state = self.state.lock();
        if let PhysicalSource::Manual(_) = state.source {
            state.source = PhysicalSource::Manual(last.physical);
        }
        state.last_physical = last.physical;
        state.last_logical = last.logical;
    }

    /// Move a manual clock's physical time forward.
    pub fn set_physical(&self, physical: u64) {
        let mut state = self.state.lock();
        if let PhysicalSource::Manual(current) = state.source {
            state.source = PhysicalSource::Manual(current.max(physical));
        }
    }
}

/// Thread-safe HLC clock that can be shared across threads.
pub type SharedHlcClock = Arc<HlcClock>;
