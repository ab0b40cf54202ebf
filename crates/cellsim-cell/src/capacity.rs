//! Per-node bandwidth pools and the bandwidth/delay conversions used for admission.

use cellsim_common::{NodeName, NodeCellUpdate, SimTime, TransmissionMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel for a pool without an upper bound.
pub const UNLIMITED_BANDWIDTH: u64 = u64::MAX;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Share of the maximum below which a pool counts as exhausted.
pub const MINIMAL_BANDWIDTH_FACTOR: f64 = 0.1;

/// Errors raised by capacity arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// Tried to take more than the pool holds.
    #[error("cannot consume {requested} bps, only {available} bps available")]
    Insufficient {
        /// Requested amount.
        requested: u64,
        /// Amount left in the pool.
        available: u64,
    },

    /// Zero bandwidth reservations are meaningless.
    #[error("bandwidth amount must be positive")]
    ZeroAmount,

    /// Maximum so small that the exhaustion floor rounds to zero.
    #[error("maximum bitrate of {0} bps is too small")]
    MaxTooSmall(u64),

    /// Conversion input out of range.
    #[error("{0} must be positive")]
    InvalidArgument(&'static str),
}

/// Uplink or downlink side of a node or scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    Uplink,
    Downlink,
}

impl From<TransmissionMode> for LinkDirection {
    fn from(mode: TransmissionMode) -> Self {
        if mode.is_uplink() {
            LinkDirection::Uplink
        } else {
            LinkDirection::Downlink
        }
    }
}

/// One direction of a node's bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitratePool {
    max_bps: u64,
    available_bps: u64,
}

impl BitratePool {
    fn new(max_bps: u64) -> Result<Self, CapacityError> {
        if max_bps / 10 == 0 {
            return Err(CapacityError::MaxTooSmall(max_bps));
        }
        Ok(BitratePool {
            max_bps,
            available_bps: max_bps,
        })
    }

    /// Configured maximum.
    pub fn max_bps(&self) -> u64 {
        self.max_bps
    }

    /// Currently unreserved bandwidth.
    pub fn available_bps(&self) -> u64 {
        self.available_bps
    }

    /// Exhaustion floor (10 % of the maximum).
    pub fn min_bps(&self) -> u64 {
        self.max_bps / 10
    }

    /// Whether the pool is above its exhaustion floor.
    pub fn is_possible(&self) -> bool {
        self.available_bps >= self.min_bps()
    }

    fn consume(&mut self, amount: u64) -> Result<(), CapacityError> {
        if amount == 0 {
            return Err(CapacityError::ZeroAmount);
        }
        if amount > self.available_bps {
            return Err(CapacityError::Insufficient {
                requested: amount,
                available: self.available_bps,
            });
        }
        self.available_bps -= amount;
        Ok(())
    }

    /// Returns true if the release had to be clamped at the maximum.
    fn release(&mut self, amount: u64) -> bool {
        let restored = self.available_bps.saturating_add(amount);
        self.available_bps = restored.min(self.max_bps);
        restored > self.max_bps
    }
}

/// Cellular configuration of a single node.
///
/// Tracks whether the node's cell module is switched on and how much of its
/// uplink and downlink bitrate is currently reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfiguration {
    node_id: NodeName,
    enabled: bool,
    uplink: BitratePool,
    downlink: BitratePool,
}

impl CellConfiguration {
    /// Create a configuration. `None` bitrates are unlimited.
    pub fn new(
        node_id: impl Into<NodeName>,
        enabled: bool,
        max_uplink_bps: Option<u64>,
        max_downlink_bps: Option<u64>,
    ) -> Result<Self, CapacityError> {
        Ok(CellConfiguration {
            node_id: node_id.into(),
            enabled,
            uplink: BitratePool::new(max_uplink_bps.unwrap_or(UNLIMITED_BANDWIDTH))?,
            downlink: BitratePool::new(max_downlink_bps.unwrap_or(UNLIMITED_BANDWIDTH))?,
        })
    }

    /// Enabled node without bitrate limits.
    pub fn unlimited(node_id: impl Into<NodeName>) -> Self {
        let pool = BitratePool {
            max_bps: UNLIMITED_BANDWIDTH,
            available_bps: UNLIMITED_BANDWIDTH,
        };
        CellConfiguration {
            node_id: node_id.into(),
            enabled: true,
            uplink: pool,
            downlink: pool,
        }
    }

    /// Build from a configuration update event.
    pub fn from_update(update: &NodeCellUpdate) -> Result<Self, CapacityError> {
        Self::new(
            update.node.clone(),
            update.enabled,
            update.max_uplink_bps,
            update.max_downlink_bps,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn uplink(&self) -> &BitratePool {
        &self.uplink
    }

    pub fn downlink(&self) -> &BitratePool {
        &self.downlink
    }

    /// Pool for the given direction.
    pub fn pool(&self, direction: LinkDirection) -> &BitratePool {
        match direction {
            LinkDirection::Uplink => &self.uplink,
            LinkDirection::Downlink => &self.downlink,
        }
    }

    fn pool_mut(&mut self, direction: LinkDirection) -> &mut BitratePool {
        match direction {
            LinkDirection::Uplink => &mut self.uplink,
            LinkDirection::Downlink => &mut self.downlink,
        }
    }

    pub fn available_uplink_bps(&self) -> u64 {
        self.uplink.available_bps
    }

    pub fn available_downlink_bps(&self) -> u64 {
        self.downlink.available_bps
    }

    /// Whether the uplink is above its exhaustion floor.
    pub fn uplink_possible(&self) -> bool {
        self.uplink.is_possible()
    }

    /// Whether the downlink is above its exhaustion floor.
    pub fn downlink_possible(&self) -> bool {
        self.downlink.is_possible()
    }

    /// Reserve uplink bandwidth. Leaves the pool untouched on failure.
    pub fn consume_uplink(&mut self, amount: u64) -> Result<(), CapacityError> {
        self.uplink.consume(amount)
    }

    /// Reserve downlink bandwidth. Leaves the pool untouched on failure.
    pub fn consume_downlink(&mut self, amount: u64) -> Result<(), CapacityError> {
        self.downlink.consume(amount)
    }

    /// Return uplink bandwidth, saturating at the maximum.
    pub fn release_uplink(&mut self, amount: u64) -> bool {
        self.uplink.release(amount)
    }

    /// Return downlink bandwidth, saturating at the maximum.
    pub fn release_downlink(&mut self, amount: u64) -> bool {
        self.downlink.release(amount)
    }

    pub fn consume(&mut self, direction: LinkDirection, amount: u64) -> Result<(), CapacityError> {
        self.pool_mut(direction).consume(amount)
    }

    pub fn release(&mut self, direction: LinkDirection, amount: u64) -> bool {
        self.pool_mut(direction).release(amount)
    }
}

/// Bandwidth needed to move `bits` within `delay`.
pub fn calculate_needed_capacity(bits: u64, delay: SimTime) -> Result<u64, CapacityError> {
    if bits == 0 {
        return Err(CapacityError::InvalidArgument("message length"));
    }
    if delay == SimTime::ZERO {
        return Err(CapacityError::InvalidArgument("delay"));
    }
    let bps = bits as u128 * NANOS_PER_SEC / delay.as_nanos() as u128;
    Ok(u64::try_from(bps).unwrap_or(UNLIMITED_BANDWIDTH))
}

/// Time needed to move `bits` at `bandwidth_bps`.
pub fn calculate_needed_delay(bits: u64, bandwidth_bps: u64) -> Result<SimTime, CapacityError> {
    if bits == 0 {
        return Err(CapacityError::InvalidArgument("message length"));
    }
    if bandwidth_bps == 0 {
        return Err(CapacityError::InvalidArgument("bandwidth"));
    }
    let nanos = bits as u128 * NANOS_PER_SEC / bandwidth_bps as u128;
    Ok(SimTime::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
}
