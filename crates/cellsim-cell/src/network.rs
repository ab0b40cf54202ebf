//! Network scopes (global and regional) and the cascading capacity checks over them.

use crate::capacity::{CapacityError, MINIMAL_BANDWIDTH_FACTOR, UNLIMITED_BANDWIDTH};
use crate::delay::DelayModel;
use crate::CellError;
use cellsim_common::{GeoArea, RegionId, TransmissionMode, GLOBAL_NETWORK_ID};
use serde::{Deserialize, Serialize};

// ============================================================================
// Link Configuration
// ============================================================================

/// Loss and retransmission parameters of a link.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransmissionConfig {
    /// Probability that a single attempt is lost.
    #[serde(default)]
    pub loss_probability: f64,
    /// Retransmissions after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
}

/// Delay and loss behaviour of one transmission flavour.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkBehavior {
    pub delay: DelayModel,
    pub transmission: TransmissionConfig,
}

/// Uplink pool of a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkConfig {
    pub behavior: LinkBehavior,
    pub capacity: u64,
    pub max_capacity: u64,
}

/// Downlink pool of a scope, shared by unicast and multicast.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkConfig {
    pub unicast: LinkBehavior,
    pub multicast: LinkBehavior,
    /// Share of the maximum capacity multicast may use.
    pub usable_capacity: f64,
    pub capacity: u64,
    pub max_capacity: u64,
}

// ============================================================================
// Network Scope
// ============================================================================

/// A bandwidth scope: the global network or a named region.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkScope {
    pub id: RegionId,
    /// Coverage area; `None` for the global scope.
    pub area: Option<GeoArea>,
    pub uplink: UplinkConfig,
    pub downlink: DownlinkConfig,
}

impl NetworkScope {
    /// Delay and loss configuration used for `mode`.
    pub fn behavior(&self, mode: TransmissionMode) -> &LinkBehavior {
        match mode {
            TransmissionMode::UplinkUnicast => &self.uplink.behavior,
            TransmissionMode::DownlinkUnicast => &self.downlink.unicast,
            TransmissionMode::DownlinkMulticast => &self.downlink.multicast,
        }
    }

    /// Remaining capacity of the pool serving `mode`.
    pub fn capacity(&self, mode: TransmissionMode) -> u64 {
        if mode.is_uplink() {
            self.uplink.capacity
        } else {
            self.downlink.capacity
        }
    }

    fn multicast_share(&self) -> f64 {
        self.downlink.usable_capacity * self.downlink.max_capacity as f64
    }

    /// Whether the pool is above its exhaustion floor.
    pub fn is_available(&self, mode: TransmissionMode) -> bool {
        let floor = match mode {
            TransmissionMode::UplinkUnicast => self.uplink.max_capacity as f64,
            TransmissionMode::DownlinkUnicast => self.downlink.max_capacity as f64,
            TransmissionMode::DownlinkMulticast => self.multicast_share(),
        } * MINIMAL_BANDWIDTH_FACTOR;
        self.capacity(mode) as f64 >= floor
    }

    /// Whether `bandwidth_bps` fits into the pool right now.
    pub fn is_sufficient(&self, mode: TransmissionMode, bandwidth_bps: u64) -> bool {
        let fits = self.capacity(mode) >= bandwidth_bps;
        match mode {
            TransmissionMode::DownlinkMulticast => {
                fits && self.multicast_share() >= bandwidth_bps as f64
            }
            _ => fits,
        }
    }

    /// Largest bandwidth a new transmission could get from this scope.
    pub fn available_bandwidth(&self, mode: TransmissionMode) -> u64 {
        match mode {
            TransmissionMode::DownlinkMulticast => {
                (self.multicast_share() as u64).min(self.downlink.capacity)
            }
            _ => self.capacity(mode),
        }
    }

    fn pool_mut(&mut self, mode: TransmissionMode) -> (&mut u64, u64) {
        if mode.is_uplink() {
            (&mut self.uplink.capacity, self.uplink.max_capacity)
        } else {
            (&mut self.downlink.capacity, self.downlink.max_capacity)
        }
    }

    fn can_consume(&self, mode: TransmissionMode, amount: u64) -> Result<(), CapacityError> {
        let capacity = self.capacity(mode);
        if capacity == UNLIMITED_BANDWIDTH {
            return Ok(());
        }
        if amount > capacity {
            return Err(CapacityError::Insufficient {
                requested: amount,
                available: capacity,
            });
        }
        Ok(())
    }

    /// Take bandwidth from the pool. Unlimited pools are never debited.
    pub fn consume(&mut self, mode: TransmissionMode, amount: u64) -> Result<(), CapacityError> {
        if amount == 0 {
            return Err(CapacityError::ZeroAmount);
        }
        self.can_consume(mode, amount)?;
        let (capacity, _) = self.pool_mut(mode);
        if *capacity != UNLIMITED_BANDWIDTH {
            *capacity -= amount;
        }
        Ok(())
    }

    /// Give bandwidth back, saturating at the maximum.
    ///
    /// Returns true if the release had to be clamped.
    pub fn release(&mut self, mode: TransmissionMode, amount: u64) -> bool {
        let (capacity, max) = self.pool_mut(mode);
        if *capacity == UNLIMITED_BANDWIDTH {
            return false;
        }
        let restored = capacity.saturating_add(amount);
        *capacity = restored.min(max);
        restored > max
    }

    fn validate(&self) -> Result<(), CellError> {
        let invalid = |msg: String| Err(CellError::InvalidConfig(format!("{}: {}", self.id, msg)));
        if self.uplink.max_capacity == 0 || self.downlink.max_capacity == 0 {
            return invalid("max_capacity must be positive".into());
        }
        if self.uplink.capacity > self.uplink.max_capacity {
            return invalid("uplink capacity exceeds max_capacity".into());
        }
        if self.downlink.capacity > self.downlink.max_capacity {
            return invalid("downlink capacity exceeds max_capacity".into());
        }
        if !(self.downlink.usable_capacity > 0.0 && self.downlink.usable_capacity <= 1.0) {
            return invalid(format!(
                "usable_capacity must be in (0, 1], got {}",
                self.downlink.usable_capacity
            ));
        }
        if self.multicast_share() < 1.0 {
            return invalid(format!(
                "usable_capacity {} leaves multicast less than 1 bps of {} bps",
                self.downlink.usable_capacity, self.downlink.max_capacity
            ));
        }
        for behavior in [&self.uplink.behavior, &self.downlink.unicast, &self.downlink.multicast] {
            behavior
                .delay
                .validate()
                .map_err(|e| CellError::InvalidConfig(format!("{}: {}", self.id, e)))?;
            if behavior.transmission.loss_probability < 0.0 {
                return invalid("loss_probability must not be negative".into());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Network State
// ============================================================================

/// All bandwidth scopes of the cellular network.
///
/// Positions outside every named region fall back to the global scope. With
/// `stack_global_scope` set, named regions additionally draw from the global
/// pool, so an admission must fit both.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    global: NetworkScope,
    regions: Vec<NetworkScope>,
    stack_global_scope: bool,
}

impl NetworkState {
    /// Build and validate the network state.
    pub fn new(
        global: NetworkScope,
        regions: Vec<NetworkScope>,
        stack_global_scope: bool,
    ) -> Result<Self, CellError> {
        if global.id != GLOBAL_NETWORK_ID {
            return Err(CellError::InvalidConfig(format!(
                "global scope must be named {}, got {}",
                GLOBAL_NETWORK_ID, global.id
            )));
        }
        global.validate()?;
        for (i, region) in regions.iter().enumerate() {
            if region.id == GLOBAL_NETWORK_ID {
                return Err(CellError::InvalidConfig(format!(
                    "region id {} is reserved",
                    GLOBAL_NETWORK_ID
                )));
            }
            if region.area.is_none() {
                return Err(CellError::InvalidConfig(format!("region {} has no area", region.id)));
            }
            if regions[..i].iter().any(|r| r.id == region.id) {
                return Err(CellError::InvalidConfig(format!("duplicate region id {}", region.id)));
            }
            region.validate()?;
        }
        Ok(NetworkState {
            global,
            regions,
            stack_global_scope,
        })
    }

    pub fn global(&self) -> &NetworkScope {
        &self.global
    }

    /// Named regions in declaration order.
    pub fn regions(&self) -> &[NetworkScope] {
        &self.regions
    }

    pub fn stacks_global_scope(&self) -> bool {
        self.stack_global_scope
    }

    /// Look up a scope by id.
    pub fn scope(&self, id: &str) -> Result<&NetworkScope, CellError> {
        if id == GLOBAL_NETWORK_ID {
            return Ok(&self.global);
        }
        self.regions
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CellError::UnknownRegion(id.to_string()))
    }

    fn scope_index(&self, id: &str) -> Result<Option<usize>, CellError> {
        if id == GLOBAL_NETWORK_ID {
            return Ok(None);
        }
        self.regions
            .iter()
            .position(|r| r.id == id)
            .map(Some)
            .ok_or_else(|| CellError::UnknownRegion(id.to_string()))
    }

    /// Scopes whose pools an admission in `id` draws from.
    pub fn applicable_scopes(&self, id: &str) -> Result<Vec<&NetworkScope>, CellError> {
        let primary = self.scope(id)?;
        let mut scopes = vec![primary];
        if self.stack_global_scope && id != GLOBAL_NETWORK_ID {
            scopes.push(&self.global);
        }
        Ok(scopes)
    }

    fn for_each_applicable_mut<F>(&mut self, id: &str, mut f: F) -> Result<(), CellError>
    where
        F: FnMut(&mut NetworkScope),
    {
        let index = self.scope_index(id)?;
        match index {
            Some(i) => {
                f(&mut self.regions[i]);
                if self.stack_global_scope {
                    f(&mut self.global);
                }
            }
            None => f(&mut self.global),
        }
        Ok(())
    }

    /// True if every applicable scope can carry `bandwidth_bps` right now.
    pub fn is_sufficient(
        &self,
        id: &str,
        mode: TransmissionMode,
        bandwidth_bps: u64,
    ) -> Result<bool, CellError> {
        Ok(self
            .applicable_scopes(id)?
            .iter()
            .all(|s| s.is_sufficient(mode, bandwidth_bps)))
    }

    /// True if every applicable scope is above its exhaustion floor.
    pub fn is_available(&self, id: &str, mode: TransmissionMode) -> Result<bool, CellError> {
        Ok(self.applicable_scopes(id)?.iter().all(|s| s.is_available(mode)))
    }

    /// Minimum available bandwidth over the applicable scopes.
    pub fn available_bandwidth(&self, id: &str, mode: TransmissionMode) -> Result<u64, CellError> {
        Ok(self
            .applicable_scopes(id)?
            .iter()
            .map(|s| s.available_bandwidth(mode))
            .min()
            .unwrap_or(0))
    }

    /// Debit every applicable scope. Nothing is debited if any scope lacks room.
    pub fn consume(
        &mut self,
        id: &str,
        mode: TransmissionMode,
        amount: u64,
    ) -> Result<(), CellError> {
        if amount == 0 {
            return Err(CapacityError::ZeroAmount.into());
        }
        for scope in self.applicable_scopes(id)? {
            scope.can_consume(mode, amount)?;
        }
        let mut result = Ok(());
        self.for_each_applicable_mut(id, |scope| {
            if let Err(e) = scope.consume(mode, amount) {
                result = Err(e);
            }
        })?;
        result.map_err(CellError::from)
    }

    /// Credit every applicable scope. Returns the ids of scopes that saturated.
    pub fn release(
        &mut self,
        id: &str,
        mode: TransmissionMode,
        amount: u64,
    ) -> Result<Vec<RegionId>, CellError> {
        let mut saturated = Vec::new();
        self.for_each_applicable_mut(id, |scope| {
            if scope.release(mode, amount) {
                saturated.push(scope.id.clone());
            }
        })?;
        Ok(saturated)
    }
}
