//! # cellsim-cell
//!
//! Capacity-aware cellular relay chain.
//!
//! A message sent by a node passes three modules:
//! - [`UpstreamModule`]: sender to base station, consumes uplink bandwidth
//! - [`GeocasterModule`]: resolves the receivers and groups them by region
//! - [`DownstreamModule`]: base station to receivers, consumes downlink bandwidth
//!
//! The [`ChainManager`] entity owns the modules and the shared [`CellState`]
//! and schedules every hand-off. Each bandwidth reservation is paired with
//! exactly one release event that returns it at the transmission's end.

pub mod capacity;
pub mod chain;
pub mod delay;
pub mod downstream;
pub mod geocaster;
pub mod headers;
pub mod loss;
pub mod metric_defs;
pub mod network;
pub mod nodes;
pub mod region;
pub mod rti;
pub mod stream;
pub mod upstream;

pub use capacity::{CapacityError, CellConfiguration, LinkDirection, UNLIMITED_BANDWIDTH};
pub use chain::{ChainManager, ChainStatistics};
pub use delay::DelayModel;
pub use downstream::DownstreamModule;
pub use geocaster::GeocasterModule;
pub use headers::HeaderLengths;
pub use loss::{LossModel, LossModelKind, RetransmissionLossModel, TransmissionOutcome};
pub use network::{
    DownlinkConfig, LinkBehavior, NetworkScope, NetworkState, TransmissionConfig, UplinkConfig,
};
pub use nodes::{NodeEntry, NodeKind, NodeRegistry};
pub use region::RegionResolver;
pub use rti::RtiEndpoint;
pub use stream::StreamOutcome;
pub use upstream::UpstreamModule;

use cellsim_common::{
    CellModule, CellModuleMessage, GeoCoord, Interaction, NodeName, RegionId, SimError, SimTime,
    EntityId,
};
use rand::RngCore;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Fatal errors of the cell chain.
///
/// Admission rejections are not errors; they travel as negative
/// acknowledgement reasons.
#[derive(Debug, Error)]
pub enum CellError {
    /// A release or lookup referenced a region that does not exist.
    #[error("unknown region: {0}")]
    UnknownRegion(RegionId),

    /// Capacity arithmetic failed after an admission decision.
    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    /// A module received a resource it cannot handle.
    #[error("{module:?} cannot handle {resource}")]
    UnexpectedResource {
        module: CellModule,
        resource: &'static str,
    },

    /// Network configuration failed validation.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),
}

impl CellError {
    /// Convert into a simulation error attributed to `entity`.
    pub fn into_sim_error(self, entity: EntityId) -> SimError {
        SimError::HandlerError {
            entity,
            message: self.to_string(),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Mutable state shared by the chain modules.
#[derive(Debug)]
pub struct CellState {
    pub network: NetworkState,
    pub nodes: NodeRegistry,
    pub regions: RegionResolver,
    pub headers: HeaderLengths,
}

impl CellState {
    pub fn new(network: NetworkState, nodes: NodeRegistry, headers: HeaderLengths) -> Self {
        CellState {
            network,
            nodes,
            regions: RegionResolver::new(),
            headers,
        }
    }

    /// Region the node currently occupies.
    pub fn region_for(&mut self, node: &str) -> RegionId {
        self.regions.region_for(&self.network, &self.nodes, node)
    }

    /// Nodes currently resolved to `region`.
    pub fn nodes_in_region(&mut self, region: &str) -> Vec<NodeName> {
        region::nodes_in_region(&mut self.regions, &self.network, &self.nodes, region)
    }

    /// Record a node movement and drop its cached region.
    pub fn update_position(&mut self, node: &str, position: GeoCoord) {
        self.nodes.set_position(node, position);
        self.regions.invalidate(node);
    }
}

// ============================================================================
// Module Context
// ============================================================================

/// Outputs collected while a module handles one event.
#[derive(Debug, Default)]
pub struct ChainOutbox {
    messages: Vec<CellModuleMessage>,
    interactions: Vec<Interaction>,
}

impl ChainOutbox {
    /// Queue a hand-off or release record.
    pub fn finish(&mut self, message: CellModuleMessage) {
        self.messages.push(message);
    }

    /// Queue an interaction towards the RTI.
    pub fn interact(&mut self, interaction: Interaction) {
        self.interactions.push(interaction);
    }

    pub fn messages(&self) -> &[CellModuleMessage] {
        &self.messages
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Take everything queued so far.
    pub fn drain(&mut self) -> (Vec<CellModuleMessage>, Vec<Interaction>) {
        (
            std::mem::take(&mut self.messages),
            std::mem::take(&mut self.interactions),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.interactions.is_empty()
    }
}

/// Everything a module may touch while handling an event.
pub struct ModuleContext<'a> {
    /// Current simulation time.
    pub time: SimTime,
    /// The simulation's seeded random number generator.
    pub rng: &'a mut dyn RngCore,
    pub state: &'a mut CellState,
    pub loss_model: &'a dyn LossModel,
    pub outbox: &'a mut ChainOutbox,
}
