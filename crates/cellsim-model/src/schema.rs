//! YAML schema of a scenario file.
//!
//! ## Example YAML
//!
//! ```yaml
//! simulation:
//!   duration_s: 60
//!   seed: 42
//! network:
//!   global:
//!     uplink:
//!       delay: { type: constant, delay_ms: 50 }
//!       capacity: 28000000
//!     downlink:
//!       unicast: { delay: { type: constant, delay_ms: 50 } }
//!       multicast: { delay: { type: constant, delay_ms: 50 } }
//!       usable_capacity: 0.6
//!       capacity: 42200000
//! regions:
//!   - id: kreuzberg
//!     area:
//!       type: rectangle
//!       north_west: { latitude: 52.5, longitude: 13.4 }
//!       south_east: { latitude: 52.49, longitude: 13.42 }
//!     uplink: ...
//!     downlink: ...
//! nodes:
//!   - name: veh_0
//!     position: { latitude: 52.495, longitude: 13.41 }
//!     max_uplink_bps: unlimited
//! messages:
//!   - time_s: 10
//!     source: veh_0
//!     destination: { kind: cell_topocast, receiver: veh_1 }
//!     protocol: udp
//!     payload_bytes: 200
//! ```

use cellsim_cell::{DelayModel, HeaderLengths, LossModelKind, NodeKind, TransmissionConfig, UNLIMITED_BANDWIDTH};
use cellsim_common::{DestinationKind, GeoArea, GeoCoord, Protocol};
use serde::{Deserialize, Serialize};

// ============================================================================
// Bandwidth
// ============================================================================

/// The `unlimited` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthKeyword {
    Unlimited,
}

/// A bitrate in bits per second, or `unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bandwidth {
    Bps(u64),
    Keyword(BandwidthKeyword),
}

impl Bandwidth {
    pub const UNLIMITED: Bandwidth = Bandwidth::Keyword(BandwidthKeyword::Unlimited);

    /// Bits per second, with `u64::MAX` standing for unlimited.
    pub fn as_bps(self) -> u64 {
        match self {
            Bandwidth::Bps(bps) => bps,
            Bandwidth::Keyword(BandwidthKeyword::Unlimited) => UNLIMITED_BANDWIDTH,
        }
    }

    /// `None` for unlimited.
    pub fn limit(self) -> Option<u64> {
        match self {
            Bandwidth::Bps(bps) => Some(bps),
            Bandwidth::Keyword(_) => None,
        }
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Bandwidth::UNLIMITED
    }
}

fn default_true() -> bool {
    true
}

fn default_duration_s() -> f64 {
    60.0
}

fn default_usable_capacity() -> f64 {
    1.0
}

// ============================================================================
// Network
// ============================================================================

/// Delay and loss of one transmission flavour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LinkBehaviorYaml {
    pub delay: DelayModel,
    #[serde(default)]
    pub transmission: TransmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UplinkYaml {
    pub delay: DelayModel,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    pub capacity: Bandwidth,
    /// Defaults to `capacity`.
    #[serde(default)]
    pub max_capacity: Option<Bandwidth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DownlinkYaml {
    pub unicast: LinkBehaviorYaml,
    pub multicast: LinkBehaviorYaml,
    /// Share of the maximum capacity multicast may use.
    #[serde(default = "default_usable_capacity")]
    pub usable_capacity: f64,
    pub capacity: Bandwidth,
    #[serde(default)]
    pub max_capacity: Option<Bandwidth>,
}

/// Pools of the global network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ScopeYaml {
    pub uplink: UplinkYaml,
    pub downlink: DownlinkYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NetworkYaml {
    pub global: ScopeYaml,
    /// Debit the global pool in addition to the region pool.
    #[serde(default)]
    pub stack_global_scope: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegionYaml {
    pub id: String,
    pub area: GeoArea,
    pub uplink: UplinkYaml,
    pub downlink: DownlinkYaml,
}

// ============================================================================
// Nodes and Traffic
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NodeYaml {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Option<GeoCoord>,
    /// Whether the node has a cell module at all.
    #[serde(default = "default_true")]
    pub cell: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_uplink_bps: Bandwidth,
    #[serde(default)]
    pub max_downlink_bps: Bandwidth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DestinationYaml {
    pub kind: DestinationKind,
    /// Unicast receiver; absent for broadcasts.
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub area: Option<GeoArea>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StreamYaml {
    pub duration_s: f64,
    pub bandwidth_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MessageYaml {
    pub time_s: f64,
    pub source: String,
    pub destination: DestinationYaml,
    #[serde(default)]
    pub protocol: Protocol,
    pub payload_bytes: u64,
    #[serde(default)]
    pub stream: Option<StreamYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MovementYaml {
    pub time_s: f64,
    pub node: String,
    pub position: GeoCoord,
}

/// Scheduled change of a node's cell module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CellUpdateYaml {
    pub time_s: f64,
    pub node: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_uplink_bps: Bandwidth,
    #[serde(default)]
    pub max_downlink_bps: Bandwidth,
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SimulationYaml {
    #[serde(default = "default_duration_s")]
    pub duration_s: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub loss_model: LossModelKind,
}

impl Default for SimulationYaml {
    fn default() -> Self {
        SimulationYaml {
            duration_s: default_duration_s(),
            seed: None,
            loss_model: LossModelKind::default(),
        }
    }
}

/// Root scenario structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ScenarioYaml {
    #[serde(default)]
    pub simulation: SimulationYaml,
    #[serde(default)]
    pub headers: HeaderLengths,
    pub network: NetworkYaml,
    #[serde(default)]
    pub regions: Vec<RegionYaml>,
    #[serde(default)]
    pub nodes: Vec<NodeYaml>,
    #[serde(default)]
    pub messages: Vec<MessageYaml>,
    #[serde(default)]
    pub movements: Vec<MovementYaml>,
    #[serde(default)]
    pub cell_updates: Vec<CellUpdateYaml>,
}
