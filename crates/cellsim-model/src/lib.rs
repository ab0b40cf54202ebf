//! # cellsim-model
//!
//! YAML scenario loading and simulation building for cellsim.
//!
//! This crate provides:
//! - The YAML schema of a scenario (network scopes, regions, nodes, traffic)
//! - Loading and validation into a [`Model`]
//! - Building the chain and RTI entities plus the scheduled input events

mod schema;

pub use schema::{Bandwidth, BandwidthKeyword};

use cellsim_cell::{
    CapacityError, CellConfiguration, CellError, CellState, ChainManager, DownlinkConfig,
    HeaderLengths, LinkBehavior, LossModelKind, NetworkScope, NetworkState, NodeEntry,
    NodeRegistry, RtiEndpoint, UplinkConfig,
};
use cellsim_common::{
    Destination, DestinationKind, EntityId, EntityRegistry, Event, EventId, EventPayload, GeoArea,
    MessageId, MessageRouting, NetworkAddress, NodeCellUpdate, NodePositionUpdate, SimTime,
    StreamParams, V2xMessage, GLOBAL_NETWORK_ID,
};
use schema::{
    CellUpdateYaml, DownlinkYaml, MessageYaml, MovementYaml, NodeYaml, ScenarioYaml, UplinkYaml,
};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A message or update references an unknown node.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Duplicate node name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network scopes failed validation.
    #[error("Network error: {0}")]
    Network(#[from] CellError),

    /// A node bitrate cannot be represented.
    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Public Model API
// ============================================================================

/// A message handed to the stack at `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub time: SimTime,
    pub message: V2xMessage,
}

/// A node moving at `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMovement {
    pub time: SimTime,
    pub update: NodePositionUpdate,
}

/// A cell module reconfiguration at `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCellUpdate {
    pub time: SimTime,
    pub update: NodeCellUpdate,
}

/// A loaded and validated scenario.
#[derive(Debug, Clone)]
pub struct Model {
    /// Simulated time span.
    pub duration: SimTime,
    /// Seed from the scenario, if any.
    pub seed: Option<u64>,
    pub loss_model: LossModelKind,
    pub headers: HeaderLengths,
    /// Initial network state with full pools.
    pub network: NetworkState,
    /// Initial nodes with their positions and cell modules.
    pub nodes: NodeRegistry,
    pub messages: Vec<ScheduledMessage>,
    pub movements: Vec<ScheduledMovement>,
    pub cell_updates: Vec<ScheduledCellUpdate>,
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_model_from_str(&yaml)
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    let yaml: ScenarioYaml = serde_yaml::from_str(yaml_str)?;
    Model::from_yaml(yaml)
}

impl Model {
    fn from_yaml(yaml: ScenarioYaml) -> Result<Model, ModelError> {
        let duration = seconds("simulation.duration_s", yaml.simulation.duration_s)?;

        let global = build_scope(GLOBAL_NETWORK_ID, None, yaml.network.global.uplink, yaml.network.global.downlink);
        let regions = yaml
            .regions
            .into_iter()
            .map(|r| build_scope(&r.id, Some(r.area), r.uplink, r.downlink))
            .collect();
        let network = NetworkState::new(global, regions, yaml.network.stack_global_scope)?;

        let nodes = build_nodes(yaml.nodes)?;
        let messages = yaml
            .messages
            .into_iter()
            .enumerate()
            .map(|(index, m)| build_message(index, m, &nodes))
            .collect::<Result<Vec<_>, _>>()?;
        let movements = yaml
            .movements
            .into_iter()
            .map(|m| build_movement(m, &nodes))
            .collect::<Result<Vec<_>, _>>()?;
        let cell_updates = yaml
            .cell_updates
            .into_iter()
            .map(|u| build_cell_update(u, &nodes))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "model: {} regions, {} nodes, {} messages, {} movements",
            network.regions().len(),
            nodes.len(),
            messages.len(),
            movements.len()
        );

        Ok(Model {
            duration,
            seed: yaml.simulation.seed,
            loss_model: yaml.simulation.loss_model,
            headers: yaml.headers,
            network,
            nodes,
            messages,
            movements,
            cell_updates,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<SimTime, ModelError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ModelError::InvalidConfig(format!(
            "{} must be a non-negative number of seconds, got {}",
            field, value
        )));
    }
    Ok(SimTime::from_secs(value))
}

fn build_scope(id: &str, area: Option<GeoArea>, uplink: UplinkYaml, downlink: DownlinkYaml) -> NetworkScope {
    let up = uplink.capacity.as_bps();
    let down = downlink.capacity.as_bps();
    NetworkScope {
        id: id.to_string(),
        area,
        uplink: UplinkConfig {
            behavior: LinkBehavior {
                delay: uplink.delay,
                transmission: uplink.transmission,
            },
            capacity: up,
            max_capacity: uplink.max_capacity.map_or(up, Bandwidth::as_bps),
        },
        downlink: DownlinkConfig {
            unicast: LinkBehavior {
                delay: downlink.unicast.delay,
                transmission: downlink.unicast.transmission,
            },
            multicast: LinkBehavior {
                delay: downlink.multicast.delay,
                transmission: downlink.multicast.transmission,
            },
            usable_capacity: downlink.usable_capacity,
            capacity: down,
            max_capacity: downlink.max_capacity.map_or(down, Bandwidth::as_bps),
        },
    }
}

fn build_nodes(nodes: Vec<NodeYaml>) -> Result<NodeRegistry, ModelError> {
    let mut registry = NodeRegistry::new();
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.name.clone()) {
            return Err(ModelError::DuplicateNode(node.name));
        }
        let cell = if node.cell {
            Some(CellConfiguration::new(
                node.name.clone(),
                node.enabled,
                node.max_uplink_bps.limit(),
                node.max_downlink_bps.limit(),
            )?)
        } else {
            None
        };
        registry.insert(
            node.name,
            NodeEntry {
                kind: node.kind,
                position: node.position,
                cell,
            },
        );
    }
    Ok(registry)
}

fn require_node(nodes: &NodeRegistry, name: &str) -> Result<(), ModelError> {
    match nodes.get(name) {
        Some(_) => Ok(()),
        None => Err(ModelError::NodeNotFound(name.to_string())),
    }
}

fn build_message(index: usize, m: MessageYaml, nodes: &NodeRegistry) -> Result<ScheduledMessage, ModelError> {
    let id = u32::try_from(index + 1)
        .map(MessageId)
        .map_err(|_| ModelError::InvalidConfig("too many messages".to_string()))?;
    let time = seconds(&format!("messages[{}].time_s", index), m.time_s)?;
    require_node(nodes, &m.source)?;

    let destination = m.destination;
    let address = match (destination.kind, destination.receiver) {
        (DestinationKind::CellTopocast | DestinationKind::AdHoc, Some(receiver)) => {
            require_node(nodes, &receiver)?;
            NetworkAddress::Unicast(receiver)
        }
        (DestinationKind::CellTopocast, None) => {
            return Err(ModelError::InvalidConfig(format!(
                "message {} is a topocast without a receiver",
                id
            )));
        }
        (DestinationKind::CellGeocast | DestinationKind::CellGeocastMbs, Some(_)) => {
            return Err(ModelError::InvalidConfig(format!(
                "message {} is a geocast and cannot name a receiver",
                id
            )));
        }
        (_, None) => NetworkAddress::Broadcast,
    };
    let geocast = matches!(
        destination.kind,
        DestinationKind::CellGeocast | DestinationKind::CellGeocastMbs
    );
    if geocast && destination.area.is_none() {
        return Err(ModelError::InvalidConfig(format!("geocast message {} has no area", id)));
    }

    let stream = match m.stream {
        Some(stream) => {
            if stream.bandwidth_bps == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "stream message {} needs a positive bandwidth",
                    id
                )));
            }
            Some(StreamParams {
                duration: seconds(&format!("messages[{}].stream.duration_s", index), stream.duration_s)?,
                bandwidth_bps: stream.bandwidth_bps,
            })
        }
        None => None,
    };

    Ok(ScheduledMessage {
        time,
        message: V2xMessage {
            id,
            routing: MessageRouting {
                source: m.source,
                destination: Destination {
                    kind: destination.kind,
                    address,
                    protocol: m.protocol,
                    area: destination.area,
                },
                stream,
            },
            payload_bytes: m.payload_bytes,
        },
    })
}

fn build_movement(m: MovementYaml, nodes: &NodeRegistry) -> Result<ScheduledMovement, ModelError> {
    require_node(nodes, &m.node)?;
    Ok(ScheduledMovement {
        time: seconds("movements.time_s", m.time_s)?,
        update: NodePositionUpdate {
            node: m.node,
            position: m.position,
        },
    })
}

fn build_cell_update(u: CellUpdateYaml, nodes: &NodeRegistry) -> Result<ScheduledCellUpdate, ModelError> {
    require_node(nodes, &u.node)?;
    let update = NodeCellUpdate {
        node: u.node,
        enabled: u.enabled,
        max_uplink_bps: u.max_uplink_bps.limit(),
        max_downlink_bps: u.max_downlink_bps.limit(),
    };
    // rejects bitrates whose exhaustion floor would be zero
    CellConfiguration::from_update(&update)?;
    Ok(ScheduledCellUpdate {
        time: seconds("cell_updates.time_s", u.time_s)?,
        update,
    })
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Entity id of the chain manager.
pub const CHAIN_ENTITY_ID: EntityId = EntityId(0);
/// Entity id of the RTI endpoint.
pub const RTI_ENTITY_ID: EntityId = EntityId(1);

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with the chain manager and the RTI endpoint.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation, in scenario order.
    pub initial_events: Vec<Event>,
    pub chain_id: EntityId,
    pub rti_id: EntityId,
}

/// Build a simulation from a model.
///
/// Every build starts from the model's initial network and node state, so a
/// model can be run repeatedly.
pub fn build_simulation(model: &Model) -> Result<BuiltSimulation, ModelError> {
    let state = CellState::new(model.network.clone(), model.nodes.clone(), model.headers);
    let chain = ChainManager::new(CHAIN_ENTITY_ID, RTI_ENTITY_ID, state, model.loss_model.build());
    let rti = RtiEndpoint::new(RTI_ENTITY_ID);

    let mut entities = EntityRegistry::new();
    entities.register(Box::new(chain));
    entities.register(Box::new(rti));

    let mut initial_events = Vec::new();
    let mut event_id_counter: u64 = 0;
    let mut push = |time: SimTime, payload: EventPayload| {
        initial_events.push(Event {
            id: EventId(event_id_counter),
            time,
            source: CHAIN_ENTITY_ID,
            targets: vec![CHAIN_ENTITY_ID],
            payload,
        });
        event_id_counter += 1;
    };

    // configuration and movements first so that a send at the same instant
    // already sees them
    for update in &model.cell_updates {
        push(update.time, EventPayload::CellConfigurationUpdate(update.update.clone()));
    }
    for movement in &model.movements {
        push(movement.time, EventPayload::NodePosition(movement.update.clone()));
    }
    for scheduled in &model.messages {
        push(scheduled.time, EventPayload::V2xMessageSend(scheduled.message.clone()));
    }

    Ok(BuiltSimulation {
        entities,
        initial_events,
        chain_id: CHAIN_ENTITY_ID,
        rti_id: RTI_ENTITY_ID,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellsim_cell::{DelayModel, NodeKind, UNLIMITED_BANDWIDTH};
    use cellsim_common::Protocol;

    const NETWORK: &str = r#"
network:
  global:
    uplink:
      delay: { type: constant, delay_ms: 50 }
      capacity: 28000000
    downlink:
      unicast: { delay: { type: constant, delay_ms: 50 } }
      multicast:
        delay: { type: gamma_random, min_delay_ms: 20, exp_delay_ms: 40 }
        transmission: { loss_probability: 0.1, max_retries: 2 }
      usable_capacity: 0.6
      capacity: unlimited
regions:
  - id: kreuzberg
    area:
      type: rectangle
      north_west: { latitude: 52.5, longitude: 13.4 }
      south_east: { latitude: 52.49, longitude: 13.42 }
    uplink:
      delay: { type: constant, delay_ms: 40 }
      capacity: 1000000
      max_capacity: 2000000
    downlink:
      unicast: { delay: { type: constant, delay_ms: 40 } }
      multicast: { delay: { type: constant, delay_ms: 40 } }
      capacity: 2000000
"#;

    fn scenario(rest: &str) -> String {
        format!("{}\n{}", NETWORK, rest)
    }

    const NODES: &str = r#"
nodes:
  - name: veh_0
    position: { latitude: 52.495, longitude: 13.41 }
    max_uplink_bps: 100000
  - name: veh_1
    position: { latitude: 52.3, longitude: 13.1 }
  - name: server
    kind: server
    enabled: false
"#;

    #[test]
    fn test_load_network_and_nodes() {
        let model = load_model_from_str(&scenario(NODES)).unwrap();

        assert_eq!(model.duration, SimTime::from_secs(60.0));
        assert_eq!(model.seed, None);
        assert_eq!(model.headers, HeaderLengths::default());

        let global = model.network.global();
        assert_eq!(global.uplink.capacity, 28_000_000);
        assert_eq!(global.uplink.max_capacity, 28_000_000);
        assert_eq!(global.downlink.capacity, UNLIMITED_BANDWIDTH);
        assert!(matches!(global.downlink.multicast.delay, DelayModel::GammaRandom { .. }));
        assert_eq!(global.downlink.multicast.transmission.max_retries, 2);

        let kreuzberg = model.network.scope("kreuzberg").unwrap();
        assert_eq!(kreuzberg.uplink.capacity, 1_000_000);
        assert_eq!(kreuzberg.uplink.max_capacity, 2_000_000);
        assert_eq!(kreuzberg.downlink.usable_capacity, 1.0);
        assert!(!model.network.stacks_global_scope());

        let veh_0 = model.nodes.cell_configuration("veh_0").unwrap();
        assert_eq!(veh_0.uplink().max_bps(), 100_000);
        assert_eq!(veh_0.downlink().max_bps(), UNLIMITED_BANDWIDTH);
        assert_eq!(model.nodes.kind("server"), NodeKind::Server);
        assert!(!model.nodes.is_cell_enabled("server"));
    }

    #[test]
    fn test_messages_are_numbered_in_order() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 10
    source: veh_0
    destination: { kind: cell_topocast, receiver: veh_1 }
    protocol: udp
    payload_bytes: 200
  - time_s: 12.5
    source: veh_1
    destination:
      kind: cell_geocast_mbs
      area:
        type: circle
        center: { latitude: 52.495, longitude: 13.41 }
        radius_m: 500
    protocol: udp
    payload_bytes: 100
    stream: { duration_s: 2, bandwidth_bps: 10000 }
"#
        ));
        let model = load_model_from_str(&yaml).unwrap();
        assert_eq!(model.messages.len(), 2);

        let first = &model.messages[0];
        assert_eq!(first.time, SimTime::from_secs(10.0));
        assert_eq!(first.message.id, MessageId(1));
        assert_eq!(
            first.message.routing.destination.address,
            NetworkAddress::Unicast("veh_1".into())
        );
        assert_eq!(first.message.protocol(), Protocol::Udp);

        let second = &model.messages[1];
        assert_eq!(second.message.id, MessageId(2));
        assert_eq!(second.message.routing.destination.address, NetworkAddress::Broadcast);
        let stream = second.message.routing.stream.unwrap();
        assert_eq!(stream.duration, SimTime::from_secs(2.0));
        assert_eq!(stream.bandwidth_bps, 10_000);
    }

    #[test]
    fn test_protocol_defaults_to_tcp() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 1
    source: veh_0
    destination: { kind: cell_topocast, receiver: veh_1 }
    payload_bytes: 10
"#
        ));
        let model = load_model_from_str(&yaml).unwrap();
        assert_eq!(model.messages[0].message.protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 1
    source: ghost
    destination: { kind: cell_topocast, receiver: veh_1 }
    payload_bytes: 10
"#
        ));
        let err = load_model_from_str(&yaml).unwrap_err();
        assert!(matches!(err, ModelError::NodeNotFound(name) if name == "ghost"));
    }

    #[test]
    fn test_geocast_without_area_is_rejected() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 1
    source: veh_0
    destination: { kind: cell_geocast }
    protocol: udp
    payload_bytes: 10
"#
        ));
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_zero_stream_bandwidth_is_rejected() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 1
    source: veh_0
    destination: { kind: cell_topocast, receiver: veh_1 }
    payload_bytes: 10
    stream: { duration_s: 1, bandwidth_bps: 0 }
"#
        ));
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_duplicate_node_is_rejected() {
        let yaml = scenario("nodes:\n  - name: a\n  - name: a\n");
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::DuplicateNode(name) if name == "a"
        ));
    }

    #[test]
    fn test_tiny_node_bitrate_is_rejected() {
        let yaml = scenario("nodes:\n  - name: a\n    max_uplink_bps: 5\n");
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::Capacity(CapacityError::MaxTooSmall(5))
        ));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = scenario("nodes:\n  - name: a\n    colour: red\n");
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::YamlError(_)
        ));
    }

    #[test]
    fn test_reserved_region_id_is_rejected() {
        let yaml = NETWORK.replace("id: kreuzberg", "id: globalNetwork");
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::Network(CellError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_negative_time_is_rejected() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            "movements:\n  - time_s: -1\n    node: veh_0\n    position: { latitude: 52.3, longitude: 13.1 }\n"
        ));
        assert!(matches!(
            load_model_from_str(&yaml).unwrap_err(),
            ModelError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_build_orders_updates_before_sends() {
        let yaml = scenario(&format!(
            "{}{}",
            NODES,
            r#"
messages:
  - time_s: 5
    source: veh_0
    destination: { kind: cell_topocast, receiver: veh_1 }
    payload_bytes: 10
movements:
  - time_s: 5
    node: veh_1
    position: { latitude: 52.495, longitude: 13.41 }
cell_updates:
  - time_s: 5
    node: veh_0
    enabled: false
"#
        ));
        let model = load_model_from_str(&yaml).unwrap();
        let built = build_simulation(&model).unwrap();

        assert_eq!(built.entities.len(), 2);
        assert_eq!(built.initial_events.len(), 3);
        let ids: Vec<u64> = built.initial_events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(matches!(
            built.initial_events[0].payload,
            EventPayload::CellConfigurationUpdate(_)
        ));
        assert!(matches!(built.initial_events[1].payload, EventPayload::NodePosition(_)));
        assert!(matches!(built.initial_events[2].payload, EventPayload::V2xMessageSend(_)));
        assert!(built
            .initial_events
            .iter()
            .all(|e| e.targets == vec![built.chain_id]));
    }
}
