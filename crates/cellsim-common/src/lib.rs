//! # cellsim-common
//!
//! Common types and traits for the cellsim cellular relay simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`], nanosecond resolution)
//! - Geographic coordinates and areas ([`GeoCoord`], [`GeoArea`])
//! - Entity and event identification ([`EntityId`], [`EventId`])
//! - V2X messages and their addressing ([`V2xMessage`], [`Destination`])
//! - Cell pipeline envelopes ([`CellModuleMessage`], [`StreamResult`], [`GeocasterResult`])
//! - Outbound interactions ([`Interaction`])
//! - Simulation context ([`SimContext`]) and entity traits ([`Entity`])

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Simulation time in nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * NANOS_PER_MILLI)
    }

    /// Create from seconds (float).
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * NANOS_PER_SEC as f64) as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    /// Add duration to time.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Multiply a duration by a whole factor, saturating on overflow.
    pub fn saturating_mul(&self, factor: u64) -> SimTime {
        SimTime(self.0.saturating_mul(factor))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Geographic Types
// ============================================================================

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoCoord {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoCoord { latitude, longitude }
    }

    /// Calculate distance to another coordinate in meters.
    /// Uses the Haversine formula.
    pub fn distance_to(&self, other: &GeoCoord) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_M * c
    }

    /// Project onto a local plane around `origin`.
    ///
    /// Returns `(east_m, north_m)`. Equirectangular, so only accurate over
    /// city-scale distances, which is all the region geometry needs.
    pub fn project_from(&self, origin: &GeoCoord) -> (f64, f64) {
        let x = (self.longitude - origin.longitude).to_radians()
            * EARTH_RADIUS_M
            * origin.latitude.to_radians().cos();
        let y = (self.latitude - origin.latitude).to_radians() * EARTH_RADIUS_M;
        (x, y)
    }
}

/// Axis-aligned rectangle given by its north-west and south-east corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRectangle {
    /// North-west corner (inclusive).
    pub north_west: GeoCoord,
    /// South-east corner (exclusive).
    pub south_east: GeoCoord,
}

impl GeoRectangle {
    /// Create a rectangle from its corners.
    pub fn new(north_west: GeoCoord, south_east: GeoCoord) -> Self {
        GeoRectangle { north_west, south_east }
    }

    /// Half-open containment: the north and west edges belong to the
    /// rectangle, the south and east edges do not.
    pub fn contains(&self, point: &GeoCoord) -> bool {
        point.latitude <= self.north_west.latitude
            && point.latitude > self.south_east.latitude
            && point.longitude >= self.north_west.longitude
            && point.longitude < self.south_east.longitude
    }

    /// Corners in clockwise order starting at the north-west.
    pub fn corners(&self) -> [GeoCoord; 4] {
        [
            self.north_west,
            GeoCoord::new(self.north_west.latitude, self.south_east.longitude),
            self.south_east,
            GeoCoord::new(self.south_east.latitude, self.north_west.longitude),
        ]
    }
}

/// Circle with a radius in meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCircle {
    /// Center of the circle.
    pub center: GeoCoord,
    /// Radius in meters.
    pub radius_m: f64,
}

impl GeoCircle {
    /// Check whether a point lies within the circle (boundary included).
    pub fn contains(&self, point: &GeoCoord) -> bool {
        self.center.distance_to(point) <= self.radius_m
    }
}

/// Simple polygon given by its vertices (implicitly closed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPolygon {
    /// Polygon vertices.
    pub vertices: Vec<GeoCoord>,
}

impl GeoPolygon {
    /// Even-odd ray casting in latitude/longitude space.
    pub fn contains(&self, point: &GeoCoord) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = &self.vertices[i];
            let b = &self.vertices[j];
            if (a.latitude > point.latitude) != (b.latitude > point.latitude) {
                let crossing = (b.longitude - a.longitude) * (point.latitude - a.latitude)
                    / (b.latitude - a.latitude)
                    + a.longitude;
                if point.longitude < crossing {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// A geographic area used for regions and geocast destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeoArea {
    /// Axis-aligned rectangle.
    Rectangle(GeoRectangle),
    /// Circle around a center point.
    Circle(GeoCircle),
    /// Arbitrary simple polygon.
    Polygon(GeoPolygon),
}

impl GeoArea {
    /// Check whether a point lies inside the area.
    pub fn contains(&self, point: &GeoCoord) -> bool {
        match self {
            GeoArea::Rectangle(r) => r.contains(point),
            GeoArea::Circle(c) => c.contains(point),
            GeoArea::Polygon(p) => p.contains(point),
        }
    }

    /// Outline vertices. Circles have none.
    pub fn vertices(&self) -> Vec<GeoCoord> {
        match self {
            GeoArea::Rectangle(r) => r.corners().to_vec(),
            GeoArea::Circle(_) => Vec::new(),
            GeoArea::Polygon(p) => p.vertices.clone(),
        }
    }

    /// Approximate surface in square meters.
    pub fn approx_area_m2(&self) -> f64 {
        match self {
            GeoArea::Circle(c) => std::f64::consts::PI * c.radius_m * c.radius_m,
            GeoArea::Rectangle(_) | GeoArea::Polygon(_) => {
                let vertices = self.vertices();
                let Some(origin) = vertices.first() else {
                    return 0.0;
                };
                let projected: Vec<(f64, f64)> =
                    vertices.iter().map(|v| v.project_from(origin)).collect();
                let mut twice_area = 0.0;
                for i in 0..projected.len() {
                    let (x1, y1) = projected[i];
                    let (x2, y2) = projected[(i + 1) % projected.len()];
                    twice_area += x1 * y2 - x2 * y1;
                }
                twice_area.abs() / 2.0
            }
        }
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

/// Name of a simulated node (vehicle, RSU, server, ...).
pub type NodeName = String;

/// Identifier of a network scope: a named region or the global network.
pub type RegionId = String;

/// Id of the global network scope.
pub const GLOBAL_NETWORK_ID: &str = "globalNetwork";

// ============================================================================
// Message Types
// ============================================================================

/// Unique identifier of a V2X message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Cellular, addressed to node(s) by address.
    CellTopocast,
    /// Cellular, addressed to all nodes in an area via unicast.
    CellGeocast,
    /// Cellular, addressed to all nodes in an area via multicast/broadcast service.
    CellGeocastMbs,
    /// Ad-hoc radio; not handled by the cell chain.
    AdHoc,
}

impl DestinationKind {
    /// Whether the cellular chain is responsible for this destination.
    pub fn is_cell(&self) -> bool {
        !matches!(self, DestinationKind::AdHoc)
    }
}

/// Destination address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAddress {
    /// A single named node.
    Unicast(NodeName),
    /// Every node in scope.
    Broadcast,
}

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Fire and forget, failures are silent.
    Udp,
    /// Connection oriented, failures produce a negative acknowledgement.
    #[default]
    Tcp,
}

/// Full destination of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Addressing scheme.
    pub kind: DestinationKind,
    /// Target address.
    pub address: NetworkAddress,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Target area for geocasts.
    pub area: Option<GeoArea>,
}

/// Parameters of a streaming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// How long the stream occupies its bandwidth.
    pub duration: SimTime,
    /// Fixed bandwidth of the stream in bits per second.
    pub bandwidth_bps: u64,
}

/// Routing information of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRouting {
    /// Sending node.
    pub source: NodeName,
    /// Where the message goes.
    pub destination: Destination,
    /// Present for streaming messages.
    pub stream: Option<StreamParams>,
}

/// A vehicular message travelling through the cell network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2xMessage {
    /// Message id.
    pub id: MessageId,
    /// Routing information.
    pub routing: MessageRouting,
    /// Payload length in bytes, without protocol headers.
    pub payload_bytes: u64,
}

impl V2xMessage {
    /// Whether this message is a stream rather than a one-shot packet.
    pub fn is_stream(&self) -> bool {
        self.routing.stream.is_some()
    }

    /// Transport protocol of the message.
    pub fn protocol(&self) -> Protocol {
        self.routing.destination.protocol
    }
}

// ============================================================================
// Cell Pipeline Types
// ============================================================================

/// Stage of the cell chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CellModule {
    /// Sender to base station.
    Upstream,
    /// Routing inside the core network.
    Geocaster,
    /// Base station to receivers.
    Downstream,
}

impl CellModule {
    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CellModule::Upstream => "upstream",
            CellModule::Geocaster => "geocaster",
            CellModule::Downstream => "downstream",
        }
    }
}

/// Direction and cast type of a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    /// Node to base station.
    UplinkUnicast,
    /// Base station to a single node.
    DownlinkUnicast,
    /// Base station to all nodes of a region at once.
    DownlinkMulticast,
}

impl TransmissionMode {
    /// Whether the transmission travels on the uplink.
    pub fn is_uplink(&self) -> bool {
        matches!(self, TransmissionMode::UplinkUnicast)
    }

    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransmissionMode::UplinkUnicast => "uplink_unicast",
            TransmissionMode::DownlinkUnicast => "downlink_unicast",
            TransmissionMode::DownlinkMulticast => "downlink_multicast",
        }
    }
}

/// Why a message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegativeAckReason {
    /// Node unknown or its cell module disabled.
    NodeDeactivated,
    /// The node's own bandwidth is exhausted.
    NodeCapacityExceeded,
    /// The region or global pool is exhausted.
    ChannelCapacityExceeded,
    /// All transmission attempts were lost.
    PacketLoss,
    /// The destination could not be routed.
    AddressRoutingError,
}

impl NegativeAckReason {
    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            NegativeAckReason::NodeDeactivated => "node_deactivated",
            NegativeAckReason::NodeCapacityExceeded => "node_capacity_exceeded",
            NegativeAckReason::ChannelCapacityExceeded => "channel_capacity_exceeded",
            NegativeAckReason::PacketLoss => "packet_loss",
            NegativeAckReason::AddressRoutingError => "address_routing_error",
        }
    }
}

/// Record of a bandwidth reservation made by a stream module.
///
/// Each admitted reservation produces exactly one of these, carried by the
/// release event that gives the bandwidth back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    /// Scope the bandwidth was taken from.
    pub region_id: RegionId,
    /// Reserved bandwidth in bits per second.
    pub consumed_bandwidth_bps: u64,
    /// Direction of the reservation.
    pub mode: TransmissionMode,
    /// Node whose pool was debited. `None` for multicast.
    pub involved_node: Option<NodeName>,
    /// The message the reservation belongs to.
    pub message: V2xMessage,
}

/// Routing decision of the geocaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocasterResult {
    /// Receivers grouped by region.
    pub receivers: BTreeMap<RegionId, Vec<NodeName>>,
    /// How the downstream module should deliver.
    pub downstream_mode: TransmissionMode,
    /// The routed message.
    pub message: V2xMessage,
    /// False when the message arrived through the upstream module.
    pub is_full_message: bool,
}

impl GeocasterResult {
    /// Total number of receivers across all regions.
    pub fn receiver_count(&self) -> usize {
        self.receivers.values().map(Vec::len).sum()
    }
}

/// Payload carried between chain modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModuleResource {
    /// Result of a stream module (forward or release record).
    Stream(StreamResult),
    /// Result of the geocaster.
    Geocaster(GeocasterResult),
}

/// Envelope handed between the modules of the cell chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellModuleMessage {
    /// Module that produced the message.
    pub emitting_module: CellModule,
    /// Module that will receive the message.
    pub next_module: CellModule,
    /// When processing of the message started.
    pub start_time: SimTime,
    /// When the receiving module should handle it.
    pub end_time: SimTime,
    /// Carried result.
    pub resource: ModuleResource,
}

impl CellModuleMessage {
    /// Whether this is a release record (a module addressing itself).
    pub fn is_release(&self) -> bool {
        self.emitting_module == self.next_module
    }
}

// ============================================================================
// Interactions
// ============================================================================

/// A message arrived at a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2xMessageReception {
    /// Delivery time.
    pub time: SimTime,
    /// Receiving node.
    pub receiver: NodeName,
    /// Delivered message id.
    pub message_id: MessageId,
    /// When the downlink transmission started.
    pub send_time: SimTime,
    /// Bandwidth used for the downlink transmission.
    pub needed_bandwidth_bps: u64,
}

/// Acknowledgement sent back to the sender of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2xMessageAcknowledgement {
    /// Time of the acknowledgement.
    pub time: SimTime,
    /// Acknowledged message id.
    pub message_id: MessageId,
    /// Original sender.
    pub sender: NodeName,
    /// False for negative acknowledgements.
    pub acknowledged: bool,
    /// Every reason the message failed, in detection order.
    pub reasons: Vec<NegativeAckReason>,
}

/// Outbound interaction towards the runtime infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    /// Delivery receipt.
    Reception(V2xMessageReception),
    /// Negative (or positive) acknowledgement.
    Acknowledgement(V2xMessageAcknowledgement),
}

impl Interaction {
    /// Timestamp of the interaction.
    pub fn time(&self) -> SimTime {
        match self {
            Interaction::Reception(r) => r.time,
            Interaction::Acknowledgement(a) => a.time,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// A node moved.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePositionUpdate {
    /// Node that moved.
    pub node: NodeName,
    /// New position.
    pub position: GeoCoord,
}

/// A node's cell module was (re)configured.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCellUpdate {
    /// Node being configured.
    pub node: NodeName,
    /// Whether the cell module is switched on.
    pub enabled: bool,
    /// Maximum uplink bitrate, `None` for unlimited.
    pub max_uplink_bps: Option<u64>,
    /// Maximum downlink bitrate, `None` for unlimited.
    pub max_downlink_bps: Option<u64>,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== External Inputs ===========
    /// A node hands a message to its communication stack.
    V2xMessageSend(V2xMessage),
    /// Node position changed.
    NodePosition(NodePositionUpdate),
    /// Node cell configuration changed.
    CellConfigurationUpdate(NodeCellUpdate),

    // =========== Cell Chain ===========
    /// Hand-off between chain modules, or a release record.
    CellModule(CellModuleMessage),

    // =========== Outbound ===========
    /// Delivery or acknowledgement towards the RTI.
    Interaction(Interaction),

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let time = self.time + delay;
        self.post_at(time, targets, payload);
    }

    /// Post an event at an absolute time. Times in the past are clamped to now.
    pub fn post_at(&mut self, time: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let event = Event {
            id: EventId(self.next_event_id),
            time: time.max(self.time),
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) {
        self.post_event(SimTime::ZERO, targets, payload);
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Ensure future event ids start at or after `next`.
    pub fn reserve_event_ids(&mut self, next: u64) {
        self.next_event_id = self.next_event_id.max(next);
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;

    /// Called once after the last event was processed.
    fn finish(&mut self) {}
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            let entity = self
                .entities
                .get_mut(target)
                .ok_or(SimError::EntityNotFound(*target))?;
            ctx.set_source(*target);
            entity.handle_event(event, ctx)?;
        }
        Ok(())
    }

    /// Notify every entity that the run is over.
    pub fn finish_all(&mut self) {
        for entity in self.entities.values_mut() {
            entity.finish();
        }
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kreuzberg() -> GeoRectangle {
        GeoRectangle::new(GeoCoord::new(52.5, 13.4), GeoCoord::new(52.49, 13.42))
    }

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_nanos(), 1_500_000_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 1e-9);
        assert_eq!(SimTime::from_millis(50).as_nanos(), 50_000_000);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t1 - t2).as_millis(), 50);
        assert_eq!(t2 - t1, SimTime::ZERO);
        assert_eq!(t2.saturating_mul(3).as_millis(), 150);
    }

    #[test]
    fn test_geo_coord_distance() {
        let sf = GeoCoord::new(37.7749, -122.4194);
        let la = GeoCoord::new(34.0522, -118.2437);
        let distance = sf.distance_to(&la);
        // SF to LA is approximately 559 km
        assert!(distance > 550_000.0 && distance < 570_000.0);
    }

    #[test]
    fn test_rectangle_is_half_open() {
        let rect = kreuzberg();
        assert!(rect.contains(&GeoCoord::new(52.5, 13.4)));
        assert!(rect.contains(&GeoCoord::new(52.495, 13.41)));
        assert!(!rect.contains(&GeoCoord::new(52.49, 13.41)));
        assert!(!rect.contains(&GeoCoord::new(52.495, 13.42)));
        assert!(!rect.contains(&GeoCoord::new(52.49, 13.42)));
    }

    #[test]
    fn test_polygon_contains() {
        let triangle = GeoPolygon {
            vertices: vec![
                GeoCoord::new(0.0, 0.0),
                GeoCoord::new(0.0, 1.0),
                GeoCoord::new(1.0, 0.0),
            ],
        };
        assert!(triangle.contains(&GeoCoord::new(0.2, 0.2)));
        assert!(!triangle.contains(&GeoCoord::new(0.8, 0.8)));
    }

    #[test]
    fn test_area_size_orders_nested_areas() {
        let outer = GeoArea::Rectangle(GeoRectangle::new(
            GeoCoord::new(52.6, 13.3),
            GeoCoord::new(52.4, 13.5),
        ));
        let inner = GeoArea::Rectangle(kreuzberg());
        assert!(inner.approx_area_m2() < outer.approx_area_m2());
        assert!(inner.approx_area_m2() > 0.0);
    }

    #[test]
    fn test_event_ordering_is_min_heap() {
        let event = |id: u64, ms: u64| Event {
            id: EventId(id),
            time: SimTime::from_millis(ms),
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        };
        let mut heap = std::collections::BinaryHeap::new();
        heap.push(event(2, 10));
        heap.push(event(1, 10));
        heap.push(event(0, 20));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(1)));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(2)));
        assert_eq!(heap.pop().map(|e| e.id), Some(EventId(0)));
    }

    #[test]
    fn test_post_at_clamps_to_now() {
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_millis(100));
        ctx.post_at(SimTime::from_millis(50), vec![EntityId(1)], EventPayload::SimulationEnd);
        let events = ctx.take_pending_events();
        assert_eq!(events[0].time, SimTime::from_millis(100));
    }
}
