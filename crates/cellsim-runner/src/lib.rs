//! # cellsim-runner library
//!
//! Library interface for the cellsim simulation runner.
//!
//! This module re-exports the key types and functions needed for running
//! scenarios programmatically and for integration testing. The event loop
//! pops events in `(time, id)` order, dispatches them to their target
//! entities and collects statistics and an optional JSON trace.

pub mod metrics_export;

use cellsim_common::{
    CellModule, Event, EventId, EventPayload, Interaction, SimContext, SimError,
};
pub use cellsim_common::SimTime;
use cellsim_model::BuiltSimulation;
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap};
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Seed used when neither the CLI nor the scenario names one.
pub const DEFAULT_SEED: u64 = 0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] cellsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Messages handed to the cell chain.
    pub messages_sent: u64,
    /// Hand-offs between chain modules.
    pub module_handoffs: u64,
    /// Bandwidth release records processed.
    pub releases: u64,
    /// Messages delivered to receivers.
    pub receptions: u64,
    /// Negative acknowledgements sent to senders.
    pub negative_acks: u64,
    /// Negative acknowledgement reasons, counted per reason.
    pub nack_reasons: BTreeMap<String, u64>,
    /// Node movements applied.
    pub position_updates: u64,
    /// Cell module reconfigurations applied.
    pub configuration_updates: u64,
    /// Final simulation time.
    pub simulation_time_ms: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// A message entering the cell chain.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSendPayload {
    pub message_id: u32,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub payload_bytes: u64,
    pub stream: bool,
}

/// A hand-off or release record between chain modules.
#[derive(Debug, Clone, Serialize)]
pub struct ModulePayload {
    pub from: String,
    pub to: String,
    pub release: bool,
    pub start_time_s: f64,
    pub end_time_s: f64,
}

/// Payload types for different trace events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    #[serde(rename = "MESSAGE")]
    MessageSend(MessageSendPayload),
    #[serde(rename = "MODULE")]
    Module(ModulePayload),
    #[serde(rename = "INTERACTION")]
    Interaction { interaction: Interaction },
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Event id.
    pub event_id: u64,
    /// Simulation time in seconds.
    pub time_s: f64,
    /// Timestamp (ISO 8601).
    pub timestamp: String,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Trace recorder for outputting simulation events.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an event.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Flush all entries to output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    trace_enabled: bool,
    stats: SimulationStats,
}

impl EventLoop {
    /// Create a new event loop.
    pub fn new(simulation: BuiltSimulation, seed: u64, trace_output: Option<Box<dyn Write>>) -> Self {
        let mut event_queue = BinaryHeap::new();
        let mut next_id = 0;
        for event in simulation.initial_events.iter().cloned() {
            next_id = next_id.max(event.id.0 + 1);
            event_queue.push(event);
        }

        let mut context = SimContext::new(seed);
        context.reserve_event_ids(next_id);

        let trace = TraceRecorder::new(trace_output);
        EventLoop {
            event_queue,
            simulation,
            context,
            trace_enabled: trace.is_enabled(),
            trace,
            stats: SimulationStats::default(),
        }
    }

    /// Keep trace entries in memory even without a trace output.
    pub fn set_record_trace(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    /// Run the simulation until `duration` or until no events remain.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let start_time = Instant::now();

        // Add end-of-simulation event
        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: duration,
            source: self.simulation.chain_id,
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            // Stop at simulation end
            if matches!(event.payload, EventPayload::SimulationEnd) {
                break;
            }

            self.context.set_time(event.time);
            self.simulation.entities.dispatch_event(&event, &mut self.context)?;

            for new_event in self.context.take_pending_events() {
                self.event_queue.push(new_event);
            }

            self.stats.total_events += 1;
            self.update_stats(&event);
            if self.trace_enabled {
                self.record_trace(&event);
            }
        }

        if !self.event_queue.is_empty() {
            debug!("{} events left after simulation end", self.event_queue.len());
        }
        self.simulation.entities.finish_all();

        self.stats.simulation_time_ms = self.context.time().as_millis();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "simulation finished at {}: {} events, {} receptions, {} negative acks",
            self.context.time(),
            self.stats.total_events,
            self.stats.receptions,
            self.stats.negative_acks
        );

        self.trace.flush()?;
        Ok(self.stats.clone())
    }

    /// Get current statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Recorded trace entries.
    pub fn trace_entries(&self) -> &[TraceEntry] {
        self.trace.entries()
    }

    /// Get current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    fn update_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::V2xMessageSend(_) => self.stats.messages_sent += 1,
            EventPayload::CellModule(message) if message.is_release() => self.stats.releases += 1,
            EventPayload::CellModule(_) => self.stats.module_handoffs += 1,
            EventPayload::Interaction(Interaction::Reception(_)) => self.stats.receptions += 1,
            EventPayload::Interaction(Interaction::Acknowledgement(ack)) if !ack.acknowledged => {
                self.stats.negative_acks += 1;
                for reason in &ack.reasons {
                    *self
                        .stats
                        .nack_reasons
                        .entry(reason.as_label().to_string())
                        .or_insert(0) += 1;
                }
            }
            EventPayload::NodePosition(_) => self.stats.position_updates += 1,
            EventPayload::CellConfigurationUpdate(_) => self.stats.configuration_updates += 1,
            _ => {}
        }
    }

    /// Record a trace entry for an event.
    fn record_trace(&mut self, event: &Event) {
        let sim_secs = event.time.as_secs_f64();
        // simulation start maps to 2025-01-01T00:00:00Z
        let timestamp = format!(
            "2025-01-01T{:02}:{:02}:{:06.3}Z",
            (sim_secs / 3600.0) as u32 % 24,
            (sim_secs / 60.0) as u32 % 60,
            sim_secs % 60.0
        );

        let payload = match &event.payload {
            EventPayload::V2xMessageSend(msg) => TracePayload::MessageSend(MessageSendPayload {
                message_id: msg.id.0,
                source: msg.routing.source.clone(),
                destination: format!(
                    "{:?}/{:?}",
                    msg.routing.destination.kind, msg.routing.destination.address
                ),
                protocol: format!("{:?}", msg.protocol()),
                payload_bytes: msg.payload_bytes,
                stream: msg.is_stream(),
            }),
            EventPayload::CellModule(message) => TracePayload::Module(ModulePayload {
                from: module_label(message.emitting_module),
                to: module_label(message.next_module),
                release: message.is_release(),
                start_time_s: message.start_time.as_secs_f64(),
                end_time_s: message.end_time.as_secs_f64(),
            }),
            EventPayload::Interaction(interaction) => TracePayload::Interaction {
                interaction: interaction.clone(),
            },
            _ => return,
        };

        self.trace.record(TraceEntry {
            event_id: event.id.0,
            time_s: sim_secs,
            timestamp,
            payload,
        });
    }
}

fn module_label(module: CellModule) -> String {
    module.as_label().to_string()
}

/// Create a new event loop from a built simulation.
pub fn create_event_loop(simulation: BuiltSimulation, seed: u64) -> EventLoop {
    EventLoop::new(simulation, seed, None)
}

// Re-export key types for convenience
pub use cellsim_model::{build_simulation, load_model, load_model_from_str, Model};

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
simulation:
  duration_s: 30
network:
  global:
    uplink:
      delay: { type: constant, delay_ms: 50 }
      capacity: 1000000
    downlink:
      unicast: { delay: { type: constant, delay_ms: 50 } }
      multicast: { delay: { type: constant, delay_ms: 50 } }
      usable_capacity: 0.5
      capacity: 1000000
nodes:
  - name: veh_0
    position: { latitude: 52.3, longitude: 13.1 }
  - name: veh_1
    position: { latitude: 52.31, longitude: 13.1 }
messages:
  - time_s: 10
    source: veh_0
    destination: { kind: cell_topocast, receiver: veh_1 }
    protocol: udp
    payload_bytes: 10
"#;

    #[test]
    fn test_topocast_round_trip_stats() {
        let model = load_model_from_str(SCENARIO).unwrap();
        let mut event_loop = create_event_loop(build_simulation(&model).unwrap(), 1);
        event_loop.set_record_trace(true);
        let stats = event_loop.run(model.duration).unwrap();

        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.receptions, 1);
        assert_eq!(stats.negative_acks, 0);
        // upstream -> geocaster -> downstream
        assert_eq!(stats.module_handoffs, 2);
        // one release per stream module
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.simulation_time_ms, 10_100);

        let reception = event_loop
            .trace_entries()
            .iter()
            .find(|e| matches!(e.payload, TracePayload::Interaction { .. }))
            .unwrap();
        assert!((reception.time_s - 10.1).abs() < 1e-9);
    }

    #[test]
    fn test_events_after_duration_are_not_processed() {
        let model = load_model_from_str(SCENARIO).unwrap();
        let mut event_loop = create_event_loop(build_simulation(&model).unwrap(), 1);
        let stats = event_loop.run(SimTime::from_secs(5.0)).unwrap();
        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.messages_sent, 0);
    }
}
