//! End-to-end tests for the `cellsim` binary and the library event loop.
//!
//! Scenarios are written to a temporary directory, run through the binary
//! and checked via the JSON statistics on stdout and the trace file.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

use cellsim_runner::{build_simulation, create_event_loop, load_model_from_str};
use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Stats {
    total_events: u64,
    messages_sent: u64,
    receptions: u64,
    negative_acks: u64,
    #[serde(default)]
    nack_reasons: std::collections::BTreeMap<String, u64>,
    position_updates: u64,
    configuration_updates: u64,
}

/// A trace entry; fields depend on the entry type.
#[derive(Debug, Deserialize)]
struct TraceEntry {
    time_s: f64,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    interaction: Option<serde_json::Value>,
}

// ============================================================================
// Scenarios
// ============================================================================

const TOPOCAST: &str = r#"
simulation:
  duration_s: 30
  seed: 42
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

/// A region with plenty of room inside a small global network; a 2 Mbit/s
/// stream fits the region but not the global uplink.
fn stacked_scenario(stack_global_scope: bool) -> String {
    format!(
        r#"
simulation:
  duration_s: 30
network:
  stack_global_scope: {stack_global_scope}
  global:
    uplink:
      delay: {{ type: constant, delay_ms: 50 }}
      capacity: 1000000
    downlink:
      unicast: {{ delay: {{ type: constant, delay_ms: 50 }} }}
      multicast: {{ delay: {{ type: constant, delay_ms: 50 }} }}
      capacity: 1000000
regions:
  - id: center
    area:
      type: rectangle
      north_west: {{ latitude: 52.6, longitude: 13.2 }}
      south_east: {{ latitude: 52.4, longitude: 13.6 }}
    uplink:
      delay: {{ type: constant, delay_ms: 20 }}
      capacity: 10000000
    downlink:
      unicast: {{ delay: {{ type: constant, delay_ms: 20 }} }}
      multicast: {{ delay: {{ type: constant, delay_ms: 20 }} }}
      capacity: 10000000
nodes:
  - name: veh_0
    position: {{ latitude: 52.5, longitude: 13.4 }}
  - name: veh_1
    position: {{ latitude: 52.45, longitude: 13.5 }}
messages:
  - time_s: 5
    source: veh_0
    destination: {{ kind: cell_topocast, receiver: veh_1 }}
    protocol: tcp
    payload_bytes: 100
    stream: {{ duration_s: 1, bandwidth_bps: 2000000 }}
"#
    )
}

// ============================================================================
// Test Helper Functions
// ============================================================================

fn write_scenario(dir: &Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("scenario.yaml");
    fs::write(&path, yaml).expect("Failed to write scenario");
    path
}

/// Run the binary with extra arguments and return its stdout.
fn run_cellsim(scenario: &Path, extra_args: &[&str]) -> String {
    let binary = env!("CARGO_BIN_EXE_cellsim");
    let output = Command::new(binary)
        .arg("run")
        .arg(scenario)
        .args(extra_args)
        .output()
        .expect("Failed to execute cellsim");

    if !output.status.success() {
        panic!(
            "Simulation failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn run_stats(yaml: &str) -> Stats {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = write_scenario(temp_dir.path(), yaml);
    let stdout = run_cellsim(&scenario, &[]);
    serde_json::from_str(&stdout).expect("Failed to parse stats JSON")
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_topocast_is_delivered_and_traced() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = write_scenario(temp_dir.path(), TOPOCAST);
    let trace_path = temp_dir.path().join("trace.json");

    let stdout = run_cellsim(&scenario, &["--output", trace_path.to_str().unwrap()]);
    let stats: Stats = serde_json::from_str(&stdout).expect("Failed to parse stats JSON");
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.receptions, 1);
    assert_eq!(stats.negative_acks, 0);

    let trace: Vec<TraceEntry> =
        serde_json::from_str(&fs::read_to_string(&trace_path).expect("Failed to read trace"))
            .expect("Failed to parse trace JSON");
    assert_eq!(trace.iter().filter(|e| e.entry_type == "MESSAGE").count(), 1);

    let reception = trace
        .iter()
        .find(|e| e.entry_type == "INTERACTION")
        .expect("Expected a reception in the trace");
    let interaction = reception.interaction.as_ref().unwrap();
    assert_eq!(interaction["type"], "reception");
    assert_eq!(interaction["receiver"], "veh_1");
    // 50 ms uplink plus 50 ms downlink
    assert!((reception.time_s - 10.1).abs() < 1e-9);

    // time never runs backwards in the trace
    assert!(trace.windows(2).all(|w| w[0].time_s <= w[1].time_s));
}

#[test]
fn test_disabled_sender_is_nacked() {
    let yaml = TOPOCAST.replace("protocol: udp", "protocol: tcp")
        + r#"
cell_updates:
  - time_s: 5
    node: veh_0
    enabled: false
"#;
    let stats = run_stats(&yaml);
    assert_eq!(stats.configuration_updates, 1);
    assert_eq!(stats.receptions, 0);
    assert_eq!(stats.negative_acks, 1);
    assert_eq!(stats.nack_reasons.get("node_deactivated"), Some(&1));
}

#[test]
fn test_udp_failure_is_silent() {
    let yaml = TOPOCAST.to_string()
        + r#"
cell_updates:
  - time_s: 5
    node: veh_0
    enabled: false
"#;
    let stats = run_stats(&yaml);
    assert_eq!(stats.receptions, 0);
    assert_eq!(stats.negative_acks, 0);
}

#[test]
fn test_movement_is_applied_before_message() {
    let yaml = TOPOCAST.to_string()
        + r#"
movements:
  - time_s: 10
    node: veh_1
    position: { latitude: 52.32, longitude: 13.1 }
"#;
    let stats = run_stats(&yaml);
    assert_eq!(stats.position_updates, 1);
    assert_eq!(stats.receptions, 1);
}

#[test]
fn test_stream_fits_region_without_global_stacking() {
    let stats = run_stats(&stacked_scenario(false));
    assert_eq!(stats.receptions, 1);
    assert_eq!(stats.negative_acks, 0);
}

#[test]
fn test_stream_is_rejected_by_stacked_global_scope() {
    let stats = run_stats(&stacked_scenario(true));
    assert_eq!(stats.receptions, 0);
    assert_eq!(stats.negative_acks, 1);
    assert_eq!(stats.nack_reasons.get("channel_capacity_exceeded"), Some(&1));
}

#[test]
fn test_duration_override_stops_early() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = write_scenario(temp_dir.path(), TOPOCAST);
    let stdout = run_cellsim(&scenario, &["--duration", "5s"]);
    let stats: Stats = serde_json::from_str(&stdout).expect("Failed to parse stats JSON");
    assert_eq!(stats.total_events, 0);
    assert_eq!(stats.messages_sent, 0);
}

#[test]
fn test_prometheus_metrics_are_written() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = write_scenario(temp_dir.path(), TOPOCAST);
    let metrics_path = temp_dir.path().join("metrics.prom");

    run_cellsim(
        &scenario,
        &["--metrics-output", "prometheus", "--metrics-file", metrics_path.to_str().unwrap()],
    );

    let text = fs::read_to_string(&metrics_path).expect("Failed to read metrics");
    assert!(text.contains("cellsim_delivery_receptions 1"), "metrics were:\n{}", text);
    assert!(text.contains("cellsim_stream_admitted"));
}

#[test]
fn test_invalid_scenario_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = write_scenario(temp_dir.path(), "network: {}\n");
    let output = Command::new(env!("CARGO_BIN_EXE_cellsim"))
        .arg("run")
        .arg(&scenario)
        .output()
        .expect("Failed to execute cellsim");
    assert!(!output.status.success());
}

#[test]
fn test_same_seed_gives_identical_trace() {
    let yaml = TOPOCAST.replace(
        "uplink:\n      delay: { type: constant, delay_ms: 50 }",
        "uplink:\n      delay: { type: gamma_random, min_delay_ms: 20, exp_delay_ms: 60 }",
    );
    assert_ne!(yaml, TOPOCAST);

    let run = |seed: u64| {
        let model = load_model_from_str(&yaml).unwrap();
        let mut event_loop = create_event_loop(build_simulation(&model).unwrap(), seed);
        event_loop.set_record_trace(true);
        event_loop.run(model.duration).unwrap();
        event_loop
            .trace_entries()
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect::<Vec<_>>()
    };

    let first = run(7);
    assert!(!first.is_empty());
    assert_eq!(first, run(7));
}

#[test]
fn test_example_scenario_runs() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../scenarios/berlin.yaml");
    let model = cellsim_runner::load_model(Path::new(path)).expect("Failed to load example scenario");
    let mut event_loop = create_event_loop(build_simulation(&model).unwrap(), 42);
    let stats = event_loop.run(model.duration).unwrap();

    assert_eq!(stats.messages_sent, 4);
    assert_eq!(stats.position_updates, 1);
    assert_eq!(stats.configuration_updates, 2);
    assert!(stats.receptions >= 1);
}
