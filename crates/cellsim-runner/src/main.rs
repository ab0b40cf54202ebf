//! # cellsim-runner
//!
//! CLI runner for cellsim scenarios.
//!
//! Loads a YAML scenario, replays it through the cell chain and prints the
//! collected statistics as JSON on stdout.

use cellsim_cell::metric_defs::{self, MetricKind};
use cellsim_runner::metrics_export::{self, InMemoryRecorder};
use cellsim_runner::{build_simulation, load_model, EventLoop, RunnerError, SimTime, SimulationStats, DEFAULT_SEED};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Accepts a plain number of seconds or unit suffixes `s`, `m`, `h` and `d`,
/// which may be combined (`1h30m`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 || !secs.is_finite() {
            return Err(format!("Invalid duration: '{}'", s));
        }
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        let multiplier = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use s, m, h, or d.", c, s)),
        };
        total_seconds += value * multiplier;
        current_number.clear();
    }

    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }

    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// cellsim - capacity-aware cellular relay simulator
#[derive(Parser, Debug)]
#[command(name = "cellsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scenario from a YAML file
    Run(RunArgs),
    /// List all available metrics with descriptions and labels
    Metrics,
}

/// Arguments of `cellsim run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the YAML scenario file.
    pub scenario: PathBuf,

    /// Simulation duration, overriding the scenario.
    /// Accepts plain seconds or units: 60, 60s, 10m, 2h, 1d, 1h30m
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed (default: scenario seed, then 0)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format for metrics at end of simulation.
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File path to write metrics (stdout if not specified).
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Running
// ============================================================================

fn describe_metrics() {
    for metric in metric_defs::ALL {
        match metric.kind {
            MetricKind::Counter => metrics::describe_counter!(metric.name, metric.description),
            MetricKind::Gauge => metrics::describe_gauge!(metric.name, metric.description),
            MetricKind::Histogram => metrics::describe_histogram!(metric.name, metric.description),
        }
    }
}

/// Run a scenario with the given arguments.
fn run_simulation(args: &RunArgs) -> Result<(SimulationStats, Option<Arc<InMemoryRecorder>>), RunnerError> {
    let recorder = if args.metrics_output.is_some() {
        let recorder = Arc::new(InMemoryRecorder::new());
        if let Err(e) = metrics::set_global_recorder((*recorder).clone()) {
            warn!("failed to set metrics recorder: {}", e);
            None
        } else {
            describe_metrics();
            Some(recorder)
        }
    } else {
        None
    };

    let model = load_model(&args.scenario)?;
    let seed = args.seed.or(model.seed).unwrap_or(DEFAULT_SEED);
    let duration = match args.duration {
        Some(secs) => SimTime::from_secs(secs),
        None => model.duration,
    };
    info!(
        "loaded {} with {} regions and {} messages, seed {}",
        args.scenario.display(),
        model.network.regions().len(),
        model.messages.len(),
        seed
    );

    let simulation = build_simulation(&model)?;

    let trace_output: Option<Box<dyn Write>> = match &args.output {
        Some(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
        None => None,
    };

    let mut event_loop = EventLoop::new(simulation, seed, trace_output);
    let stats = event_loop.run(duration)?;

    Ok((stats, recorder))
}

fn export_metrics(
    recorder: &InMemoryRecorder,
    format: MetricsOutputFormat,
    path: Option<&PathBuf>,
) -> Result<(), RunnerError> {
    let snapshot = recorder.snapshot();
    let mut writer: Box<dyn Write> = match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    match format {
        MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut writer)?,
        MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&snapshot, &mut writer)?,
    }
    writer.flush()?;
    Ok(())
}

fn print_metrics_info() {
    println!("cellsim Available Metrics");
    println!("=========================\n");

    println!("All metrics support the following labels:");
    println!("  - module: Chain module emitting the metric (upstream, geocaster, downstream)");
    println!("  - region: Region id, or \"global\"");
    println!("  - mode: Transmission mode (direct_unicast, direct_multicast, ...)");
    println!();

    for metric in metric_defs::ALL {
        println!("  {}", metric.name);
        println!("    Type: {}", metric.kind);
        let unit_str = metric.unit_str();
        if !unit_str.is_empty() {
            println!("    Unit: {}", unit_str);
        }
        if !metric.description.is_empty() {
            println!("    Description: {}", metric.description);
        }
        if !metric.labels.is_empty() {
            println!("    Extra labels: {}", metric.labels.join(", "));
        }
        println!();
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise warn, or debug with --verbose
    let default_level = match &cli.command {
        Commands::Run(args) if args.verbose => "debug",
        _ => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let (stats, recorder) = run_simulation(&args)?;

            // Stats go to stdout unless metrics are exported there
            let metrics_on_stdout = args.metrics_output.is_some() && args.metrics_file.is_none();
            if !metrics_on_stdout {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }

            if let (Some(recorder), Some(format)) = (recorder, args.metrics_output) {
                export_metrics(&recorder, format, args.metrics_file.as_ref())?;
            }
        }
        Commands::Metrics => {
            print_metrics_info();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_plain_seconds() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("2.5").unwrap(), 2.5);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), 30.0);
        assert_eq!(parse_duration("10m").unwrap(), 600.0);
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
        assert_eq!(parse_duration("1m30").unwrap(), 90.0);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-5").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "cellsim", "run", "scenario.yaml", "--seed", "7", "--duration", "2m", "--metrics-output", "prometheus",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.seed, Some(7));
                assert_eq!(args.duration, Some(120.0));
                assert!(matches!(args.metrics_output, Some(MetricsOutputFormat::Prometheus)));
            }
            Commands::Metrics => panic!("expected run"),
        }
    }
}
