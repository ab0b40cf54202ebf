//! Metric definitions for the cell chain.
//!
//! Every metric emitted through the `metrics` macros is declared here so the
//! runner can list them and exporters can attach descriptions.

use std::fmt;

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// Unit of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    None,
    Count,
    BitsPerSecond,
    Milliseconds,
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: MetricUnit,
    pub description: &'static str,
    /// Labels beyond the common `module`, `region` and `mode`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::None => "",
            MetricUnit::Count => "count",
            MetricUnit::BitsPerSecond => "bps",
            MetricUnit::Milliseconds => "ms",
        }
    }
}

pub const STREAM_ADMITTED: MetricDef = MetricDef {
    name: "cellsim.stream.admitted",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Transmissions admitted by a stream module",
    labels: &[],
};

pub const STREAM_REJECTED: MetricDef = MetricDef {
    name: "cellsim.stream.rejected",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Transmissions rejected by a stream module, one per reason",
    labels: &["reason"],
};

pub const STREAM_PACKET_LOSS: MetricDef = MetricDef {
    name: "cellsim.stream.packet_loss",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Transmissions whose every attempt was lost",
    labels: &[],
};

pub const STREAM_DURATION: MetricDef = MetricDef {
    name: "cellsim.stream.duration",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Milliseconds,
    description: "Time from start to end of an admitted transmission",
    labels: &[],
};

pub const CAPACITY_CONSUMED: MetricDef = MetricDef {
    name: "cellsim.capacity.consumed_bps",
    kind: MetricKind::Histogram,
    unit: MetricUnit::BitsPerSecond,
    description: "Bandwidth reserved per admitted transmission",
    labels: &[],
};

pub const SCOPE_AVAILABLE: MetricDef = MetricDef {
    name: "cellsim.scope.available_bps",
    kind: MetricKind::Gauge,
    unit: MetricUnit::BitsPerSecond,
    description: "Remaining capacity of a scope pool after the last change",
    labels: &["direction"],
};

pub const DELIVERY_RECEPTIONS: MetricDef = MetricDef {
    name: "cellsim.delivery.receptions",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Messages delivered to receivers",
    labels: &[],
};

pub const DELIVERY_NACKS: MetricDef = MetricDef {
    name: "cellsim.delivery.nacks",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Negative acknowledgements sent to TCP senders",
    labels: &[],
};

pub const GEOCAST_RECEIVERS: MetricDef = MetricDef {
    name: "cellsim.geocast.receivers",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Count,
    description: "Receivers resolved per routed message",
    labels: &["downstream_mode"],
};

/// All metric definitions.
pub const ALL: &[MetricDef] = &[
    STREAM_ADMITTED,
    STREAM_REJECTED,
    STREAM_PACKET_LOSS,
    STREAM_DURATION,
    CAPACITY_CONSUMED,
    SCOPE_AVAILABLE,
    DELIVERY_RECEPTIONS,
    DELIVERY_NACKS,
    GEOCAST_RECEIVERS,
];

/// Look up a definition by name.
pub fn find(name: &str) -> Option<&'static MetricDef> {
    ALL.iter().find(|m| m.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique() {
        let names: HashSet<_> = ALL.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), ALL.len());
        assert!(ALL.iter().all(|m| m.name.starts_with("cellsim.")));
    }

    #[test]
    fn test_find() {
        assert_eq!(find("cellsim.delivery.nacks").map(|m| m.kind), Some(MetricKind::Counter));
        assert!(find("cellsim.unknown").is_none());
    }
}
