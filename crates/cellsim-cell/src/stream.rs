//! Admission logic shared by the upstream and downstream modules.
//!
//! [`process`] decides whether a transmission fits into the node and scope
//! pools, how long it takes and how much bandwidth it holds. [`emit_result`]
//! turns that decision into the release record and the negative
//! acknowledgement, and [`release`] hands the bandwidth back.

use crate::capacity::{calculate_needed_capacity, calculate_needed_delay, LinkDirection};
use crate::nodes::NodeKind;
use crate::{metric_defs, CellError, ModuleContext};
use cellsim_common::{
    CellModule, CellModuleMessage, Interaction, ModuleResource, NegativeAckReason, Protocol,
    SimTime, StreamResult, TransmissionMode, V2xMessage, V2xMessageAcknowledgement,
};
use tracing::{debug, trace, warn};

/// What to admit.
#[derive(Debug, Clone, Copy)]
pub struct StreamInput<'a> {
    pub mode: TransmissionMode,
    pub region_id: &'a str,
    /// Node whose pool is involved; `None` for multicast.
    pub node: Option<&'a str>,
    pub message: &'a V2xMessage,
    pub start: SimTime,
}

/// Admission decision for one transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// Bandwidth was reserved and a release must follow.
    pub processed: bool,
    /// The transmission reached the other end.
    pub acknowledged: bool,
    pub end_time: SimTime,
    pub bandwidth_bps: u64,
    /// Failure reasons in detection order.
    pub reasons: Vec<NegativeAckReason>,
}

impl StreamOutcome {
    fn new(start: SimTime) -> Self {
        StreamOutcome {
            processed: true,
            acknowledged: true,
            end_time: start,
            bandwidth_bps: 0,
            reasons: Vec::new(),
        }
    }

    fn disable(&mut self, reason: NegativeAckReason) {
        self.processed = false;
        self.acknowledged = false;
        self.reasons.push(reason);
    }

    fn unacknowledge(&mut self, reason: NegativeAckReason) {
        self.acknowledged = false;
        self.reasons.push(reason);
    }
}

fn node_sufficient(ctx: &ModuleContext<'_>, input: &StreamInput<'_>, bandwidth: u64) -> bool {
    if input.mode == TransmissionMode::DownlinkMulticast {
        return true;
    }
    input
        .node
        .and_then(|n| ctx.state.nodes.cell_configuration(n))
        .is_some_and(|c| c.pool(input.mode.into()).available_bps() >= bandwidth)
}

fn node_available(ctx: &ModuleContext<'_>, input: &StreamInput<'_>) -> bool {
    if input.mode == TransmissionMode::DownlinkMulticast {
        return true;
    }
    input
        .node
        .and_then(|n| ctx.state.nodes.cell_configuration(n))
        .is_some_and(|c| c.pool(input.mode.into()).is_possible())
}

fn node_available_bandwidth(ctx: &ModuleContext<'_>, input: &StreamInput<'_>) -> u64 {
    if input.mode == TransmissionMode::DownlinkMulticast {
        return u64::MAX;
    }
    input
        .node
        .and_then(|n| ctx.state.nodes.cell_configuration(n))
        .map_or(0, |c| c.pool(input.mode.into()).available_bps())
}

/// Run admission for one transmission and reserve its bandwidth.
pub fn process(
    ctx: &mut ModuleContext<'_>,
    module: CellModule,
    input: &StreamInput<'_>,
) -> Result<StreamOutcome, CellError> {
    let mut outcome = StreamOutcome::new(input.start);

    // Multicast has no sending or receiving node pool to check.
    if input.mode != TransmissionMode::DownlinkMulticast {
        let enabled = input.node.is_some_and(|n| ctx.state.nodes.is_cell_enabled(n));
        if !enabled {
            outcome.disable(NegativeAckReason::NodeDeactivated);
            record_rejection(module, input, &outcome);
            return Ok(outcome);
        }
    }

    let behavior = ctx.state.network.scope(input.region_id)?.behavior(input.mode).clone();
    let core_delay = behavior.delay.sample(&mut *ctx.rng);
    let transmission = ctx.loss_model.transmit(&behavior.transmission, &mut *ctx.rng);
    let mut attempts = transmission.attempts;
    if !transmission.success {
        if input.message.is_stream() {
            // streams keep retrying within their session
            attempts += 1;
        } else {
            outcome.unacknowledge(NegativeAckReason::PacketLoss);
            metrics::counter!(metric_defs::STREAM_PACKET_LOSS.name, &labels(module, input)).increment(1);
        }
    }
    let base_end = input.start + core_delay.saturating_mul(attempts as u64);
    outcome.end_time = base_end;

    let network = &ctx.state.network;
    let needed = match input.message.routing.stream {
        Some(stream) => {
            let needed = stream.bandwidth_bps;
            if !network.is_sufficient(input.region_id, input.mode, needed)? {
                outcome.disable(NegativeAckReason::ChannelCapacityExceeded);
            }
            if !node_sufficient(ctx, input, needed) {
                outcome.disable(NegativeAckReason::NodeCapacityExceeded);
            }
            needed
        }
        None => {
            let endpoint = input.node.map_or(NodeKind::Vehicle, |n| ctx.state.nodes.kind(n));
            let bits = ctx.state.headers.message_bits(input.message, endpoint);
            let nominal = calculate_needed_capacity(bits, core_delay)?.saturating_mul(attempts as u64);
            let sufficient = network.is_sufficient(input.region_id, input.mode, nominal)?
                && node_sufficient(ctx, input, nominal);
            if sufficient {
                nominal
            } else {
                let region_available = network.is_available(input.region_id, input.mode)?;
                let node_available = node_available(ctx, input);
                let region_bandwidth = if region_available {
                    network.available_bandwidth(input.region_id, input.mode)?
                } else {
                    0
                };
                let node_bandwidth = if node_available { node_available_bandwidth(ctx, input) } else { 0 };
                if region_bandwidth > 0 && node_bandwidth > 0 {
                    let bandwidth = region_bandwidth.min(node_bandwidth);
                    let stretched =
                        calculate_needed_delay(bits.saturating_mul(attempts as u64), bandwidth)?;
                    outcome.end_time = base_end.max(input.start + stretched);
                    trace!(
                        "msg {} stretched to {} at {} bps",
                        input.message.id,
                        outcome.end_time,
                        bandwidth
                    );
                    bandwidth
                } else {
                    outcome.processed = false;
                    outcome.acknowledged = false;
                    if region_bandwidth == 0 {
                        outcome.reasons.push(NegativeAckReason::ChannelCapacityExceeded);
                    }
                    if node_bandwidth == 0 {
                        outcome.reasons.push(NegativeAckReason::NodeCapacityExceeded);
                    }
                    0
                }
            }
        }
    };

    if !outcome.processed {
        outcome.end_time = input.start.max(outcome.end_time);
        record_rejection(module, input, &outcome);
        return Ok(outcome);
    }

    if needed == 0 {
        // a very long core delay can round the nominal bitrate down to nothing
        warn!(
            "{}: msg {} needs less than 1 bps in {}, nothing reserved",
            module.as_label(),
            input.message.id,
            input.region_id
        );
    } else {
        ctx.state.network.consume(input.region_id, input.mode, needed)?;
        if input.mode != TransmissionMode::DownlinkMulticast {
            if let Some(config) = input.node.and_then(|n| ctx.state.nodes.cell_configuration_mut(n)) {
                config.consume(LinkDirection::from(input.mode), needed)?;
            }
        }
    }
    outcome.bandwidth_bps = needed;

    let labels = labels(module, input);
    metrics::counter!(metric_defs::STREAM_ADMITTED.name, &labels).increment(1);
    metrics::histogram!(metric_defs::CAPACITY_CONSUMED.name, &labels).record(needed as f64);
    metrics::histogram!(metric_defs::STREAM_DURATION.name, &labels)
        .record((outcome.end_time - input.start).as_secs_f64() * 1000.0);
    record_scope_level(ctx, input.region_id, input.mode);

    debug!(
        "{} admitted msg {} in {} ({}): {} bps until {}",
        module.as_label(),
        input.message.id,
        input.region_id,
        input.mode.as_label(),
        needed,
        outcome.end_time
    );
    Ok(outcome)
}

/// Schedule the release record and the negative acknowledgement for `outcome`.
///
/// Returns the reservation record for forwarding to the next module.
pub fn emit_result(
    ctx: &mut ModuleContext<'_>,
    module: CellModule,
    input: &StreamInput<'_>,
    outcome: &StreamOutcome,
) -> StreamResult {
    let result = StreamResult {
        region_id: input.region_id.to_string(),
        consumed_bandwidth_bps: outcome.bandwidth_bps,
        mode: input.mode,
        involved_node: input.node.map(str::to_string),
        message: input.message.clone(),
    };

    if outcome.processed {
        let hold = input.message.routing.stream.map_or(SimTime::ZERO, |s| s.duration);
        ctx.outbox.finish(CellModuleMessage {
            emitting_module: module,
            next_module: module,
            start_time: input.start,
            end_time: outcome.end_time + hold,
            resource: ModuleResource::Stream(result.clone()),
        });
    }

    if !outcome.acknowledged && input.message.protocol() == Protocol::Tcp {
        send_nack(ctx, module, input.message, outcome.end_time, outcome.reasons.clone());
    }
    result
}

/// Queue a negative acknowledgement towards the sender of `message`.
pub fn send_nack(
    ctx: &mut ModuleContext<'_>,
    module: CellModule,
    message: &V2xMessage,
    time: SimTime,
    reasons: Vec<NegativeAckReason>,
) {
    debug!(
        "{} nacks msg {} to {}: {:?}",
        module.as_label(),
        message.id,
        message.routing.source,
        reasons
    );
    metrics::counter!(metric_defs::DELIVERY_NACKS.name, "module" => module.as_label()).increment(1);
    ctx.outbox.interact(Interaction::Acknowledgement(V2xMessageAcknowledgement {
        time,
        message_id: message.id,
        sender: message.routing.source.clone(),
        acknowledged: false,
        reasons,
    }));
}

/// Return the bandwidth held by a reservation.
pub fn release(ctx: &mut ModuleContext<'_>, module: CellModule, result: &StreamResult) -> Result<(), CellError> {
    let amount = result.consumed_bandwidth_bps;
    if result.mode != TransmissionMode::DownlinkMulticast {
        match result
            .involved_node
            .as_deref()
            .and_then(|n| ctx.state.nodes.cell_configuration_mut(n))
        {
            Some(config) => {
                if config.release(LinkDirection::from(result.mode), amount) {
                    warn!(
                        "{}: release of {} bps for node {} saturated at its maximum",
                        module.as_label(),
                        amount,
                        config.node_id()
                    );
                }
            }
            None => debug!(
                "{}: no cell configuration for {:?}, skipping node release",
                module.as_label(),
                result.involved_node
            ),
        }
    }

    let saturated = ctx.state.network.release(&result.region_id, result.mode, amount)?;
    for scope in saturated {
        warn!(
            "{}: release of {} bps in {} saturated at max capacity",
            module.as_label(),
            amount,
            scope
        );
    }
    record_scope_level(ctx, &result.region_id, result.mode);
    trace!(
        "{} released {} bps of msg {} in {}",
        module.as_label(),
        amount,
        result.message.id,
        result.region_id
    );
    Ok(())
}

fn labels(module: CellModule, input: &StreamInput<'_>) -> [(&'static str, String); 3] {
    [
        ("module", module.as_label().to_string()),
        ("region", input.region_id.to_string()),
        ("mode", input.mode.as_label().to_string()),
    ]
}

fn record_rejection(module: CellModule, input: &StreamInput<'_>, outcome: &StreamOutcome) {
    debug!(
        "{} rejected msg {} in {} ({}): {:?}",
        module.as_label(),
        input.message.id,
        input.region_id,
        input.mode.as_label(),
        outcome.reasons
    );
    for reason in &outcome.reasons {
        let labels = [
            ("module", module.as_label().to_string()),
            ("region", input.region_id.to_string()),
            ("mode", input.mode.as_label().to_string()),
            ("reason", reason.as_label().to_string()),
        ];
        metrics::counter!(metric_defs::STREAM_REJECTED.name, &labels).increment(1);
    }
}

fn record_scope_level(ctx: &ModuleContext<'_>, region_id: &str, mode: TransmissionMode) {
    let Ok(scope) = ctx.state.network.scope(region_id) else {
        return;
    };
    let direction = if mode.is_uplink() { "uplink" } else { "downlink" };
    let labels = [
        ("region", region_id.to_string()),
        ("direction", direction.to_string()),
    ];
    metrics::gauge!(metric_defs::SCOPE_AVAILABLE.name, &labels).set(scope.capacity(mode) as f64);
}
