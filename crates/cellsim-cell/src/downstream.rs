//! Downlink from the base station to the receivers.

use crate::stream::{self, StreamInput};
use crate::{metric_defs, CellError, ModuleContext};
use cellsim_common::{
    CellModule, CellModuleMessage, GeocasterResult, Interaction, ModuleResource, NodeName,
    SimTime, TransmissionMode, V2xMessageReception,
};
use tracing::trace;

/// Last module of the chain.
///
/// Unicast results are admitted per receiver against the receiver's
/// downlink; multicast results once per region against the region's
/// multicast share. Each region is evaluated on its own.
#[derive(Debug, Default)]
pub struct DownstreamModule {
    processed_messages: u64,
}

impl DownstreamModule {
    const MODULE: CellModule = CellModule::Downstream;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed_messages(&self) -> u64 {
        self.processed_messages
    }

    /// Handle a routed message or a release record.
    pub fn process_event(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        message: &CellModuleMessage,
    ) -> Result<(), CellError> {
        match &message.resource {
            ModuleResource::Stream(result) if message.is_release() => {
                stream::release(ctx, Self::MODULE, result)
            }
            ModuleResource::Geocaster(result) => {
                self.processed_messages += 1;
                match result.downstream_mode {
                    TransmissionMode::DownlinkMulticast => self.multicast(ctx, result),
                    _ => self.unicast(ctx, result),
                }
            }
            ModuleResource::Stream(_) => Err(CellError::UnexpectedResource {
                module: Self::MODULE,
                resource: "forwarded stream result",
            }),
        }
    }

    fn unicast(&mut self, ctx: &mut ModuleContext<'_>, result: &GeocasterResult) -> Result<(), CellError> {
        let start = ctx.time;
        for (region, receivers) in &result.receivers {
            for receiver in receivers {
                let input = StreamInput {
                    mode: TransmissionMode::DownlinkUnicast,
                    region_id: region,
                    node: Some(receiver.as_str()),
                    message: &result.message,
                    start,
                };
                let outcome = stream::process(ctx, Self::MODULE, &input)?;
                stream::emit_result(ctx, Self::MODULE, &input, &outcome);
                if outcome.acknowledged {
                    deliver(ctx, &input, outcome.end_time, outcome.bandwidth_bps, std::slice::from_ref(receiver));
                }
            }
        }
        Ok(())
    }

    fn multicast(&mut self, ctx: &mut ModuleContext<'_>, result: &GeocasterResult) -> Result<(), CellError> {
        let start = ctx.time;
        for (region, receivers) in &result.receivers {
            let input = StreamInput {
                mode: TransmissionMode::DownlinkMulticast,
                region_id: region,
                node: None,
                message: &result.message,
                start,
            };
            let outcome = stream::process(ctx, Self::MODULE, &input)?;
            stream::emit_result(ctx, Self::MODULE, &input, &outcome);
            if outcome.acknowledged {
                let enabled: Vec<NodeName> = receivers
                    .iter()
                    .filter(|r| ctx.state.nodes.is_cell_enabled(r))
                    .cloned()
                    .collect();
                deliver(ctx, &input, outcome.end_time, outcome.bandwidth_bps, &enabled);
            }
        }
        Ok(())
    }
}

fn deliver(
    ctx: &mut ModuleContext<'_>,
    input: &StreamInput<'_>,
    end_time: SimTime,
    bandwidth_bps: u64,
    receivers: &[NodeName],
) {
    for receiver in receivers {
        trace!(
            "downstream: msg {} reaches {} at {}",
            input.message.id,
            receiver,
            end_time
        );
        ctx.outbox.interact(Interaction::Reception(V2xMessageReception {
            time: end_time,
            receiver: receiver.clone(),
            message_id: input.message.id,
            send_time: input.start,
            needed_bandwidth_bps: bandwidth_bps,
        }));
    }
    let labels = [
        ("region", input.region_id.to_string()),
        ("mode", input.mode.as_label().to_string()),
    ];
    metrics::counter!(metric_defs::DELIVERY_RECEPTIONS.name, &labels).increment(receivers.len() as u64);
}
