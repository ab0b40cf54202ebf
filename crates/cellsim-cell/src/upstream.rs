//! Uplink from the sending node to the base station.

use crate::stream::{self, StreamInput};
use crate::{CellError, ModuleContext};
use cellsim_common::{
    CellModule, CellModuleMessage, ModuleResource, TransmissionMode, V2xMessage,
};
use tracing::trace;

/// First module of the chain.
///
/// Debits the sender's uplink and the uplink of the sender's region, then
/// forwards acknowledged transmissions to the geocaster.
#[derive(Debug, Default)]
pub struct UpstreamModule {
    processed_messages: u64,
}

impl UpstreamModule {
    const MODULE: CellModule = CellModule::Upstream;

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages that entered the module.
    pub fn processed_messages(&self) -> u64 {
        self.processed_messages
    }

    /// Admit a freshly sent message.
    pub fn process_message(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        message: &V2xMessage,
    ) -> Result<(), CellError> {
        self.processed_messages += 1;
        let sender = message.routing.source.as_str();
        let region = ctx.state.region_for(sender);
        let input = StreamInput {
            mode: TransmissionMode::UplinkUnicast,
            region_id: &region,
            node: Some(sender),
            message,
            start: ctx.time,
        };
        trace!("upstream: msg {} from {} in {}", message.id, sender, region);

        let outcome = stream::process(ctx, Self::MODULE, &input)?;
        let result = stream::emit_result(ctx, Self::MODULE, &input, &outcome);
        if outcome.processed && outcome.acknowledged {
            ctx.outbox.finish(CellModuleMessage {
                emitting_module: Self::MODULE,
                next_module: CellModule::Geocaster,
                start_time: input.start,
                end_time: outcome.end_time,
                resource: ModuleResource::Stream(result),
            });
        }
        Ok(())
    }

    /// Handle a chain event addressed to this module (release records only).
    pub fn process_event(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        message: &CellModuleMessage,
    ) -> Result<(), CellError> {
        match &message.resource {
            ModuleResource::Stream(result) if message.is_release() => {
                stream::release(ctx, Self::MODULE, result)
            }
            ModuleResource::Stream(_) => Err(CellError::UnexpectedResource {
                module: Self::MODULE,
                resource: "forwarded stream result",
            }),
            ModuleResource::Geocaster(_) => Err(CellError::UnexpectedResource {
                module: Self::MODULE,
                resource: "geocaster result",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::CellConfiguration;
    use cellsim_common::{
        Interaction, NegativeAckReason, Protocol, SimTime, GLOBAL_NETWORK_ID,
    };

    fn harness(loss_probability: f64) -> Harness {
        let mut net = network(1_000_000, 1_000_000, 1_000_000, 1_000_000);
        if loss_probability > 0.0 {
            let mut global = net.global().clone();
            global.uplink.behavior.transmission.loss_probability = loss_probability;
            net = crate::NetworkState::new(global, net.regions().to_vec(), false).unwrap();
        }
        let mut state = state(net);
        add_node(&mut state, "veh_0", outside_position(), CellConfiguration::unlimited("veh_0"));
        Harness::new(state)
    }

    #[test]
    fn test_admitted_message_is_forwarded_and_released() {
        let mut h = harness(0.0);
        let msg = message("veh_0", topocast("veh_1", Protocol::Udp), 10);
        let mut upstream = UpstreamModule::new();
        upstream.process_message(&mut h.ctx(SimTime::from_secs(10.0)), &msg).unwrap();

        let messages = h.outbox.messages();
        assert_eq!(messages.len(), 2);
        let release = &messages[0];
        assert_eq!(release.emitting_module, CellModule::Upstream);
        assert_eq!(release.next_module, CellModule::Upstream);
        assert_eq!(release.end_time, SimTime::from_millis(10_050));

        let forward = &messages[1];
        assert_eq!(forward.next_module, CellModule::Geocaster);
        assert_eq!(forward.start_time, SimTime::from_secs(10.0));
        assert_eq!(forward.end_time, SimTime::from_millis(10_050));
        match &forward.resource {
            ModuleResource::Stream(result) => {
                assert_eq!(result.region_id, GLOBAL_NETWORK_ID);
                assert_eq!(result.consumed_bandwidth_bps, 8960);
                assert_eq!(result.involved_node.as_deref(), Some("veh_0"));
            }
            other => panic!("unexpected resource {:?}", other),
        }
        assert_eq!(upstream.processed_messages(), 1);
    }

    #[test]
    fn test_udp_packet_loss_only_releases() {
        let mut h = harness(2.0);
        let msg = message("veh_0", topocast("veh_1", Protocol::Udp), 10);
        UpstreamModule::new()
            .process_message(&mut h.ctx(SimTime::from_secs(10.0)), &msg)
            .unwrap();

        assert_eq!(h.outbox.messages().len(), 1);
        assert!(h.outbox.messages()[0].is_release());
        assert!(h.outbox.interactions().is_empty());
    }

    #[test]
    fn test_tcp_packet_loss_nacks_sender() {
        let mut h = harness(2.0);
        let msg = message("veh_0", topocast("veh_1", Protocol::Tcp), 10);
        UpstreamModule::new()
            .process_message(&mut h.ctx(SimTime::from_secs(10.0)), &msg)
            .unwrap();

        assert_eq!(h.outbox.messages().len(), 1);
        match &h.outbox.interactions()[0] {
            Interaction::Acknowledgement(ack) => {
                assert!(!ack.acknowledged);
                assert_eq!(ack.sender, "veh_0");
                assert_eq!(ack.reasons, vec![NegativeAckReason::PacketLoss]);
                assert_eq!(ack.time, SimTime::from_millis(10_050));
            }
            other => panic!("unexpected interaction {:?}", other),
        }
    }

    #[test]
    fn test_streaming_loss_still_forwards() {
        let mut h = harness(2.0);
        let msg = streaming(
            message("veh_0", topocast("veh_1", Protocol::Udp), 10),
            SimTime::from_secs(2.0),
            10_000,
        );
        UpstreamModule::new()
            .process_message(&mut h.ctx(SimTime::from_secs(10.0)), &msg)
            .unwrap();

        let messages = h.outbox.messages();
        assert_eq!(messages.len(), 2);
        // one lost attempt plus one retry
        assert_eq!(messages[1].end_time, SimTime::from_millis(10_100));
        assert_eq!(messages[0].end_time, SimTime::from_millis(12_100));
    }

    #[test]
    fn test_unknown_sender_is_deactivated() {
        let mut h = harness(0.0);
        let msg = message("ghost", topocast("veh_1", Protocol::Tcp), 10);
        UpstreamModule::new()
            .process_message(&mut h.ctx(SimTime::from_secs(1.0)), &msg)
            .unwrap();
        assert!(h.outbox.messages().is_empty());
        match &h.outbox.interactions()[0] {
            Interaction::Acknowledgement(ack) => {
                assert_eq!(ack.reasons, vec![NegativeAckReason::NodeDeactivated]);
                assert_eq!(ack.time, SimTime::from_secs(1.0));
            }
            other => panic!("unexpected interaction {:?}", other),
        }
    }

    #[test]
    fn test_forward_result_is_not_a_release() {
        let mut h = harness(0.0);
        let msg = message("veh_0", topocast("veh_1", Protocol::Udp), 10);
        let mut upstream = UpstreamModule::new();
        upstream.process_message(&mut h.ctx(SimTime::ZERO), &msg).unwrap();
        let forward = h.outbox.messages()[1].clone();
        let err = upstream.process_event(&mut h.ctx(SimTime::ZERO), &forward).unwrap_err();
        assert!(matches!(err, CellError::UnexpectedResource { .. }));

        let release = h.outbox.messages()[0].clone();
        upstream.process_event(&mut h.ctx(SimTime::from_millis(50)), &release).unwrap();
        assert_eq!(h.state.network.global().uplink.capacity, 1_000_000);
    }
}
