//! Routing of uplinked messages to their receivers.

use crate::region;
use crate::stream::send_nack;
use crate::{metric_defs, CellError, ModuleContext};
use cellsim_common::{
    CellModule, CellModuleMessage, DestinationKind, GeoArea, GeocasterResult, ModuleResource,
    NegativeAckReason, NetworkAddress, NodeName, Protocol, RegionId, TransmissionMode, V2xMessage,
    GLOBAL_NETWORK_ID,
};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolves the receivers of a message and groups them by region.
///
/// Pure routing: no bandwidth is consumed here.
#[derive(Debug, Default)]
pub struct GeocasterModule {
    processed_messages: u64,
}

impl GeocasterModule {
    const MODULE: CellModule = CellModule::Geocaster;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed_messages(&self) -> u64 {
        self.processed_messages
    }

    /// Handle a result forwarded by the upstream module.
    pub fn process_event(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        message: &CellModuleMessage,
    ) -> Result<(), CellError> {
        let ModuleResource::Stream(result) = &message.resource else {
            return Err(CellError::UnexpectedResource {
                module: Self::MODULE,
                resource: "geocaster result",
            });
        };
        let is_full_message = message.emitting_module != CellModule::Upstream;
        self.route(ctx, &result.message, is_full_message);
        self.processed_messages += 1;
        Ok(())
    }

    fn route(&mut self, ctx: &mut ModuleContext<'_>, message: &V2xMessage, is_full_message: bool) {
        let destination = &message.routing.destination;
        let broadcast = destination.address == NetworkAddress::Broadcast;
        let tcp = destination.protocol == Protocol::Tcp;

        let routed = match (&destination.kind, &destination.address, &destination.area) {
            (DestinationKind::CellTopocast, NetworkAddress::Unicast(receiver), _) => {
                match resolve_topocast(ctx, receiver) {
                    Some(receivers) => Some((receivers, TransmissionMode::DownlinkUnicast)),
                    None => {
                        debug!("geocaster: receiver {} of msg {} has no cell module", receiver, message.id);
                        return;
                    }
                }
            }
            (DestinationKind::CellGeocast, _, Some(area)) if broadcast && !tcp => {
                Some((resolve_geo_unicast(ctx, area), TransmissionMode::DownlinkUnicast))
            }
            (DestinationKind::CellGeocastMbs, _, Some(area)) if broadcast && !tcp => {
                Some((resolve_geo_broadcast(ctx, area), TransmissionMode::DownlinkMulticast))
            }
            _ => None,
        };

        let Some((receivers, downstream_mode)) = routed else {
            debug!(
                "geocaster: msg {} from {} as {:?} to {:?} cannot be routed",
                message.id, message.routing.source, destination.kind, destination.address
            );
            if tcp {
                let now = ctx.time;
                send_nack(ctx, Self::MODULE, message, now, vec![NegativeAckReason::AddressRoutingError]);
            }
            return;
        };

        let result = GeocasterResult {
            receivers,
            downstream_mode,
            message: message.clone(),
            is_full_message,
        };
        metrics::histogram!(
            metric_defs::GEOCAST_RECEIVERS.name,
            "downstream_mode" => downstream_mode.as_label()
        )
        .record(result.receiver_count() as f64);
        debug!(
            "geocaster: msg {} routed to {} receivers in {} regions ({})",
            message.id,
            result.receiver_count(),
            result.receivers.len(),
            downstream_mode.as_label()
        );
        ctx.outbox.finish(CellModuleMessage {
            emitting_module: Self::MODULE,
            next_module: CellModule::Downstream,
            start_time: ctx.time,
            end_time: ctx.time,
            resource: ModuleResource::Geocaster(result),
        });
    }
}

fn resolve_topocast(ctx: &mut ModuleContext<'_>, receiver: &str) -> Option<BTreeMap<RegionId, Vec<NodeName>>> {
    ctx.state.nodes.cell_configuration(receiver)?;
    let region = ctx.state.region_for(receiver);
    Some(BTreeMap::from([(region, vec![receiver.to_string()])]))
}

/// Every node inside the area, addressed individually.
///
/// Nodes are shuffled within their region; regions are delivered in id order.
fn resolve_geo_unicast(ctx: &mut ModuleContext<'_>, area: &GeoArea) -> BTreeMap<RegionId, Vec<NodeName>> {
    let mut nodes = region::nodes_in_area(&ctx.state.nodes, area);
    // shuffled so that the same receivers do not always win a scarce downlink
    nodes.shuffle(&mut *ctx.rng);
    let mut receivers: BTreeMap<RegionId, Vec<NodeName>> = BTreeMap::new();
    for node in nodes {
        let region = ctx.state.region_for(&node);
        receivers.entry(region).or_default().push(node);
    }
    receivers
}

/// One multicast per region touching the area, to all nodes of that region.
///
/// Area nodes outside every named region get a multicast in the global scope.
fn resolve_geo_broadcast(ctx: &mut ModuleContext<'_>, area: &GeoArea) -> BTreeMap<RegionId, Vec<NodeName>> {
    let regions = region::regions_for_area(&ctx.state.network, area);
    let mut receivers: BTreeMap<RegionId, Vec<NodeName>> = regions
        .into_iter()
        .map(|region| {
            let nodes = ctx.state.nodes_in_region(&region);
            (region, nodes)
        })
        .collect();

    let global: Vec<NodeName> = region::nodes_in_area(&ctx.state.nodes, area)
        .into_iter()
        .filter(|node| ctx.state.region_for(node) == GLOBAL_NETWORK_ID)
        .collect();
    if !global.is_empty() {
        receivers.insert(GLOBAL_NETWORK_ID.to_string(), global);
    }
    receivers
}
