//! The chain manager entity.
//!
//! Owns the cell state and the three modules, feeds them events and turns
//! their outputs into scheduled events.

use crate::{
    CellConfiguration, CellError, CellState, ChainOutbox, DownstreamModule, GeocasterModule,
    LossModel, ModuleContext, UpstreamModule,
};
use cellsim_common::{
    CellModule, CellModuleMessage, Entity, EntityId, Event, EventPayload, Interaction,
    NodeCellUpdate, SimContext, SimError, V2xMessage,
};
use serde::Serialize;
use tracing::{debug, info};

/// Processed-message counters of the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainStatistics {
    pub upstream_messages: u64,
    pub geocaster_messages: u64,
    pub downstream_messages: u64,
    /// Sends whose destination is not a cell type.
    pub skipped_messages: u64,
}

/// Entity that runs messages through upstream, geocaster and downstream.
pub struct ChainManager {
    id: EntityId,
    rti_id: EntityId,
    state: CellState,
    loss_model: Box<dyn LossModel>,
    upstream: UpstreamModule,
    geocaster: GeocasterModule,
    downstream: DownstreamModule,
    outbox: ChainOutbox,
    skipped_messages: u64,
}

impl ChainManager {
    /// Create a chain manager that reports interactions to `rti_id`.
    pub fn new(id: EntityId, rti_id: EntityId, state: CellState, loss_model: Box<dyn LossModel>) -> Self {
        ChainManager {
            id,
            rti_id,
            state,
            loss_model,
            upstream: UpstreamModule::new(),
            geocaster: GeocasterModule::new(),
            downstream: DownstreamModule::new(),
            outbox: ChainOutbox::default(),
            skipped_messages: 0,
        }
    }

    pub fn state(&self) -> &CellState {
        &self.state
    }

    pub fn statistics(&self) -> ChainStatistics {
        ChainStatistics {
            upstream_messages: self.upstream.processed_messages(),
            geocaster_messages: self.geocaster.processed_messages(),
            downstream_messages: self.downstream.processed_messages(),
            skipped_messages: self.skipped_messages,
        }
    }

    pub fn log_statistics(&self) {
        let stats = self.statistics();
        info!(
            "cell chain: upstream={} geocaster={} downstream={} skipped={}",
            stats.upstream_messages,
            stats.geocaster_messages,
            stats.downstream_messages,
            stats.skipped_messages
        );
    }

    /// Entry point of a freshly sent message.
    fn start_event(&mut self, ctx: &mut SimContext, message: &V2xMessage) -> Result<(), CellError> {
        if !message.routing.destination.kind.is_cell() {
            debug!(
                "chain: msg {} from {} is not addressed to the cell network",
                message.id, message.routing.source
            );
            self.skipped_messages += 1;
            return Ok(());
        }
        let time = ctx.time();
        let mut module_ctx = ModuleContext {
            time,
            rng: ctx.rng(),
            state: &mut self.state,
            loss_model: self.loss_model.as_ref(),
            outbox: &mut self.outbox,
        };
        self.upstream.process_message(&mut module_ctx, message)?;
        self.flush(ctx);
        Ok(())
    }

    /// Deliver a hand-off or release record to its module.
    fn module_event(&mut self, ctx: &mut SimContext, message: &CellModuleMessage) -> Result<(), CellError> {
        let time = ctx.time();
        let mut module_ctx = ModuleContext {
            time,
            rng: ctx.rng(),
            state: &mut self.state,
            loss_model: self.loss_model.as_ref(),
            outbox: &mut self.outbox,
        };
        match message.next_module {
            CellModule::Upstream => self.upstream.process_event(&mut module_ctx, message)?,
            CellModule::Geocaster => self.geocaster.process_event(&mut module_ctx, message)?,
            CellModule::Downstream => self.downstream.process_event(&mut module_ctx, message)?,
        }
        self.flush(ctx);
        Ok(())
    }

    fn update_configuration(&mut self, update: &NodeCellUpdate) -> Result<(), CellError> {
        let config = CellConfiguration::from_update(update)?;
        debug!(
            "chain: cell module of {} {}",
            update.node,
            if update.enabled { "enabled" } else { "disabled" }
        );
        self.state.nodes.set_cell_configuration(config);
        Ok(())
    }

    /// Schedule everything the modules queued.
    fn flush(&mut self, ctx: &mut SimContext) {
        let (messages, interactions) = self.outbox.drain();
        for message in messages {
            self.finish_event(ctx, message);
        }
        for interaction in interactions {
            self.interact(ctx, interaction);
        }
    }

    /// Hand a module result to the next module at its end time.
    fn finish_event(&self, ctx: &mut SimContext, message: CellModuleMessage) {
        ctx.post_at(message.end_time, vec![self.id], EventPayload::CellModule(message));
    }

    fn interact(&self, ctx: &mut SimContext, interaction: Interaction) {
        ctx.post_at(interaction.time(), vec![self.rti_id], EventPayload::Interaction(interaction));
    }
}

impl Entity for ChainManager {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        let result = match &event.payload {
            EventPayload::V2xMessageSend(message) => self.start_event(ctx, message),
            EventPayload::CellModule(message) => self.module_event(ctx, message),
            EventPayload::NodePosition(update) => {
                self.state.update_position(&update.node, update.position);
                Ok(())
            }
            EventPayload::CellConfigurationUpdate(update) => self.update_configuration(update),
            _ => Ok(()),
        };
        result.map_err(|e| e.into_sim_error(self.id))
    }

    fn finish(&mut self) {
        self.log_statistics();
    }
}
