//! Terminal entity for interactions leaving the cell chain.

use cellsim_common::{Entity, EntityId, Event, EventPayload, Interaction, SimContext, SimError};
use tracing::{debug, info};

/// Receives deliveries and acknowledgements and counts them.
#[derive(Debug)]
pub struct RtiEndpoint {
    id: EntityId,
    receptions: u64,
    acknowledgements: u64,
    negative_acknowledgements: u64,
}

impl RtiEndpoint {
    pub fn new(id: EntityId) -> Self {
        RtiEndpoint {
            id,
            receptions: 0,
            acknowledgements: 0,
            negative_acknowledgements: 0,
        }
    }

    pub fn receptions(&self) -> u64 {
        self.receptions
    }

    /// Negative acknowledgements seen so far.
    pub fn negative_acknowledgements(&self) -> u64 {
        self.negative_acknowledgements
    }

    fn record(&mut self, interaction: &Interaction) {
        match interaction {
            Interaction::Reception(reception) => {
                self.receptions += 1;
                debug!(
                    "rti: {} received msg {} at {}",
                    reception.receiver, reception.message_id, reception.time
                );
            }
            Interaction::Acknowledgement(ack) if ack.acknowledged => {
                self.acknowledgements += 1;
                debug!("rti: msg {} of {} acknowledged", ack.message_id, ack.sender);
            }
            Interaction::Acknowledgement(ack) => {
                self.negative_acknowledgements += 1;
                debug!(
                    "rti: msg {} of {} not acknowledged at {}: {:?}",
                    ack.message_id, ack.sender, ack.time, ack.reasons
                );
            }
        }
    }
}

impl Entity for RtiEndpoint {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::Interaction(interaction) = &event.payload {
            self.record(interaction);
        }
        Ok(())
    }

    fn finish(&mut self) {
        info!(
            "rti: {} receptions, {} acknowledgements, {} negative acknowledgements",
            self.receptions, self.acknowledgements, self.negative_acknowledgements
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellsim_common::{
        EventId, MessageId, NegativeAckReason, SimTime, V2xMessageAcknowledgement,
        V2xMessageReception,
    };

    fn interaction_event(interaction: Interaction) -> Event {
        Event {
            id: EventId(0),
            time: interaction.time(),
            source: EntityId(1),
            targets: vec![EntityId(2)],
            payload: EventPayload::Interaction(interaction),
        }
    }

    #[test]
    fn test_counts_receptions_and_nacks() {
        let mut rti = RtiEndpoint::new(EntityId(2));
        let mut ctx = SimContext::new(0);
        let reception = Interaction::Reception(V2xMessageReception {
            time: SimTime::from_millis(100),
            receiver: "veh_1".into(),
            message_id: MessageId(1),
            send_time: SimTime::from_millis(50),
            needed_bandwidth_bps: 8960,
        });
        let nack = Interaction::Acknowledgement(V2xMessageAcknowledgement {
            time: SimTime::from_millis(50),
            message_id: MessageId(2),
            sender: "veh_0".into(),
            acknowledged: false,
            reasons: vec![NegativeAckReason::ChannelCapacityExceeded],
        });

        rti.handle_event(&interaction_event(reception), &mut ctx).unwrap();
        rti.handle_event(&interaction_event(nack), &mut ctx).unwrap();

        assert_eq!(rti.receptions(), 1);
        assert_eq!(rti.negative_acknowledgements(), 1);
        assert!(ctx.take_pending_events().is_empty());
    }
}
