//! Packet loss strategies.
//!
//! A [`LossModel`] decides how many attempts a transmission needs and whether
//! it eventually gets through. The chain holds one model for all links; the
//! per-link parameters come from [`TransmissionConfig`].

use crate::network::TransmissionConfig;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Result of the loss draw for one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionOutcome {
    /// Attempts made, at least one.
    pub attempts: u32,
    /// Whether the last attempt got through.
    pub success: bool,
}

/// Strategy deciding the number of attempts of a transmission.
pub trait LossModel: Send {
    /// Draw the outcome of one transmission.
    fn transmit(&self, config: &TransmissionConfig, rng: &mut dyn RngCore) -> TransmissionOutcome;
}

/// Retries until an attempt survives or the retry budget is spent.
///
/// Each attempt is lost independently with `loss_probability`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetransmissionLossModel;

impl LossModel for RetransmissionLossModel {
    fn transmit(&self, config: &TransmissionConfig, rng: &mut dyn RngCore) -> TransmissionOutcome {
        let max_attempts = config.max_retries.saturating_add(1);
        for attempt in 1..=max_attempts {
            if rng.gen::<f64>() >= config.loss_probability {
                return TransmissionOutcome {
                    attempts: attempt,
                    success: true,
                };
            }
        }
        TransmissionOutcome {
            attempts: max_attempts,
            success: false,
        }
    }
}

/// Every transmission succeeds on the first attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct LosslessModel;

impl LossModel for LosslessModel {
    fn transmit(&self, _config: &TransmissionConfig, _rng: &mut dyn RngCore) -> TransmissionOutcome {
        TransmissionOutcome {
            attempts: 1,
            success: true,
        }
    }
}

/// Selectable loss strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossModelKind {
    #[default]
    Retransmission,
    Lossless,
}

impl LossModelKind {
    /// Instantiate the strategy.
    pub fn build(self) -> Box<dyn LossModel> {
        match self {
            LossModelKind::Retransmission => Box::new(RetransmissionLossModel),
            LossModelKind::Lossless => Box::new(LosslessModel),
        }
    }
}
