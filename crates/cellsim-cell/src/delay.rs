//! Core-network delay models.

use cellsim_common::SimTime;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};

/// Shape of the gamma distribution used for random delays.
const GAMMA_SHAPE: f64 = 2.0;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// How long one transmission attempt takes through a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum DelayModel {
    /// Fixed delay.
    Constant {
        delay_ms: f64,
    },
    /// One of `steps` evenly spaced values between min and max, uniformly chosen.
    SimpleRandom {
        steps: u32,
        min_delay_ms: f64,
        max_delay_ms: f64,
    },
    /// Minimum delay plus a gamma distributed tail with the given expectation.
    GammaRandom {
        min_delay_ms: f64,
        exp_delay_ms: f64,
    },
}

impl DelayModel {
    /// Constant delay.
    pub fn constant(delay: SimTime) -> Self {
        DelayModel::Constant {
            delay_ms: delay.as_nanos() as f64 / NANOS_PER_MILLI,
        }
    }

    /// Check the parameters; delays must be finite and at least 1 ns.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            DelayModel::Constant { delay_ms } if !is_positive_delay(delay_ms) => {
                Err(format!("constant delay must be positive, got {} ms", delay_ms))
            }
            DelayModel::SimpleRandom {
                steps,
                min_delay_ms,
                max_delay_ms,
            } => {
                if steps == 0 {
                    Err("simple_random delay needs at least one step".into())
                } else if !is_positive_delay(min_delay_ms)
                    || !max_delay_ms.is_finite()
                    || max_delay_ms < min_delay_ms
                {
                    Err(format!(
                        "simple_random delay needs 0 < min <= max, got {}..{} ms",
                        min_delay_ms, max_delay_ms
                    ))
                } else {
                    Ok(())
                }
            }
            DelayModel::GammaRandom {
                min_delay_ms,
                exp_delay_ms,
            } if !is_positive_delay(min_delay_ms)
                || !exp_delay_ms.is_finite()
                || exp_delay_ms < min_delay_ms =>
            {
                Err(format!(
                    "gamma_random delay needs 0 < min <= exp, got {} / {} ms",
                    min_delay_ms, exp_delay_ms
                ))
            }
            _ => Ok(()),
        }
    }

    /// Draw a delay.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SimTime {
        let ms = match *self {
            DelayModel::Constant { delay_ms } => delay_ms,
            DelayModel::SimpleRandom {
                steps,
                min_delay_ms,
                max_delay_ms,
            } => {
                if steps <= 1 {
                    min_delay_ms
                } else {
                    let step = rng.gen_range(0..steps);
                    min_delay_ms
                        + (max_delay_ms - min_delay_ms) * step as f64 / (steps - 1) as f64
                }
            }
            DelayModel::GammaRandom {
                min_delay_ms,
                exp_delay_ms,
            } => {
                let scale = (exp_delay_ms - min_delay_ms) / GAMMA_SHAPE;
                match Gamma::new(GAMMA_SHAPE, scale) {
                    Ok(gamma) if scale > 0.0 => min_delay_ms + gamma.sample(rng),
                    _ => min_delay_ms,
                }
            }
        };
        SimTime::from_nanos(millis_to_nanos(ms))
    }
}

fn millis_to_nanos(ms: f64) -> u64 {
    (ms * NANOS_PER_MILLI) as u64
}

/// NaN and anything that truncates to 0 ns fail.
fn is_positive_delay(ms: f64) -> bool {
    ms.is_finite() && millis_to_nanos(ms) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_constant_delay() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let model = DelayModel::constant(SimTime::from_millis(50));
        assert_eq!(model.sample(&mut rng), SimTime::from_millis(50));
    }

    #[test]
    fn test_simple_random_hits_steps() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let model = DelayModel::SimpleRandom {
            steps: 3,
            min_delay_ms: 10.0,
            max_delay_ms: 30.0,
        };
        for _ in 0..100 {
            let ms = model.sample(&mut rng).as_millis();
            assert!(ms == 10 || ms == 20 || ms == 30, "unexpected delay {}", ms);
        }
    }

    #[test]
    fn test_gamma_delay_never_below_min() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let model = DelayModel::GammaRandom {
            min_delay_ms: 20.0,
            exp_delay_ms: 60.0,
        };
        let samples: Vec<SimTime> = (0..2000).map(|_| model.sample(&mut rng)).collect();
        assert!(samples.iter().all(|t| *t >= SimTime::from_millis(20)));
        let mean = samples.iter().map(|t| t.as_secs_f64() * 1000.0).sum::<f64>()
            / samples.len() as f64;
        assert!((mean - 60.0).abs() < 5.0, "mean was {}", mean);
    }

    #[test]
    fn test_validate() {
        assert!(DelayModel::Constant { delay_ms: 0.0 }.validate().is_err());
        assert!(DelayModel::SimpleRandom {
            steps: 0,
            min_delay_ms: 1.0,
            max_delay_ms: 2.0
        }
        .validate()
        .is_err());
        assert!(DelayModel::GammaRandom {
            min_delay_ms: 50.0,
            exp_delay_ms: 40.0
        }
        .validate()
        .is_err());
        assert!(DelayModel::constant(SimTime::from_millis(5)).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nan_and_sub_nanosecond_delays() {
        assert!(DelayModel::Constant { delay_ms: f64::NAN }.validate().is_err());
        assert!(DelayModel::Constant { delay_ms: f64::INFINITY }.validate().is_err());
        assert!(DelayModel::Constant { delay_ms: 1e-9 }.validate().is_err());
        assert!(DelayModel::SimpleRandom {
            steps: 2,
            min_delay_ms: f64::NAN,
            max_delay_ms: 2.0
        }
        .validate()
        .is_err());
        assert!(DelayModel::SimpleRandom {
            steps: 2,
            min_delay_ms: 1.0,
            max_delay_ms: f64::NAN
        }
        .validate()
        .is_err());
        assert!(DelayModel::GammaRandom {
            min_delay_ms: 1e-7,
            exp_delay_ms: 1.0
        }
        .validate()
        .is_err());
        assert!(DelayModel::GammaRandom {
            min_delay_ms: 1.0,
            exp_delay_ms: f64::NAN
        }
        .validate()
        .is_err());

        // 1 us is still a usable delay
        let model = DelayModel::Constant { delay_ms: 0.001 };
        assert!(model.validate().is_ok());
        assert_eq!(model.sample(&mut ChaCha8Rng::seed_from_u64(1)), SimTime::from_nanos(1000));
    }
}
