//! Per-cycle network stability.
//!
//! The engine reports, per layer, how similar the current activation pattern
//! is to the previous cycle's. The monitor averages that over the stage's
//! layer set into the single scalar the phase detector consumes.

use tracing::debug;

use crate::engine::{Engine, EngineError, LayerId};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StabilityReading {
    /// Mean similarity over the monitored layers.
    pub value: f64,
    /// Layers whose similarity was NaN/inf this cycle and counted as 0.
    pub degenerate_layers: u32,
    /// Layers zeroed because their total activity fell below the floor.
    pub silent_layers: u32,
}

impl StabilityReading {
    pub fn is_degenerate(&self) -> bool {
        self.degenerate_layers > 0
    }
}

#[derive(Debug, Clone)]
pub struct StabilityMonitor {
    layers: Vec<LayerId>,
    min_layer_activity: f32,
    scratch: Vec<f32>,
}

impl StabilityMonitor {
    pub fn new(layers: Vec<LayerId>) -> Self {
        Self {
            layers,
            min_layer_activity: 0.0,
            scratch: Vec::new(),
        }
    }

    /// Treat a layer whose summed activation is below `floor` as unstable
    /// (similarity 0). `0.0` disables the check.
    pub fn with_min_layer_activity(mut self, floor: f32) -> Self {
        self.min_layer_activity = floor.max(0.0);
        self
    }

    pub fn measure<E: Engine + ?Sized>(
        &mut self,
        engine: &E,
    ) -> Result<StabilityReading, EngineError> {
        let mut reading = StabilityReading::default();
        if self.layers.is_empty() {
            return Ok(reading);
        }

        let sims = engine.layer_similarity(&self.layers)?;

        let mut sum = 0.0f64;
        for layer in &self.layers {
            let raw = *sims.get(layer).ok_or_else(|| {
                EngineError::InvalidValue(format!("no similarity reported for layer '{layer}'"))
            })?;

            let mut sim = if raw.is_finite() {
                raw
            } else {
                debug!(layer = %layer, value = raw, "degenerate similarity treated as 0");
                reading.degenerate_layers += 1;
                0.0
            };

            if self.min_layer_activity > 0.0 {
                engine.layer_activations(layer, &mut self.scratch)?;
                let total: f32 = self.scratch.iter().sum();
                if total < self.min_layer_activity {
                    reading.silent_layers += 1;
                    sim = 0.0;
                }
            }

            sum += sim;
        }

        reading.value = sum / self.layers.len() as f64;
        Ok(reading)
    }
}
