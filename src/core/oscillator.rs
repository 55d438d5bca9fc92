//! Oscillating inhibition.
//!
//! Layer groups receive a sinusoidal multiplier on their inhibition
//! conductance: `amplitude[g] * sin(2π·i/P) + 1.0`. High-amplitude groups are
//! pushed out of their attractors harder than low-amplitude ones.
//!
//! The multiplier is always applied to a baseline captured before the bout,
//! never to the previous cycle's value, so gains do not compound.

use hashbrown::HashMap;
use tracing::debug;

use crate::engine::{Engine, EngineError, LayerId};
use crate::error::ConfigError;

/// Centre of the oscillation; a gain of 1.0 leaves inhibition untouched.
pub const MIDLINE: f32 = 1.0;

/// Deterministic, periodic inhibition-gain schedule.
///
/// One full period is tabulated per group at construction, so
/// `gain_at(g, i) == gain_at(g, i + period)` holds exactly.
#[derive(Debug, Clone)]
pub struct InhibitionOscillator {
    period: u32,
    groups: Vec<String>,
    tables: Vec<Vec<f32>>,
}

impl InhibitionOscillator {
    pub fn new(period: u32, amplitudes: &HashMap<String, f32>) -> Result<Self, ConfigError> {
        if period == 0 {
            return Err(ConfigError::OscillationPeriod);
        }

        // Sorted so table order does not depend on hash iteration order.
        let mut groups: Vec<String> = amplitudes.keys().cloned().collect();
        groups.sort();

        let mut tables = Vec::with_capacity(groups.len());
        for group in &groups {
            let amplitude = amplitudes[group];
            if !amplitude.is_finite() {
                return Err(ConfigError::NonFiniteAmplitude {
                    group: group.clone(),
                    value: amplitude,
                });
            }
            let table = (0..period)
                .map(|i| {
                    let angle = core::f64::consts::TAU * f64::from(i) / f64::from(period);
                    (f64::from(amplitude) * angle.sin()) as f32 + MIDLINE
                })
                .collect();
            tables.push(table);
        }

        Ok(Self {
            period,
            groups,
            tables,
        })
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.group_index(group).is_some()
    }

    fn group_index(&self, group: &str) -> Option<usize> {
        self.groups.iter().position(|g| g == group)
    }

    /// Inhibition multiplier for `group` at `cycle`.
    ///
    /// Unknown groups are not modulated and get the midline gain.
    pub fn gain_at(&self, group: &str, cycle: u64) -> f32 {
        match self.group_index(group) {
            Some(idx) => self.gain_by_index(idx, cycle),
            None => MIDLINE,
        }
    }

    #[inline]
    fn gain_by_index(&self, idx: usize, cycle: u64) -> f32 {
        self.tables[idx][(cycle % u64::from(self.period)) as usize]
    }
}

#[derive(Debug, Clone)]
struct OscillatedLayer {
    layer: LayerId,
    group: usize,
    baseline: f32,
}

/// Pre-bout inhibition snapshot for every oscillated layer.
///
/// Owned by the bout's sleep-mode guard; `restore` puts every conductance
/// back exactly as captured.
#[derive(Debug, Clone, Default)]
pub struct InhibitionBaselines {
    layers: Vec<OscillatedLayer>,
}

impl InhibitionBaselines {
    /// Capture baselines for every layer in `assignment` (layer -> group).
    ///
    /// Layers are visited in name order for deterministic call sequences.
    pub fn snapshot<E: Engine + ?Sized>(
        engine: &E,
        oscillator: &InhibitionOscillator,
        assignment: &HashMap<LayerId, String>,
    ) -> Result<Self, EngineError> {
        let mut names: Vec<&LayerId> = assignment.keys().collect();
        names.sort();

        let mut layers = Vec::with_capacity(names.len());
        for name in names {
            let group = assignment[name].as_str();
            let Some(group) = oscillator.group_index(group) else {
                continue;
            };
            let baseline = engine.inhibition(name)?;
            if !baseline.is_finite() || baseline < 0.0 {
                return Err(EngineError::InvalidValue(format!(
                    "inhibition baseline for '{name}' is {baseline}"
                )));
            }
            layers.push(OscillatedLayer {
                layer: name.clone(),
                group,
                baseline,
            });
        }
        debug!(layers = layers.len(), "captured inhibition baselines");
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn baseline(&self, layer: &str) -> Option<f32> {
        self.layers
            .iter()
            .find(|l| l.layer == layer)
            .map(|l| l.baseline)
    }

    /// Write `baseline * gain` for every oscillated layer. Returns the gain of
    /// the first group (used as the per-cycle telemetry value).
    pub fn apply<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        oscillator: &InhibitionOscillator,
        cycle: u64,
    ) -> Result<f32, EngineError> {
        for l in &self.layers {
            let gain = oscillator.gain_by_index(l.group, cycle);
            engine.set_inhibition(&l.layer, l.baseline * gain)?;
        }
        Ok(if oscillator.tables.is_empty() {
            MIDLINE
        } else {
            oscillator.gain_by_index(0, cycle)
        })
    }

    /// Restore every captured conductance. Keeps going after a failure and
    /// reports the first one.
    pub fn restore<E: Engine + ?Sized>(&self, engine: &mut E) -> Result<(), EngineError> {
        let mut first_err = None;
        for l in &self.layers {
            if let Err(e) = engine.set_inhibition(&l.layer, l.baseline) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
