//! Phase-average accumulation and the contrastive replay update.

use hashbrown::HashMap;
use tracing::debug;

use crate::engine::{Engine, EngineError, LayerId, ProjectionId};

/// Mean activation per layer over one finalized phase window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseAverage {
    cycles: u32,
    layers: HashMap<LayerId, Vec<f32>>,
}

impl PhaseAverage {
    pub fn new(cycles: u32, layers: HashMap<LayerId, Vec<f32>>) -> Self {
        Self { cycles, layers }
    }

    /// Number of cycles averaged.
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn layer(&self, layer: &str) -> Option<&[f32]> {
        self.layers.get(layer).map(|v| v.as_slice())
    }
}

#[derive(Debug, Clone, Default)]
struct RunningSum {
    count: u32,
    sums: Vec<Vec<f32>>,
}

impl RunningSum {
    fn clear(&mut self) {
        self.count = 0;
        for s in &mut self.sums {
            s.clear();
        }
    }

    fn average(&self, layers: &[LayerId]) -> PhaseAverage {
        let n = self.count.max(1) as f32;
        let layers = layers
            .iter()
            .zip(&self.sums)
            .map(|(name, sum)| (name.clone(), sum.iter().map(|v| v / n).collect()))
            .collect();
        PhaseAverage::new(self.count, layers)
    }
}

/// Running activation sums for the open plus/minus window.
///
/// The plus average is computed when the window flips to minus; the minus
/// average when the minus window closes. Both are normalised by the number of
/// cycles actually accumulated.
#[derive(Debug, Clone)]
pub struct PhaseAccumulator {
    layers: Vec<LayerId>,
    plus: RunningSum,
    minus: RunningSum,
    plus_average: Option<PhaseAverage>,
    scratch: Vec<f32>,
}

impl PhaseAccumulator {
    pub fn new(layers: Vec<LayerId>) -> Self {
        let n = layers.len();
        Self {
            layers,
            plus: RunningSum {
                count: 0,
                sums: vec![Vec::new(); n],
            },
            minus: RunningSum {
                count: 0,
                sums: vec![Vec::new(); n],
            },
            plus_average: None,
            scratch: Vec::new(),
        }
    }

    pub fn plus_count(&self) -> u32 {
        self.plus.count
    }

    pub fn minus_count(&self) -> u32 {
        self.minus.count
    }

    pub fn is_empty(&self) -> bool {
        self.plus.count == 0 && self.minus.count == 0 && self.plus_average.is_none()
    }

    /// Add the engine's current activations to the plus sums.
    pub fn accumulate_plus<E: Engine + ?Sized>(&mut self, engine: &E) -> Result<(), EngineError> {
        Self::accumulate(engine, &self.layers, &mut self.plus, &mut self.scratch)
    }

    /// Add the engine's current activations to the minus sums.
    pub fn accumulate_minus<E: Engine + ?Sized>(&mut self, engine: &E) -> Result<(), EngineError> {
        Self::accumulate(engine, &self.layers, &mut self.minus, &mut self.scratch)
    }

    fn accumulate<E: Engine + ?Sized>(
        engine: &E,
        layers: &[LayerId],
        run: &mut RunningSum,
        scratch: &mut Vec<f32>,
    ) -> Result<(), EngineError> {
        for (name, sum) in layers.iter().zip(run.sums.iter_mut()) {
            engine.layer_activations(name, scratch)?;
            if sum.is_empty() {
                sum.resize(scratch.len(), 0.0);
            } else if sum.len() != scratch.len() {
                return Err(EngineError::InvalidValue(format!(
                    "layer '{name}' changed size mid-phase ({} -> {})",
                    sum.len(),
                    scratch.len()
                )));
            }
            for (s, a) in sum.iter_mut().zip(scratch.iter()) {
                *s += *a;
            }
        }
        run.count += 1;
        Ok(())
    }

    /// Close the plus window and start an empty minus window.
    pub fn finalize_plus(&mut self) {
        self.plus_average = Some(self.plus.average(&self.layers));
        self.plus.clear();
        self.minus.clear();
    }

    /// Close the minus window and hand back `(plus, minus)` averages.
    ///
    /// Returns `None` if no plus window was finalized first.
    pub fn finalize_minus(&mut self) -> Option<(PhaseAverage, PhaseAverage)> {
        let plus = self.plus_average.take()?;
        let minus = self.minus.average(&self.layers);
        self.minus.clear();
        Some((plus, minus))
    }

    /// Throw away every open sum and any pending plus average.
    pub fn discard(&mut self) {
        self.plus.clear();
        self.minus.clear();
        self.plus_average = None;
    }
}

/// Issues the contrastive update on every sleep-eligible projection.
#[derive(Debug, Clone, Default)]
pub struct ReplayLearningTrigger {
    eligible: Vec<ProjectionId>,
}

impl ReplayLearningTrigger {
    /// `eligible` is de-duplicated; first occurrence order is kept.
    pub fn new(eligible: &[ProjectionId]) -> Self {
        let mut out: Vec<ProjectionId> = Vec::with_capacity(eligible.len());
        for p in eligible {
            if !out.contains(p) {
                out.push(p.clone());
            }
        }
        Self { eligible: out }
    }

    pub fn eligible(&self) -> &[ProjectionId] {
        &self.eligible
    }

    /// Layers touched by eligible projections (sorted, unique).
    pub fn endpoint_layers(&self) -> Vec<LayerId> {
        let mut layers: Vec<LayerId> = self
            .eligible
            .iter()
            .flat_map(|p| [p.sender.clone(), p.receiver.clone()])
            .collect();
        layers.sort();
        layers.dedup();
        layers
    }

    /// Commit one replay event: reinforce `plus`, push away from `minus`.
    ///
    /// `replay_events` is incremented only once every commit succeeded.
    /// Returns the number of projections updated.
    pub fn fire<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        plus: &PhaseAverage,
        minus: &PhaseAverage,
        replay_events: &mut u32,
    ) -> Result<usize, EngineError> {
        for projection in &self.eligible {
            engine.commit_contrastive_update(projection, plus, minus)?;
        }
        *replay_events += 1;
        debug!(
            event = *replay_events,
            plus_cycles = plus.cycles(),
            minus_cycles = minus.cycles(),
            projections = self.eligible.len(),
            "replay update committed"
        );
        Ok(self.eligible.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{EngineCall, ScriptedEngine};

    #[test]
    fn averages_are_normalised_by_cycle_count() {
        let mut engine = ScriptedEngine::builder()
            .layer("A", 3)
            .stability(vec![0.2, 0.4, 0.6, 0.8])
            .build();
        let mut acc = PhaseAccumulator::new(vec!["A".to_string()]);

        for _ in 0..2 {
            engine.step().unwrap();
            acc.accumulate_plus(&engine).unwrap();
        }
        assert_eq!(acc.plus_count(), 2);
        acc.finalize_plus();

        for _ in 0..2 {
            engine.step().unwrap();
            acc.accumulate_minus(&engine).unwrap();
        }
        let (plus, minus) = acc.finalize_minus().unwrap();
        assert_eq!(plus.cycles(), 2);
        assert_eq!(minus.cycles(), 2);
        let p = plus.layer("A").unwrap();
        let m = minus.layer("A").unwrap();
        assert_eq!(p.len(), 3);
        assert!((p[0] - 0.3).abs() < 1e-6);
        assert!((m[0] - 0.7).abs() < 1e-6);
        assert!(acc.is_empty());
    }

    #[test]
    fn finalize_minus_without_plus_yields_nothing() {
        let mut acc = PhaseAccumulator::new(vec!["A".to_string()]);
        assert!(acc.finalize_minus().is_none());
    }

    #[test]
    fn discard_clears_pending_plus() {
        let engine = ScriptedEngine::builder().layer("A", 2).build();
        let mut acc = PhaseAccumulator::new(vec!["A".to_string()]);
        acc.accumulate_plus(&engine).unwrap();
        acc.finalize_plus();
        acc.discard();
        assert!(acc.is_empty());
        assert!(acc.finalize_minus().is_none());
    }

    #[test]
    fn fire_updates_only_eligible_projections() {
        let mut engine = ScriptedEngine::builder()
            .layer("CTX", 2)
            .layer("F1", 2)
            .layer("DG", 2)
            .projection("CTX", "F1")
            .projection("F1", "DG")
            .build();
        let eligible = vec![
            ProjectionId::new("CTX", "F1"),
            ProjectionId::new("CTX", "F1"),
        ];
        let trigger = ReplayLearningTrigger::new(&eligible);
        assert_eq!(trigger.eligible().len(), 1);
        assert_eq!(trigger.endpoint_layers(), vec!["CTX".to_string(), "F1".to_string()]);

        let mut events = 0;
        let n = trigger
            .fire(
                &mut engine,
                &PhaseAverage::default(),
                &PhaseAverage::default(),
                &mut events,
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events, 1);

        let commits: Vec<_> = engine
            .calls()
            .iter()
            .filter_map(|c| match c {
                EngineCall::ContrastiveUpdate { projection, .. } => Some(projection.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commits, vec![ProjectionId::new("CTX", "F1")]);
    }

    #[test]
    fn failed_commit_does_not_count() {
        let mut engine = ScriptedEngine::builder().layer("A", 1).build();
        let trigger = ReplayLearningTrigger::new(&[ProjectionId::new("A", "Missing")]);
        let mut events = 0;
        assert!(trigger
            .fire(
                &mut engine,
                &PhaseAverage::default(),
                &PhaseAverage::default(),
                &mut events
            )
            .is_err());
        assert_eq!(events, 0);
    }
}
