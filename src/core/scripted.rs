//! A scripted [`Engine`] for tests, benches and dry runs.
//!
//! Similarity traces are replayed one value per step (the last value repeats
//! once a trace runs out) and every mutating call is recorded so callers can
//! assert on exact call sequences. Faults can be injected per operation.

use hashbrown::HashMap;

use crate::depression::DepressionParameters;
use crate::engine::{Engine, EngineError, LayerId, ProjectionId};
use crate::replay::PhaseAverage;

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Step,
    SetInhibition { layer: LayerId, conductance: f32 },
    InstallDepression(DepressionParameters),
    RemoveDepression,
    ContrastiveUpdate {
        projection: ProjectionId,
        plus_cycles: u32,
        minus_cycles: u32,
    },
    RandomizeActivation { layer: LayerId },
    SetLearningEnabled { projection: ProjectionId, enabled: bool },
    SetLearningRate { projection: ProjectionId, rate: f32 },
    SetLayerActive { layer: LayerId, active: bool },
    DisableExternalInput,
    EnableExternalInput,
}

#[derive(Debug, Clone)]
struct Fault {
    op: &'static str,
    at_step: u64,
}

#[derive(Debug, Clone)]
struct ScriptedLayer {
    name: LayerId,
    size: usize,
    inhibition: f32,
    active: bool,
    trace: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
struct ScriptedProjection {
    id: ProjectionId,
    learning: bool,
    rate: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedEngineBuilder {
    layers: Vec<ScriptedLayer>,
    projections: Vec<ScriptedProjection>,
    stability: Vec<f64>,
    activation: Option<f32>,
    faults: Vec<Fault>,
}

impl ScriptedEngineBuilder {
    /// Add a layer of `size` units with inhibition 1.0.
    pub fn layer(mut self, name: &str, size: usize) -> Self {
        self.layers.push(ScriptedLayer {
            name: name.to_string(),
            size,
            inhibition: 1.0,
            active: true,
            trace: None,
        });
        self
    }

    /// Similarity trace for one layer, overriding [`Self::stability`].
    pub fn layer_similarity(mut self, name: &str, trace: Vec<f64>) -> Self {
        if let Some(l) = self.layers.iter_mut().find(|l| l.name == name) {
            l.trace = Some(trace);
        }
        self
    }

    /// Similarity trace shared by every layer without its own.
    pub fn stability(mut self, trace: Vec<f64>) -> Self {
        self.stability = trace;
        self
    }

    /// Constant unit activation. By default activations follow the layer's
    /// current similarity value.
    pub fn activation(mut self, value: f32) -> Self {
        self.activation = Some(value);
        self
    }

    pub fn inhibition(mut self, name: &str, conductance: f32) -> Self {
        if let Some(l) = self.layers.iter_mut().find(|l| l.name == name) {
            l.inhibition = conductance;
        }
        self
    }

    /// Add a projection with learning enabled and rate 0.04.
    pub fn projection(mut self, sender: &str, receiver: &str) -> Self {
        self.projections.push(ScriptedProjection {
            id: ProjectionId::new(sender, receiver),
            learning: true,
            rate: 0.04,
        });
        self
    }

    /// Make `op` (an [`Engine`] method name) fail while the engine has taken
    /// exactly `at_step` steps.
    pub fn fail_at(mut self, op: &'static str, at_step: u64) -> Self {
        self.faults.push(Fault { op, at_step });
        self
    }

    pub fn build(self) -> ScriptedEngine {
        ScriptedEngine {
            layers: self.layers,
            projections: self.projections,
            stability: if self.stability.is_empty() {
                vec![0.0]
            } else {
                self.stability
            },
            activation: self.activation,
            faults: self.faults,
            steps: 0,
            external_input: true,
            depression: None,
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    layers: Vec<ScriptedLayer>,
    projections: Vec<ScriptedProjection>,
    stability: Vec<f64>,
    activation: Option<f32>,
    faults: Vec<Fault>,
    steps: u64,
    external_input: bool,
    depression: Option<DepressionParameters>,
    calls: Vec<EngineCall>,
}

impl ScriptedEngine {
    pub fn builder() -> ScriptedEngineBuilder {
        ScriptedEngineBuilder::default()
    }

    /// Every mutating call so far, in order.
    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn depression(&self) -> Option<DepressionParameters> {
        self.depression
    }

    pub fn external_input_enabled(&self) -> bool {
        self.external_input
    }

    pub fn replay_commits(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, EngineCall::ContrastiveUpdate { .. }))
            .count()
    }

    fn check(&self, op: &'static str) -> Result<(), EngineError> {
        if self
            .faults
            .iter()
            .any(|f| f.op == op && f.at_step == self.steps)
        {
            return Err(EngineError::Failed(format!(
                "scripted fault in {op} at step {}",
                self.steps
            )));
        }
        Ok(())
    }

    fn layer(&self, name: &str) -> Result<&ScriptedLayer, EngineError> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| EngineError::UnknownLayer(name.to_string()))
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut ScriptedLayer, EngineError> {
        self.layers
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| EngineError::UnknownLayer(name.to_string()))
    }

    fn projection_mut(&mut self, id: &ProjectionId) -> Result<&mut ScriptedProjection, EngineError> {
        self.projections
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| EngineError::UnknownProjection(id.clone()))
    }

    fn projection(&self, id: &ProjectionId) -> Result<&ScriptedProjection, EngineError> {
        self.projections
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| EngineError::UnknownProjection(id.clone()))
    }

    fn current(&self, layer: &ScriptedLayer) -> f64 {
        let trace = layer.trace.as_deref().unwrap_or(&self.stability);
        let idx = (self.steps.saturating_sub(1) as usize).min(trace.len().saturating_sub(1));
        trace.get(idx).copied().unwrap_or(0.0)
    }
}

impl Engine for ScriptedEngine {
    fn layers(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn projections(&self) -> Vec<ProjectionId> {
        self.projections.iter().map(|p| p.id.clone()).collect()
    }

    fn step(&mut self) -> Result<(), EngineError> {
        self.check("step")?;
        self.steps += 1;
        self.calls.push(EngineCall::Step);
        Ok(())
    }

    fn layer_similarity(&self, layers: &[LayerId]) -> Result<HashMap<LayerId, f64>, EngineError> {
        self.check("layer_similarity")?;
        let mut out = HashMap::with_capacity(layers.len());
        for name in layers {
            let layer = self.layer(name)?;
            out.insert(name.clone(), self.current(layer));
        }
        Ok(out)
    }

    fn layer_activations(&self, layer: &str, out: &mut Vec<f32>) -> Result<(), EngineError> {
        self.check("layer_activations")?;
        let l = self.layer(layer)?;
        let value = match self.activation {
            Some(v) => v,
            None => {
                let v = self.current(l) as f32;
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            }
        };
        out.clear();
        out.resize(l.size, value);
        Ok(())
    }

    fn inhibition(&self, layer: &str) -> Result<f32, EngineError> {
        self.check("inhibition")?;
        Ok(self.layer(layer)?.inhibition)
    }

    fn set_inhibition(&mut self, layer: &str, conductance: f32) -> Result<(), EngineError> {
        self.check("set_inhibition")?;
        self.layer_mut(layer)?.inhibition = conductance;
        self.calls.push(EngineCall::SetInhibition {
            layer: layer.to_string(),
            conductance,
        });
        Ok(())
    }

    fn install_depression(&mut self, params: DepressionParameters) -> Result<(), EngineError> {
        self.check("install_depression")?;
        self.depression = Some(params);
        self.calls.push(EngineCall::InstallDepression(params));
        Ok(())
    }

    fn remove_depression(&mut self) -> Result<(), EngineError> {
        self.check("remove_depression")?;
        self.depression = None;
        self.calls.push(EngineCall::RemoveDepression);
        Ok(())
    }

    fn commit_contrastive_update(
        &mut self,
        projection: &ProjectionId,
        plus: &PhaseAverage,
        minus: &PhaseAverage,
    ) -> Result<(), EngineError> {
        self.check("commit_contrastive_update")?;
        self.projection(projection)?;
        self.calls.push(EngineCall::ContrastiveUpdate {
            projection: projection.clone(),
            plus_cycles: plus.cycles(),
            minus_cycles: minus.cycles(),
        });
        Ok(())
    }

    fn randomize_activation(
        &mut self,
        layer: &str,
        noise: &mut dyn FnMut() -> f32,
    ) -> Result<(), EngineError> {
        self.check("randomize_activation")?;
        let size = self.layer(layer)?.size;
        for _ in 0..size {
            noise();
        }
        self.calls.push(EngineCall::RandomizeActivation {
            layer: layer.to_string(),
        });
        Ok(())
    }

    fn learning_enabled(&self, projection: &ProjectionId) -> Result<bool, EngineError> {
        Ok(self.projection(projection)?.learning)
    }

    fn set_learning_enabled(
        &mut self,
        projection: &ProjectionId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.check("set_learning_enabled")?;
        self.projection_mut(projection)?.learning = enabled;
        self.calls.push(EngineCall::SetLearningEnabled {
            projection: projection.clone(),
            enabled,
        });
        Ok(())
    }

    fn learning_rate(&self, projection: &ProjectionId) -> Result<f32, EngineError> {
        Ok(self.projection(projection)?.rate)
    }

    fn set_learning_rate(&mut self, projection: &ProjectionId, rate: f32) -> Result<(), EngineError> {
        self.check("set_learning_rate")?;
        self.projection_mut(projection)?.rate = rate;
        self.calls.push(EngineCall::SetLearningRate {
            projection: projection.clone(),
            rate,
        });
        Ok(())
    }

    fn layer_active(&self, layer: &str) -> Result<bool, EngineError> {
        Ok(self.layer(layer)?.active)
    }

    fn set_layer_active(&mut self, layer: &str, active: bool) -> Result<(), EngineError> {
        self.check("set_layer_active")?;
        self.layer_mut(layer)?.active = active;
        self.calls.push(EngineCall::SetLayerActive {
            layer: layer.to_string(),
            active,
        });
        Ok(())
    }

    fn disable_external_input(&mut self) -> Result<(), EngineError> {
        self.check("disable_external_input")?;
        self.external_input = false;
        self.calls.push(EngineCall::DisableExternalInput);
        Ok(())
    }

    fn enable_external_input(&mut self) -> Result<(), EngineError> {
        self.check("enable_external_input")?;
        self.external_input = true;
        self.calls.push(EngineCall::EnableExternalInput);
        Ok(())
    }
}
