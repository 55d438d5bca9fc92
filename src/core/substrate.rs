//! A small rate-coded reference network implementing [`Engine`].
//!
//! Layers of leaky rate units are driven by dense projections and a per-layer
//! pooled inhibition. It is meant for exercising the sleep controller end to
//! end, not for modelling anything faithfully.

use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::depression::DepressionParameters;
use crate::engine::{Engine, EngineError, LayerId, ProjectionId};
use crate::prng::Prng;
use crate::replay::PhaseAverage;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LayerSpec {
    pub name: LayerId,
    pub size: usize,
    /// Pooled inhibition conductance.
    #[cfg_attr(feature = "serde", serde(default = "default_inhibition"))]
    pub inhibition: f32,
    /// Tonic external input per unit while external input is enabled.
    #[cfg_attr(feature = "serde", serde(default))]
    pub input: Vec<f32>,
}

#[cfg(feature = "serde")]
fn default_inhibition() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ProjectionSpec {
    pub sender: LayerId,
    pub receiver: LayerId,
    /// Initial weights are uniform in `[0, weight_scale)`.
    pub weight_scale: f32,
    pub learning_rate: f32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct NetworkConfig {
    pub layers: Vec<LayerSpec>,
    pub projections: Vec<ProjectionSpec>,

    // Integration step toward the target rate (0..1].
    pub dt: f32,
    // Slope of the rate function.
    pub gain: f32,
    // Uniform per-unit drive noise amplitude.
    pub noise: f32,
    pub seed: u64,
}

impl Default for NetworkConfig {
    /// A small hippocampal loop: Input -> DG -> CA3 -> CA1 -> CTX -> Output,
    /// with Input -> CTX and CTX -> CA3 shortcuts.
    fn default() -> Self {
        let layer = |name: &str, size: usize, inhibition: f32| LayerSpec {
            name: name.to_string(),
            size,
            inhibition,
            input: Vec::new(),
        };
        let proj = |s: &str, r: &str, scale: f32| ProjectionSpec {
            sender: s.to_string(),
            receiver: r.to_string(),
            weight_scale: scale,
            learning_rate: 0.04,
        };
        let mut input = layer("Input", 16, 0.8);
        input.input = (0..16).map(|i| if i % 4 == 0 { 1.0 } else { 0.0 }).collect();
        Self {
            layers: vec![
                input,
                layer("DG", 24, 2.0),
                layer("CA3", 16, 1.6),
                layer("CA1", 16, 1.4),
                layer("CTX", 16, 1.2),
                layer("Output", 8, 1.0),
            ],
            projections: vec![
                proj("Input", "DG", 0.6),
                proj("DG", "CA3", 0.8),
                proj("CA3", "CA3", 0.3),
                proj("CA3", "CA1", 0.6),
                proj("CA1", "CTX", 0.6),
                proj("Input", "CTX", 0.5),
                proj("CTX", "CA3", 0.3),
                proj("CTX", "Output", 0.6),
            ],
            dt: 0.3,
            gain: 4.0,
            noise: 0.002,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    name: LayerId,
    inhibition: f32,
    active: bool,
    input: Vec<f32>,
    acts: Vec<f32>,
    prev: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Projection {
    id: ProjectionId,
    sender: usize,
    receiver: usize,
    // Row-major [receiver unit][sender unit].
    weights: Vec<f32>,
    depression: Vec<f32>,
    learning: bool,
    learning_rate: f32,
}

impl Projection {
    fn effective(&self, k: usize) -> f32 {
        self.weights[k] * (1.0 - self.depression[k])
    }
}

pub struct Network {
    cfg: NetworkConfig,
    layers: Vec<Layer>,
    index: HashMap<LayerId, usize>,
    projections: Vec<Projection>,
    rng: Prng,
    external_input: bool,
    depression: Option<DepressionParameters>,
    age_steps: u64,
}

impl Network {
    pub fn new(cfg: NetworkConfig) -> Result<Self, EngineError> {
        let mut rng = Prng::new(cfg.seed);
        let mut index = HashMap::new();
        let mut layers = Vec::with_capacity(cfg.layers.len());
        for spec in &cfg.layers {
            if spec.size == 0 {
                return Err(EngineError::InvalidValue(format!(
                    "layer '{}' has no units",
                    spec.name
                )));
            }
            if !spec.input.is_empty() && spec.input.len() != spec.size {
                return Err(EngineError::InvalidValue(format!(
                    "input pattern for '{}' has {} values, layer has {} units",
                    spec.name,
                    spec.input.len(),
                    spec.size
                )));
            }
            if index.insert(spec.name.clone(), layers.len()).is_some() {
                return Err(EngineError::InvalidValue(format!(
                    "duplicate layer '{}'",
                    spec.name
                )));
            }
            let input = if spec.input.is_empty() {
                vec![0.0; spec.size]
            } else {
                spec.input.clone()
            };
            layers.push(Layer {
                name: spec.name.clone(),
                inhibition: spec.inhibition,
                active: true,
                input,
                acts: vec![0.0; spec.size],
                prev: vec![0.0; spec.size],
            });
        }

        let mut projections: Vec<Projection> = Vec::with_capacity(cfg.projections.len());
        for spec in &cfg.projections {
            let sender = *index
                .get(&spec.sender)
                .ok_or_else(|| EngineError::UnknownLayer(spec.sender.clone()))?;
            let receiver = *index
                .get(&spec.receiver)
                .ok_or_else(|| EngineError::UnknownLayer(spec.receiver.clone()))?;
            let id = ProjectionId::new(spec.sender.clone(), spec.receiver.clone());
            if projections.iter().any(|p| p.id == id) {
                return Err(EngineError::InvalidValue(format!("duplicate projection '{id}'")));
            }
            let n = layers[sender].acts.len() * layers[receiver].acts.len();
            let weights = (0..n)
                .map(|_| rng.gen_range_f32(0.0, spec.weight_scale.max(0.0)))
                .collect();
            projections.push(Projection {
                id,
                sender,
                receiver,
                weights,
                depression: vec![0.0; n],
                learning: true,
                learning_rate: spec.learning_rate,
            });
        }

        Ok(Self {
            cfg,
            layers,
            index,
            projections,
            rng,
            external_input: true,
            depression: None,
            age_steps: 0,
        })
    }

    pub fn age_steps(&self) -> u64 {
        self.age_steps
    }

    pub fn external_input_enabled(&self) -> bool {
        self.external_input
    }

    pub fn depression_params(&self) -> Option<DepressionParameters> {
        self.depression
    }

    /// Nominal weights of a projection, row-major by receiver unit.
    pub fn weights(&self, projection: &ProjectionId) -> Option<&[f32]> {
        self.projections
            .iter()
            .find(|p| &p.id == projection)
            .map(|p| p.weights.as_slice())
    }

    /// Mean depression over every synapse of every projection.
    pub fn mean_depression(&self) -> f32 {
        let (sum, n) = self
            .projections
            .iter()
            .fold((0.0f32, 0usize), |(s, n), p| {
                (s + p.depression.iter().sum::<f32>(), n + p.depression.len())
            });
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }

    fn layer_idx(&self, name: &str) -> Result<usize, EngineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownLayer(name.to_string()))
    }

    fn projection_idx(&self, id: &ProjectionId) -> Result<usize, EngineError> {
        self.projections
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| EngineError::UnknownProjection(id.clone()))
    }

    fn update_depression(&mut self, params: DepressionParameters) {
        for p in &mut self.projections {
            let pre = &self.layers[p.sender].acts;
            let post = &self.layers[p.receiver].acts;
            let ns = pre.len();
            for (r, &y) in post.iter().enumerate() {
                for (s, &x) in pre.iter().enumerate() {
                    let d = &mut p.depression[r * ns + s];
                    *d += params.increase_rate * x * y * (1.0 - *d);
                    *d -= params.recovery_rate * *d;
                    *d = d.clamp(0.0, 1.0);
                }
            }
        }
    }
}

impl Engine for Network {
    fn layers(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn projections(&self) -> Vec<ProjectionId> {
        self.projections.iter().map(|p| p.id.clone()).collect()
    }

    fn step(&mut self) -> Result<(), EngineError> {
        self.age_steps = self.age_steps.wrapping_add(1);
        for l in &mut self.layers {
            l.prev.copy_from_slice(&l.acts);
        }

        let mut nets: Vec<Vec<f32>> = self.layers.iter().map(|l| vec![0.0; l.acts.len()]).collect();
        for p in &self.projections {
            let sender = &self.layers[p.sender];
            if !sender.active {
                continue;
            }
            let ns = sender.prev.len();
            for (r, net) in nets[p.receiver].iter_mut().enumerate() {
                let row = r * ns;
                *net += sender
                    .prev
                    .iter()
                    .enumerate()
                    .map(|(s, &x)| p.effective(row + s) * x)
                    .sum::<f32>();
            }
        }

        let (dt, gain, noise) = (self.cfg.dt, self.cfg.gain, self.cfg.noise);
        for (l, net) in self.layers.iter_mut().zip(nets.iter_mut()) {
            if !l.active {
                l.acts.iter_mut().for_each(|a| *a = 0.0);
                continue;
            }
            if self.external_input {
                for (n, i) in net.iter_mut().zip(&l.input) {
                    *n += *i;
                }
            }
            let pooled = l.prev.iter().sum::<f32>() / l.prev.len() as f32;
            for (a, n) in l.acts.iter_mut().zip(net.iter()) {
                let drive = n - l.inhibition * pooled + self.rng.gen_range_f32(-noise, noise);
                let x = (gain * drive).max(0.0);
                let target = x / (x + 1.0);
                *a += dt * (target - *a);
            }
        }

        if let Some(params) = self.depression {
            self.update_depression(params);
        }
        Ok(())
    }

    fn layer_similarity(&self, layers: &[LayerId]) -> Result<HashMap<LayerId, f64>, EngineError> {
        let mut out = HashMap::with_capacity(layers.len());
        for name in layers {
            let l = &self.layers[self.layer_idx(name)?];
            out.insert(name.clone(), cosine(&l.acts, &l.prev));
        }
        Ok(out)
    }

    fn layer_activations(&self, layer: &str, out: &mut Vec<f32>) -> Result<(), EngineError> {
        let l = &self.layers[self.layer_idx(layer)?];
        out.clear();
        out.extend_from_slice(&l.acts);
        Ok(())
    }

    fn inhibition(&self, layer: &str) -> Result<f32, EngineError> {
        Ok(self.layers[self.layer_idx(layer)?].inhibition)
    }

    fn set_inhibition(&mut self, layer: &str, conductance: f32) -> Result<(), EngineError> {
        if !conductance.is_finite() {
            return Err(EngineError::InvalidValue(format!(
                "inhibition for '{layer}' must be finite, got {conductance}"
            )));
        }
        let i = self.layer_idx(layer)?;
        self.layers[i].inhibition = conductance;
        Ok(())
    }

    fn install_depression(&mut self, params: DepressionParameters) -> Result<(), EngineError> {
        self.depression = Some(params);
        Ok(())
    }

    fn remove_depression(&mut self) -> Result<(), EngineError> {
        self.depression = None;
        for p in &mut self.projections {
            p.depression.iter_mut().for_each(|d| *d = 0.0);
        }
        Ok(())
    }

    fn commit_contrastive_update(
        &mut self,
        projection: &ProjectionId,
        plus: &PhaseAverage,
        minus: &PhaseAverage,
    ) -> Result<(), EngineError> {
        let pi = self.projection_idx(projection)?;
        let p = &mut self.projections[pi];
        if !p.learning {
            return Ok(());
        }
        let missing = |layer: &str| {
            EngineError::InvalidValue(format!("phase average has no activity for '{layer}'"))
        };
        let xp = plus.layer(&projection.sender).ok_or_else(|| missing(&projection.sender))?;
        let yp = plus
            .layer(&projection.receiver)
            .ok_or_else(|| missing(&projection.receiver))?;
        let xm = minus.layer(&projection.sender).ok_or_else(|| missing(&projection.sender))?;
        let ym = minus
            .layer(&projection.receiver)
            .ok_or_else(|| missing(&projection.receiver))?;
        let ns = xp.len();
        if xm.len() != ns || yp.len() != ym.len() || ns * yp.len() != p.weights.len() {
            return Err(EngineError::InvalidValue(format!(
                "phase average shape does not match projection '{projection}'"
            )));
        }

        let lr = p.learning_rate;
        for r in 0..yp.len() {
            for s in 0..ns {
                let dw = lr * (xp[s] * yp[r] - xm[s] * ym[r]);
                let w = &mut p.weights[r * ns + s];
                *w = (*w + dw).clamp(0.0, 1.0);
            }
        }
        Ok(())
    }

    fn randomize_activation(
        &mut self,
        layer: &str,
        noise: &mut dyn FnMut() -> f32,
    ) -> Result<(), EngineError> {
        let i = self.layer_idx(layer)?;
        for a in &mut self.layers[i].acts {
            *a = noise();
        }
        Ok(())
    }

    fn learning_enabled(&self, projection: &ProjectionId) -> Result<bool, EngineError> {
        Ok(self.projections[self.projection_idx(projection)?].learning)
    }

    fn set_learning_enabled(
        &mut self,
        projection: &ProjectionId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let i = self.projection_idx(projection)?;
        self.projections[i].learning = enabled;
        Ok(())
    }

    fn learning_rate(&self, projection: &ProjectionId) -> Result<f32, EngineError> {
        Ok(self.projections[self.projection_idx(projection)?].learning_rate)
    }

    fn set_learning_rate(&mut self, projection: &ProjectionId, rate: f32) -> Result<(), EngineError> {
        let i = self.projection_idx(projection)?;
        self.projections[i].learning_rate = rate;
        Ok(())
    }

    fn layer_active(&self, layer: &str) -> Result<bool, EngineError> {
        Ok(self.layers[self.layer_idx(layer)?].active)
    }

    fn set_layer_active(&mut self, layer: &str, active: bool) -> Result<(), EngineError> {
        let i = self.layer_idx(layer)?;
        self.layers[i].active = active;
        Ok(())
    }

    fn disable_external_input(&mut self) -> Result<(), EngineError> {
        self.external_input = false;
        Ok(())
    }

    fn enable_external_input(&mut self) -> Result<(), EngineError> {
        self.external_input = true;
        Ok(())
    }
}

/// Cosine similarity; 0 when either vector is all zeros.
fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let (mut ab, mut aa, mut bb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    if aa == 0.0 || bb == 0.0 {
        return 0.0;
    }
    ab / (aa.sqrt() * bb.sqrt())
}
