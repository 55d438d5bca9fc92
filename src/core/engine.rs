//! The network-engine seam.
//!
//! Everything the sleep controller needs from a neural simulator goes through
//! [`Engine`]. Unit dynamics, the learning-rule arithmetic and the
//! depression bookkeeping all live behind it; the controller only sequences
//! calls and owns the phase logic.

use core::fmt;
use core::str::FromStr;

use hashbrown::HashMap;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::depression::DepressionParameters;
use crate::replay::PhaseAverage;

/// Layers are addressed by name, the same names used in configuration files.
pub type LayerId = String;

/// A directed projection between two layers, written `Sender->Receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct ProjectionId {
    pub sender: LayerId,
    pub receiver: LayerId,
}

impl ProjectionId {
    pub fn new(sender: impl Into<LayerId>, receiver: impl Into<LayerId>) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
        }
    }
}

impl fmt::Display for ProjectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender, self.receiver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid projection '{0}': expected 'Sender->Receiver'")]
pub struct ParseProjectionError(pub String);

impl FromStr for ProjectionId {
    type Err = ParseProjectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sender, receiver) = s
            .split_once("->")
            .ok_or_else(|| ParseProjectionError(s.to_string()))?;
        let (sender, receiver) = (sender.trim(), receiver.trim());
        if sender.is_empty() || receiver.is_empty() {
            return Err(ParseProjectionError(s.to_string()));
        }
        Ok(Self::new(sender, receiver))
    }
}

impl TryFrom<String> for ProjectionId {
    type Error = ParseProjectionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProjectionId> for String {
    fn from(p: ProjectionId) -> Self {
        p.to_string()
    }
}

/// Failure reported by an engine implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("unknown layer '{0}'")]
    UnknownLayer(LayerId),
    #[error("unknown projection '{0}'")]
    UnknownProjection(ProjectionId),
    #[error("invalid value from engine: {0}")]
    InvalidValue(String),
    #[error("engine failure: {0}")]
    Failed(String),
}

/// Operations a simulator must provide to be driven through a sleep bout.
///
/// Calls are synchronous; the controller never issues two at once.
pub trait Engine {
    /// Every layer the engine knows about, in a stable order.
    fn layers(&self) -> Vec<LayerId>;

    /// Every projection the engine knows about, in a stable order.
    fn projections(&self) -> Vec<ProjectionId>;

    /// Advance the dynamics by one discrete cycle.
    fn step(&mut self) -> Result<(), EngineError>;

    /// Temporal similarity (activation now vs previous cycle) per requested layer.
    fn layer_similarity(&self, layers: &[LayerId]) -> Result<HashMap<LayerId, f64>, EngineError>;

    /// Current activations of a layer's units, written into `out` (cleared first).
    fn layer_activations(&self, layer: &str, out: &mut Vec<f32>) -> Result<(), EngineError>;

    /// Current layer-level inhibition conductance.
    fn inhibition(&self, layer: &str) -> Result<f32, EngineError>;

    /// Overwrite a layer's inhibition conductance.
    fn set_inhibition(&mut self, layer: &str, conductance: f32) -> Result<(), EngineError>;

    fn install_depression(&mut self, params: DepressionParameters) -> Result<(), EngineError>;

    /// Drop depression and restore nominal effective weights.
    fn remove_depression(&mut self) -> Result<(), EngineError>;

    /// Contrastive weight change: toward `plus`, away from `minus`.
    fn commit_contrastive_update(
        &mut self,
        projection: &ProjectionId,
        plus: &PhaseAverage,
        minus: &PhaseAverage,
    ) -> Result<(), EngineError>;

    /// Set each non-excluded unit of `layer` to a value drawn from `noise`.
    fn randomize_activation(
        &mut self,
        layer: &str,
        noise: &mut dyn FnMut() -> f32,
    ) -> Result<(), EngineError>;

    fn learning_enabled(&self, projection: &ProjectionId) -> Result<bool, EngineError>;
    fn set_learning_enabled(
        &mut self,
        projection: &ProjectionId,
        enabled: bool,
    ) -> Result<(), EngineError>;

    fn learning_rate(&self, projection: &ProjectionId) -> Result<f32, EngineError>;
    fn set_learning_rate(&mut self, projection: &ProjectionId, rate: f32)
        -> Result<(), EngineError>;

    fn layer_active(&self, layer: &str) -> Result<bool, EngineError>;

    /// Lesioning toggle: an inactive layer contributes nothing to computation.
    fn set_layer_active(&mut self, layer: &str, active: bool) -> Result<(), EngineError>;

    fn disable_external_input(&mut self) -> Result<(), EngineError>;
    fn enable_external_input(&mut self) -> Result<(), EngineError>;
}
