use thiserror::Error;

use crate::engine::{EngineError, LayerId, ProjectionId};

/// Invalid configuration. Always raised before a bout touches the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("plus threshold ({plus}) must be greater than minus threshold ({minus})")]
    ThresholdOrder { plus: f64, minus: f64 },
    #[error("threshold '{name}' must be finite, got {value}")]
    NonFiniteThreshold { name: &'static str, value: f64 },
    #[error("unknown sleep stage '{0}' (expected default, SWS or REM)")]
    UnknownStage(String),
    #[error("debounce length must be at least 1")]
    DebounceTooShort,
    #[error("oscillation period must be at least 1 cycle")]
    OscillationPeriod,
    #[error("no oscillation amplitude configured for group '{0}'")]
    MissingAmplitude(String),
    #[error("oscillation amplitude for group '{group}' must be finite, got {value}")]
    NonFiniteAmplitude { group: String, value: f32 },
    #[error("depression rate '{name}' must be finite and non-negative, got {value}")]
    DepressionRate { name: &'static str, value: f32 },
    #[error("learning rate for '{projection}' must be finite and non-negative, got {value}")]
    LearningRate { projection: ProjectionId, value: f32 },
    #[error("initial noise must be finite and non-negative, got {0}")]
    InitNoise(f32),
    #[error("stability layer set for this stage is empty")]
    EmptyStabilitySet,
    #[error("configuration names unknown layer '{0}'")]
    UnknownLayer(LayerId),
    #[error("configuration names unknown projection '{0}'")]
    UnknownProjection(ProjectionId),
    #[error("reignite period must be at least 1 cycle")]
    ReignitePeriod,
    #[error("schedule has no blocks")]
    EmptySchedule,
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Everything that can end a sleep bout early.
#[derive(Debug, Error)]
pub enum SleepError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A collaborator call failed mid-bout. Sleep-mode state was restored
    /// before this was returned; `replay_events` counts the events committed
    /// before the failure.
    #[error("engine unavailable during {operation} (after {replay_events} replay events): {source}")]
    EngineUnavailable {
        operation: &'static str,
        replay_events: u32,
        #[source]
        source: EngineError,
    },

    #[error("synaptic depression is already installed")]
    DepressionAlreadyInstalled,
}

impl SleepError {
    /// Replay events committed before the bout failed (0 for setup errors).
    pub fn replay_events(&self) -> u32 {
        match self {
            SleepError::EngineUnavailable { replay_events, .. } => *replay_events,
            _ => 0,
        }
    }

    pub(crate) fn engine(operation: &'static str, source: EngineError) -> Self {
        SleepError::EngineUnavailable {
            operation,
            replay_events: 0,
            source,
        }
    }

    pub(crate) fn with_replay_events(self, count: u32) -> Self {
        match self {
            SleepError::EngineUnavailable {
                operation, source, ..
            } => SleepError::EngineUnavailable {
                operation,
                replay_events: count,
                source,
            },
            other => other,
        }
    }
}
