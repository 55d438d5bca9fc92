//! Synaptic depression lifecycle.
//!
//! During sleep the engine weakens recently active synapses and lets them
//! recover over time, which keeps the network from settling into one
//! attractor forever. This controller only owns the on/off lifecycle and the
//! two rates; the per-synapse bookkeeping is the engine's job.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Engine;
use crate::error::{ConfigError, SleepError};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct DepressionParameters {
    /// Depression gained per unit of recent pre/post activity.
    pub increase_rate: f32,
    /// Per-cycle recovery toward the nominal weight.
    pub recovery_rate: f32,
}

impl Default for DepressionParameters {
    fn default() -> Self {
        Self {
            increase_rate: 0.00035,
            recovery_rate: 0.00025,
        }
    }
}

impl DepressionParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("increaseRate", self.increase_rate),
            ("recoveryRate", self.recovery_rate),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::DepressionRate { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SynapticDepressionController {
    params: DepressionParameters,
    installed: bool,
}

impl SynapticDepressionController {
    pub fn new(params: DepressionParameters) -> Self {
        Self {
            params,
            installed: false,
        }
    }

    pub fn params(&self) -> DepressionParameters {
        self.params
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn install<E: Engine + ?Sized>(&mut self, engine: &mut E) -> Result<(), SleepError> {
        if self.installed {
            return Err(SleepError::DepressionAlreadyInstalled);
        }
        engine
            .install_depression(self.params)
            .map_err(|e| SleepError::engine("install_depression", e))?;
        self.installed = true;
        debug!(
            increase = self.params.increase_rate,
            recovery = self.params.recovery_rate,
            "synaptic depression installed"
        );
        Ok(())
    }

    /// Restore nominal weights. A no-op when nothing is installed.
    pub fn remove<E: Engine + ?Sized>(&mut self, engine: &mut E) -> Result<(), SleepError> {
        if !self.installed {
            return Ok(());
        }
        // Cleared before the call: removal is attempted at most once per install.
        self.installed = false;
        engine
            .remove_depression()
            .map_err(|e| SleepError::engine("remove_depression", e))?;
        debug!("synaptic depression removed");
        Ok(())
    }
}
