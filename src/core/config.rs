//! Sleep configuration.
//!
//! [`SleepConfig`] is what users write (JSON, camelCase keys). It is resolved
//! per bout into an immutable [`BoutConfig`] for one stage, which is where all
//! validation happens.

use core::fmt;
use core::str::FromStr;

use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::depression::DepressionParameters;
use crate::engine::{LayerId, ProjectionId};
use crate::error::ConfigError;
use crate::oscillator::InhibitionOscillator;
use crate::phase::PhaseThresholds;

/// Sleep stage. Each stage may carry its own thresholds, stability layer set
/// and lesions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stage {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "default"))]
    Default,
    /// Slow-wave sleep.
    #[cfg_attr(feature = "serde", serde(rename = "SWS"))]
    Sws,
    #[cfg_attr(feature = "serde", serde(rename = "REM"))]
    Rem,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Default => "default",
            Stage::Sws => "SWS",
            Stage::Rem => "REM",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Stage::Default),
            "sws" => Ok(Stage::Sws),
            "rem" => Ok(Stage::Rem),
            _ => Err(ConfigError::UnknownStage(s.to_string())),
        }
    }
}

/// Per-stage overrides of the top-level detector settings.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct StageOverride {
    pub plus_threshold: Option<f64>,
    pub minus_threshold: Option<f64>,
    /// Layers averaged by the stability monitor in this stage.
    pub stability_layers: Option<Vec<LayerId>>,
}

impl StageOverride {
    /// Take every field `other` sets, keep the rest.
    pub fn merge(&mut self, other: StageOverride) {
        if other.plus_threshold.is_some() {
            self.plus_threshold = other.plus_threshold;
        }
        if other.minus_threshold.is_some() {
            self.minus_threshold = other.minus_threshold;
        }
        if other.stability_layers.is_some() {
            self.stability_layers = other.stability_layers;
        }
    }
}

/// Built-in SWS and REM threshold sets.
pub fn default_stages() -> HashMap<Stage, StageOverride> {
    [
        (
            Stage::Sws,
            StageOverride {
                plus_threshold: Some(0.99995),
                minus_threshold: Some(0.99995 - 0.0025),
                stability_layers: None,
            },
        ),
        (
            Stage::Rem,
            StageOverride {
                plus_threshold: Some(0.999995),
                minus_threshold: Some(0.999995 - 0.0025),
                stability_layers: None,
            },
        ),
    ]
    .into_iter()
    .collect()
}

/// Stage entries in a file are layered over [`default_stages`], field by field.
#[cfg(feature = "serde")]
fn merge_stage_defaults<'de, D>(deserializer: D) -> Result<HashMap<Stage, StageOverride>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let parsed = HashMap::<Stage, StageOverride>::deserialize(deserializer)?;
    let mut stages = default_stages();
    for (stage, over) in parsed {
        stages.entry(stage).or_default().merge(over);
    }
    Ok(stages)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct OscillationConfig {
    pub enabled: bool,
    /// Cycles per full oscillation.
    pub period: u32,
    /// Amplitude per layer group.
    pub amplitude: HashMap<String, f32>,
    /// Layer -> group. Layers not listed keep their inhibition untouched.
    pub group_assignment: HashMap<LayerId, String>,
}

impl Default for OscillationConfig {
    fn default() -> Self {
        let amplitude = [("high".to_string(), 0.05), ("low".to_string(), 0.015)]
            .into_iter()
            .collect();
        Self {
            enabled: true,
            period: 50,
            amplitude,
            group_assignment: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct DepressionConfig {
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub params: DepressionParameters,
}

impl Default for DepressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            params: DepressionParameters::default(),
        }
    }
}

/// Re-randomise activity when the network has collapsed.
///
/// After `after_cycle` cycles, whenever stability is at or below `floor` on
/// one of the first `burst` cycles of every `period`, activations are drawn
/// again from the bout RNG.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ReigniteConfig {
    pub after_cycle: u64,
    pub floor: f64,
    pub period: u32,
    pub burst: u32,
}

impl Default for ReigniteConfig {
    fn default() -> Self {
        Self {
            after_cycle: 1000,
            floor: 0.8,
            period: 50,
            burst: 5,
        }
    }
}

impl ReigniteConfig {
    pub fn fires_at(&self, cycle: u64, stability: f64) -> bool {
        cycle > self.after_cycle
            && stability <= self.floor
            && cycle % u64::from(self.period.max(1)) < u64::from(self.burst)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SleepConfig {
    /// Thresholds and stability layers for the `default` stage; other stages
    /// inherit whatever they do not override.
    pub plus_threshold: f64,
    pub minus_threshold: f64,
    pub stability_layers: Option<Vec<LayerId>>,
    #[cfg_attr(feature = "serde", serde(deserialize_with = "merge_stage_defaults"))]
    pub stages: HashMap<Stage, StageOverride>,

    pub debounce_len: u32,
    pub oscillation: OscillationConfig,
    pub depression: DepressionConfig,

    /// Projections that learn during sleep. Every other projection is frozen.
    pub eligible_projections: Vec<ProjectionId>,
    pub lesioned_layers: HashMap<Stage, Vec<LayerId>>,
    pub sleep_learning_rate: HashMap<ProjectionId, f32>,

    /// Scale of the sleep-onset activation noise.
    pub init_noise: f32,
    pub seed: u64,
    /// Summed activation below which a layer reads as unstable. 0 disables.
    pub min_layer_activity: f32,
    pub reignite: Option<ReigniteConfig>,
    pub stop_after_first_replay: bool,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            plus_threshold: 0.9999,
            minus_threshold: 0.9999 - 0.01,
            stability_layers: None,
            stages: default_stages(),
            debounce_len: 5,
            oscillation: OscillationConfig::default(),
            depression: DepressionConfig::default(),
            eligible_projections: Vec::new(),
            lesioned_layers: HashMap::new(),
            sleep_learning_rate: HashMap::new(),
            init_noise: 0.5,
            seed: 1,
            min_layer_activity: 0.0,
            reignite: None,
            stop_after_first_replay: false,
        }
    }
}

#[cfg(feature = "serde")]
impl SleepConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl SleepConfig {
    /// Resolve and validate the settings for one bout of `stage`.
    pub fn resolve(&self, stage: Stage, cycle_budget: u64) -> Result<BoutConfig, ConfigError> {
        let over = self.stages.get(&stage);
        let plus = over
            .and_then(|o| o.plus_threshold)
            .unwrap_or(self.plus_threshold);
        let minus = over
            .and_then(|o| o.minus_threshold)
            .unwrap_or(self.minus_threshold);
        let thresholds = PhaseThresholds::new(plus, minus, self.debounce_len)?;

        let stability_layers = over
            .and_then(|o| o.stability_layers.clone())
            .or_else(|| self.stability_layers.clone());
        if matches!(&stability_layers, Some(l) if l.is_empty()) {
            return Err(ConfigError::EmptyStabilitySet);
        }

        let oscillation = if self.oscillation.enabled {
            let osc = InhibitionOscillator::new(self.oscillation.period, &self.oscillation.amplitude)?;
            for group in self.oscillation.group_assignment.values() {
                if !osc.has_group(group) {
                    return Err(ConfigError::MissingAmplitude(group.clone()));
                }
            }
            Some(BoutOscillation {
                oscillator: osc,
                assignment: self.oscillation.group_assignment.clone(),
            })
        } else {
            None
        };

        let depression = if self.depression.enabled {
            self.depression.params.validate()?;
            Some(self.depression.params)
        } else {
            None
        };

        let mut learning_rates: Vec<(ProjectionId, f32)> = self
            .sleep_learning_rate
            .iter()
            .map(|(p, r)| (p.clone(), *r))
            .collect();
        learning_rates.sort_by(|a, b| a.0.cmp(&b.0));
        for (projection, value) in &learning_rates {
            if !value.is_finite() || *value < 0.0 {
                return Err(ConfigError::LearningRate {
                    projection: projection.clone(),
                    value: *value,
                });
            }
        }

        if !self.init_noise.is_finite() || self.init_noise < 0.0 {
            return Err(ConfigError::InitNoise(self.init_noise));
        }
        if let Some(r) = &self.reignite {
            if r.period == 0 {
                return Err(ConfigError::ReignitePeriod);
            }
        }

        let mut lesioned = self.lesioned_layers.get(&stage).cloned().unwrap_or_default();
        lesioned.sort();
        lesioned.dedup();

        Ok(BoutConfig {
            stage,
            cycle_budget,
            thresholds,
            stability_layers,
            oscillation,
            depression,
            eligible_projections: self.eligible_projections.clone(),
            lesioned_layers: lesioned,
            sleep_learning_rates: learning_rates,
            init_noise: self.init_noise,
            seed: self.seed,
            min_layer_activity: self.min_layer_activity.max(0.0),
            reignite: self.reignite,
            stop_after_first_replay: self.stop_after_first_replay,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BoutOscillation {
    pub oscillator: InhibitionOscillator,
    pub assignment: HashMap<LayerId, String>,
}

/// Immutable per-bout settings for a single stage.
#[derive(Debug, Clone)]
pub struct BoutConfig {
    pub stage: Stage,
    pub cycle_budget: u64,
    pub thresholds: PhaseThresholds,
    /// `None` means every active (non-lesioned) layer.
    pub stability_layers: Option<Vec<LayerId>>,
    pub oscillation: Option<BoutOscillation>,
    pub depression: Option<DepressionParameters>,
    pub eligible_projections: Vec<ProjectionId>,
    pub lesioned_layers: Vec<LayerId>,
    pub sleep_learning_rates: Vec<(ProjectionId, f32)>,
    pub init_noise: f32,
    pub seed: u64,
    pub min_layer_activity: f32,
    pub reignite: Option<ReigniteConfig>,
    pub stop_after_first_replay: bool,
}

impl BoutConfig {
    /// Check every layer and projection name against what the engine has.
    pub fn check_names(
        &self,
        layers: &[LayerId],
        projections: &[ProjectionId],
    ) -> Result<(), ConfigError> {
        let known_layer = |l: &LayerId| layers.contains(l);

        let mut named: Vec<&LayerId> = Vec::new();
        named.extend(self.stability_layers.iter().flatten());
        named.extend(&self.lesioned_layers);
        if let Some(osc) = &self.oscillation {
            named.extend(osc.assignment.keys());
        }
        if let Some(missing) = named.into_iter().find(|l| !known_layer(l)) {
            return Err(ConfigError::UnknownLayer(missing.clone()));
        }

        let projection_names = self
            .eligible_projections
            .iter()
            .chain(self.sleep_learning_rates.iter().map(|(p, _)| p));
        for p in projection_names {
            if !projections.contains(p) {
                return Err(ConfigError::UnknownProjection(p.clone()));
            }
        }
        Ok(())
    }

    /// The layers the stability monitor averages for this bout.
    pub fn resolve_stability_layers(&self, engine_layers: &[LayerId]) -> Vec<LayerId> {
        match &self.stability_layers {
            Some(layers) => layers.clone(),
            None => engine_layers
                .iter()
                .filter(|l| !self.lesioned_layers.contains(l))
                .cloned()
                .collect(),
        }
    }
}
