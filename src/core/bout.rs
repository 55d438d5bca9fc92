//! One sleep bout: Init, the cycle loop, and Finalize.
//!
//! Everything the bout changes on the engine (inhibition, depression,
//! external input, lesions, learning flags and rates) is recorded on a
//! [`SleepModeGuard`] as it happens and put back when the guard finishes,
//! whichever way the bout ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{BoutConfig, SleepConfig, Stage};
use crate::depression::SynapticDepressionController;
use crate::engine::{Engine, EngineError, LayerId, ProjectionId};
use crate::error::SleepError;
use crate::observer::{BoutObserver, CycleSnapshot, PhaseEvent};
use crate::oscillator::{InhibitionBaselines, MIDLINE};
use crate::phase::{PhaseDetector, PhaseStep};
use crate::prng::Prng;
use crate::replay::{PhaseAccumulator, ReplayLearningTrigger};
use crate::stability::StabilityMonitor;

/// Cooperative cancellation flag, checked once per cycle.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BoutStatus {
    /// Ran the full budget, or stopped after the first replay when asked to.
    Completed,
    /// The stop signal was raised.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct BoutResult {
    pub stage: Stage,
    pub replay_events: u32,
    pub cycles_run: u64,
    /// Cycles on which at least one layer reported a non-finite similarity.
    pub degenerate_cycles: u64,
    pub reignitions: u32,
    pub status: BoutStatus,
}

/// Counters mutated only by the cycle loop.
#[derive(Debug, Clone, Default)]
struct BoutState {
    cycles_run: u64,
    replay_events: u32,
    degenerate_cycles: u64,
    reignitions: u32,
}

/// Sleep-mode changes applied to an engine, undone on finish or drop.
pub struct SleepModeGuard<'e, E: Engine + ?Sized> {
    engine: &'e mut E,
    inhibition: InhibitionBaselines,
    depression: Option<SynapticDepressionController>,
    external_input_disabled: bool,
    lesioned: Vec<LayerId>,
    frozen: Vec<ProjectionId>,
    rates: Vec<(ProjectionId, f32)>,
    restored: bool,
}

impl<'e, E: Engine + ?Sized> SleepModeGuard<'e, E> {
    /// Put `engine` into sleep mode for `config`.
    ///
    /// `inhibition` must already hold the pre-bout baselines. On failure every
    /// change made so far is undone before the error is returned.
    pub fn enter(
        engine: &'e mut E,
        config: &BoutConfig,
        inhibition: InhibitionBaselines,
        rng: &mut Prng,
    ) -> Result<Self, SleepError> {
        let mut guard = Self {
            engine,
            inhibition,
            depression: None,
            external_input_disabled: false,
            lesioned: Vec::new(),
            frozen: Vec::new(),
            rates: Vec::new(),
            restored: false,
        };
        if let Err(e) = guard.init(config, rng) {
            guard.restore_logged();
            return Err(e);
        }
        Ok(guard)
    }

    fn init(&mut self, config: &BoutConfig, rng: &mut Prng) -> Result<(), SleepError> {
        // Lesions go first so the noise below only reaches live layers.
        for layer in &config.lesioned_layers {
            let active = self
                .engine
                .layer_active(layer)
                .map_err(|e| SleepError::engine("layer_active", e))?;
            if active {
                self.engine
                    .set_layer_active(layer, false)
                    .map_err(|e| SleepError::engine("set_layer_active", e))?;
                self.lesioned.push(layer.clone());
            }
        }

        randomize_active_layers(self.engine, config.init_noise, rng)
            .map_err(|e| SleepError::engine("randomize_activation", e))?;

        self.engine
            .disable_external_input()
            .map_err(|e| SleepError::engine("disable_external_input", e))?;
        self.external_input_disabled = true;

        if let Some(params) = config.depression {
            let mut ctl = SynapticDepressionController::new(params);
            ctl.install(self.engine)?;
            self.depression = Some(ctl);
        }

        for projection in self.engine.projections() {
            if config.eligible_projections.contains(&projection) {
                continue;
            }
            let enabled = self
                .engine
                .learning_enabled(&projection)
                .map_err(|e| SleepError::engine("learning_enabled", e))?;
            if enabled {
                self.engine
                    .set_learning_enabled(&projection, false)
                    .map_err(|e| SleepError::engine("set_learning_enabled", e))?;
                self.frozen.push(projection);
            }
        }

        for (projection, rate) in &config.sleep_learning_rates {
            let previous = self
                .engine
                .learning_rate(projection)
                .map_err(|e| SleepError::engine("learning_rate", e))?;
            self.engine
                .set_learning_rate(projection, *rate)
                .map_err(|e| SleepError::engine("set_learning_rate", e))?;
            self.rates.push((projection.clone(), previous));
        }

        debug!(
            lesioned = self.lesioned.len(),
            frozen = self.frozen.len(),
            rates = self.rates.len(),
            "entered sleep mode"
        );
        Ok(())
    }

    /// Undo every sleep-mode change. Keeps going after a failure and reports
    /// the first one.
    pub fn finish(mut self) -> Result<(), SleepError> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), SleepError> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        let mut first: Option<SleepError> = None;
        let mut note = |e: SleepError| {
            error!(error = %e, "failed to restore wake state");
            first.get_or_insert(e);
        };

        if let Err(e) = self.inhibition.restore(self.engine) {
            note(SleepError::engine("set_inhibition", e));
        }
        if let Some(ctl) = self.depression.as_mut() {
            if let Err(e) = ctl.remove(self.engine) {
                note(e);
            }
        }
        if self.external_input_disabled {
            self.external_input_disabled = false;
            if let Err(e) = self.engine.enable_external_input() {
                note(SleepError::engine("enable_external_input", e));
            }
        }
        for layer in self.lesioned.drain(..) {
            if let Err(e) = self.engine.set_layer_active(&layer, true) {
                note(SleepError::engine("set_layer_active", e));
            }
        }
        for projection in self.frozen.drain(..) {
            if let Err(e) = self.engine.set_learning_enabled(&projection, true) {
                note(SleepError::engine("set_learning_enabled", e));
            }
        }
        for (projection, rate) in self.rates.drain(..) {
            if let Err(e) = self.engine.set_learning_rate(&projection, rate) {
                note(SleepError::engine("set_learning_rate", e));
            }
        }

        first.map_or(Ok(()), Err)
    }

    fn restore_logged(&mut self) {
        // Failures were already logged one by one.
        let _ = self.restore();
    }
}

impl<E: Engine + ?Sized> Drop for SleepModeGuard<'_, E> {
    fn drop(&mut self) {
        if !self.restored {
            warn!("sleep-mode guard dropped without finish; restoring wake state");
            self.restore_logged();
        }
    }
}

fn randomize_active_layers<E: Engine + ?Sized>(
    engine: &mut E,
    noise: f32,
    rng: &mut Prng,
) -> Result<(), EngineError> {
    let mut draw = || rng.rectified_uniform(noise);
    for layer in engine.layers() {
        if engine.layer_active(&layer)? {
            engine.randomize_activation(&layer, &mut draw)?;
        }
    }
    Ok(())
}

/// A configured, not yet started sleep bout.
pub struct SleepBout<'o> {
    config: BoutConfig,
    rng: Prng,
    stop: StopSignal,
    observer: Option<Box<dyn BoutObserver + 'o>>,
}

impl<'o> SleepBout<'o> {
    /// Resolve `config` for `stage`. Fails before touching any engine.
    pub fn new(config: &SleepConfig, stage: Stage, cycle_budget: u64) -> Result<Self, SleepError> {
        let resolved = config.resolve(stage, cycle_budget)?;
        Ok(Self::from_resolved(resolved))
    }

    pub fn from_resolved(config: BoutConfig) -> Self {
        let rng = Prng::new(config.seed);
        Self {
            config,
            rng,
            stop: StopSignal::new(),
            observer: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self.rng = Prng::new(seed);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_observer(mut self, observer: impl BoutObserver + 'o) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Run the bout to completion, cancellation or failure.
    ///
    /// Wake state is restored before this returns on every path. Engine
    /// failures carry the number of replay events committed before them.
    pub fn run<E: Engine + ?Sized>(mut self, engine: &mut E) -> Result<BoutResult, SleepError> {
        let config = &self.config;
        let engine_layers = engine.layers();
        config.check_names(&engine_layers, &engine.projections())?;

        let stability_layers = config.resolve_stability_layers(&engine_layers);
        if stability_layers.is_empty() {
            return Err(crate::error::ConfigError::EmptyStabilitySet.into());
        }

        let baselines = match &config.oscillation {
            Some(osc) => InhibitionBaselines::snapshot(&*engine, &osc.oscillator, &osc.assignment)
                .map_err(|e| SleepError::engine("inhibition", e))?,
            None => InhibitionBaselines::default(),
        };

        info!(
            stage = %config.stage,
            budget = config.cycle_budget,
            seed = config.seed,
            "sleep bout started"
        );

        let mut guard = SleepModeGuard::enter(engine, config, baselines, &mut self.rng)?;
        let mut state = BoutState::default();
        let outcome = run_cycles(
            &mut guard,
            config,
            stability_layers,
            &mut self.rng,
            &self.stop,
            &mut self.observer,
            &mut state,
        );
        let restored = guard.finish();

        if state.degenerate_cycles > 0 {
            warn!(
                cycles = state.degenerate_cycles,
                "non-finite similarity was treated as 0"
            );
        }

        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, replay_events = state.replay_events, "sleep bout failed");
                return Err(e.with_replay_events(state.replay_events));
            }
        };
        restored.map_err(|e| e.with_replay_events(state.replay_events))?;

        let result = BoutResult {
            stage: config.stage,
            replay_events: state.replay_events,
            cycles_run: state.cycles_run,
            degenerate_cycles: state.degenerate_cycles,
            reignitions: state.reignitions,
            status,
        };
        info!(
            stage = %result.stage,
            replay_events = result.replay_events,
            cycles = result.cycles_run,
            status = ?result.status,
            "sleep bout finished"
        );
        Ok(result)
    }
}

fn run_cycles<E: Engine + ?Sized>(
    guard: &mut SleepModeGuard<'_, E>,
    config: &BoutConfig,
    stability_layers: Vec<LayerId>,
    rng: &mut Prng,
    stop: &StopSignal,
    observer: &mut Option<Box<dyn BoutObserver + '_>>,
    state: &mut BoutState,
) -> Result<BoutStatus, SleepError> {
    let mut monitor =
        StabilityMonitor::new(stability_layers).with_min_layer_activity(config.min_layer_activity);
    let mut detector = PhaseDetector::new(config.thresholds);
    let trigger = ReplayLearningTrigger::new(&config.eligible_projections);
    let mut acc = PhaseAccumulator::new(trigger.endpoint_layers());

    let mut status = BoutStatus::Completed;
    for cycle in 0..config.cycle_budget {
        if stop.is_raised() {
            info!(cycle, "stop signal raised");
            status = BoutStatus::Aborted;
            break;
        }

        let gain = match &config.oscillation {
            Some(osc) => guard
                .inhibition
                .apply(guard.engine, &osc.oscillator, cycle)
                .map_err(|e| SleepError::engine("set_inhibition", e))?,
            None => MIDLINE,
        };

        guard
            .engine
            .step()
            .map_err(|e| SleepError::engine("step", e))?;
        state.cycles_run = cycle + 1;

        let reading = monitor
            .measure(&*guard.engine)
            .map_err(|e| SleepError::engine("layer_similarity", e))?;
        if reading.is_degenerate() {
            state.degenerate_cycles += 1;
        }

        let step = detector.observe(reading.value);
        let accumulate = |acc: &mut PhaseAccumulator, engine: &E, plus: bool| {
            let r = if plus {
                acc.accumulate_plus(engine)
            } else {
                acc.accumulate_minus(engine)
            };
            r.map_err(|e| SleepError::engine("layer_activations", e))
        };

        let mut stop_now = false;
        match step {
            PhaseStep::Idle => {}
            PhaseStep::PlusEntered => {
                acc.discard();
                accumulate(&mut acc, &*guard.engine, true)?;
                emit(observer, PhaseEvent::PlusEntered { cycle });
            }
            PhaseStep::PlusContinued => accumulate(&mut acc, &*guard.engine, true)?,
            PhaseStep::MinusEntered { plus_cycles } => {
                acc.finalize_plus();
                accumulate(&mut acc, &*guard.engine, false)?;
                emit(observer, PhaseEvent::MinusEntered { cycle, plus_cycles });
            }
            PhaseStep::MinusContinued => accumulate(&mut acc, &*guard.engine, false)?,
            PhaseStep::PlusAborted { plus_cycles } => {
                acc.discard();
                emit(observer, PhaseEvent::PlusAborted { cycle, plus_cycles });
            }
            PhaseStep::MinusCompleted {
                plus_cycles,
                minus_cycles,
            } => {
                if let Some((plus, minus)) = acc.finalize_minus() {
                    trigger
                        .fire(guard.engine, &plus, &minus, &mut state.replay_events)
                        .map_err(|e| SleepError::engine("commit_contrastive_update", e))?;
                    emit(
                        observer,
                        PhaseEvent::ReplayCommitted {
                            cycle,
                            plus_cycles,
                            minus_cycles,
                            event: state.replay_events,
                        },
                    );
                    stop_now = config.stop_after_first_replay;
                }
            }
        }

        if let Some(r) = &config.reignite {
            if r.fires_at(cycle, reading.value) {
                randomize_active_layers(guard.engine, config.init_noise, rng)
                    .map_err(|e| SleepError::engine("randomize_activation", e))?;
                state.reignitions += 1;
                emit(observer, PhaseEvent::Reignited { cycle });
            }
        }

        if let Some(obs) = observer.as_mut() {
            obs.on_cycle(&CycleSnapshot {
                stage: config.stage,
                cycle,
                stability: reading.value,
                gain,
                phase: detector.state(),
                plus_count: detector.plus_count(),
                minus_count: detector.minus_count(),
                replay_events: state.replay_events,
            });
        }

        if stop_now {
            debug!(cycle, "stopping after first replay");
            break;
        }
    }

    if let Some(phase) = detector.reset() {
        acc.discard();
        emit(
            observer,
            PhaseEvent::WindowDiscarded {
                cycle: state.cycles_run,
                phase,
            },
        );
    }
    Ok(status)
}

fn emit(observer: &mut Option<Box<dyn BoutObserver + '_>>, event: PhaseEvent) {
    debug!(event = ?event, "phase event");
    if let Some(obs) = observer.as_mut() {
        obs.on_event(&event);
    }
}

/// Run one bout of `stage` with no observer and no external stop signal.
pub fn start_sleep_bout<E: Engine + ?Sized>(
    engine: &mut E,
    stage: Stage,
    cycle_budget: u64,
    config: &SleepConfig,
) -> Result<BoutResult, SleepError> {
    SleepBout::new(config, stage, cycle_budget)?.run(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{EngineCall, ScriptedEngine};

    fn quiet_config() -> SleepConfig {
        let mut cfg = SleepConfig::default();
        cfg.oscillation.enabled = false;
        cfg.depression.enabled = false;
        cfg
    }

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let a = StopSignal::new();
        let b = a.clone();
        assert!(!b.is_raised());
        a.raise();
        assert!(b.is_raised());
        b.reset();
        assert!(!a.is_raised());
    }

    #[test]
    fn failed_init_restores_partial_changes() {
        let mut engine = ScriptedEngine::builder()
            .layer("A", 2)
            .layer("B", 2)
            .projection("A", "B")
            .fail_at("set_learning_enabled", 0)
            .build();
        let mut cfg = quiet_config();
        cfg.lesioned_layers.insert(Stage::Default, vec!["B".into()]);

        let err = start_sleep_bout(&mut engine, Stage::Default, 10, &cfg).unwrap_err();
        assert!(matches!(
            err,
            SleepError::EngineUnavailable {
                operation: "set_learning_enabled",
                ..
            }
        ));
        assert!(engine.external_input_enabled());
        assert!(engine.layer_active("B").unwrap());
        assert_eq!(engine.steps(), 0);
    }

    #[test]
    fn dropped_guard_restores() {
        let mut engine = ScriptedEngine::builder().layer("A", 2).build();
        let cfg = SleepConfig::default().resolve(Stage::Default, 1).unwrap();
        let mut rng = Prng::new(1);
        {
            let _guard =
                SleepModeGuard::enter(&mut engine, &cfg, InhibitionBaselines::default(), &mut rng)
                    .unwrap();
        }
        assert!(engine.external_input_enabled());
        assert!(engine.depression().is_none());
        assert_eq!(engine.calls().last(), Some(&EngineCall::EnableExternalInput));
    }

    #[test]
    fn frozen_and_rate_changes_are_undone() {
        let mut engine = ScriptedEngine::builder()
            .layer("CTX", 2)
            .layer("DG", 2)
            .projection("CTX", "DG")
            .projection("DG", "CTX")
            .build();
        let mut cfg = quiet_config();
        cfg.eligible_projections = vec![ProjectionId::new("CTX", "DG")];
        cfg.sleep_learning_rate
            .insert(ProjectionId::new("CTX", "DG"), 0.03);

        start_sleep_bout(&mut engine, Stage::Default, 3, &cfg).unwrap();

        assert!(engine
            .calls()
            .contains(&EngineCall::SetLearningEnabled {
                projection: ProjectionId::new("DG", "CTX"),
                enabled: false
            }));
        assert!(engine
            .learning_enabled(&ProjectionId::new("DG", "CTX"))
            .unwrap());
        assert_eq!(
            engine.learning_rate(&ProjectionId::new("CTX", "DG")).unwrap(),
            0.04
        );
    }
}
