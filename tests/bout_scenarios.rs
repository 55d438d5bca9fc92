use sleep_replay::bout::{start_sleep_bout, BoutStatus, SleepBout, StopSignal};
use sleep_replay::config::{ReigniteConfig, SleepConfig, Stage};
use sleep_replay::engine::{Engine, ProjectionId};
use sleep_replay::error::{ConfigError, SleepError};
use sleep_replay::observer::{BoutObserver, CycleSnapshot, PhaseEvent, TraceRecorder};
use sleep_replay::oscillator::InhibitionOscillator;
use sleep_replay::phase::PhaseState;
use sleep_replay::scripted::{EngineCall, ScriptedEngine};

const PLUS: f64 = 0.9999;
const MINUS: f64 = 0.9974;

fn config() -> SleepConfig {
    let mut cfg = SleepConfig {
        plus_threshold: PLUS,
        minus_threshold: MINUS,
        debounce_len: 5,
        eligible_projections: vec![ProjectionId::new("CTX", "Output")],
        ..SleepConfig::default()
    };
    cfg.oscillation
        .group_assignment
        .insert("CTX".into(), "high".into());
    cfg
}

fn engine(trace: Vec<f64>) -> ScriptedEngine {
    ScriptedEngine::builder()
        .layer("CTX", 4)
        .layer("Output", 2)
        .layer("CA3", 3)
        .inhibition("CTX", 2.0)
        .projection("CTX", "Output")
        .projection("CA3", "CTX")
        .stability(trace)
        .build()
}

fn scenario_a() -> Vec<f64> {
    let mut t = vec![0.99995; 100];
    t.extend(vec![0.9; 100]);
    t
}

fn scenario_b() -> Vec<f64> {
    let mut t = vec![0.99995; 10];
    t.extend(vec![0.998; 10]);
    t.extend(vec![0.9; 180]);
    t
}

fn assert_wake_state(e: &ScriptedEngine) {
    assert_eq!(e.inhibition("CTX").unwrap(), 2.0);
    assert!(e.depression().is_none());
    assert!(e.external_input_enabled());
    for layer in ["CTX", "Output", "CA3"] {
        assert!(e.layer_active(layer).unwrap());
    }
    assert!(e
        .learning_enabled(&ProjectionId::new("CA3", "CTX"))
        .unwrap());
}

fn run_recorded(
    e: &mut ScriptedEngine,
    cfg: &SleepConfig,
    budget: u64,
) -> (Result<sleep_replay::bout::BoutResult, SleepError>, TraceRecorder) {
    let mut rec = TraceRecorder::new(10_000);
    let result = SleepBout::new(cfg, Stage::Default, budget)
        .unwrap()
        .with_observer(&mut rec)
        .run(e);
    (result, rec)
}

#[test]
fn zero_budget_changes_nothing() {
    let mut e = engine(vec![0.99995]);
    let result = start_sleep_bout(&mut e, Stage::Default, 0, &config()).unwrap();
    assert_eq!(result.replay_events, 0);
    assert_eq!(result.cycles_run, 0);
    assert_eq!(result.status, BoutStatus::Completed);
    assert_eq!(e.steps(), 0);
    assert_wake_state(&e);
}

#[test]
fn constant_high_stability_enters_plus_once() {
    let mut e = engine(vec![0.99995]);
    let (result, rec) = run_recorded(&mut e, &config(), 500);
    let result = result.unwrap();
    assert_eq!(result.replay_events, 0);

    let entries = rec
        .events()
        .iter()
        .filter(|ev| matches!(ev, PhaseEvent::PlusEntered { .. }))
        .count();
    assert_eq!(entries, 1);
    assert!(rec
        .snapshots()
        .skip(5)
        .all(|s| s.phase == PhaseState::Plus));
    // The still-open plus window is dropped at the end.
    assert!(matches!(
        rec.events().last(),
        Some(PhaseEvent::WindowDiscarded {
            phase: PhaseState::Plus,
            ..
        })
    ));
    assert_eq!(e.replay_commits(), 0);
}

#[test]
fn constant_low_stability_stays_quiescent() {
    let mut e = engine(vec![0.5]);
    let (result, rec) = run_recorded(&mut e, &config(), 300);
    assert_eq!(result.unwrap().replay_events, 0);
    assert!(rec.events().is_empty());
    assert!(rec.snapshots().all(|s| s.phase == PhaseState::Quiescent));
}

#[test]
fn scenario_a_aborts_without_learning() {
    let mut e = engine(scenario_a());
    let (result, rec) = run_recorded(&mut e, &config(), 200);
    let result = result.unwrap();

    assert_eq!(result.replay_events, 0);
    assert_eq!(e.replay_commits(), 0);
    assert_eq!(
        rec.events(),
        &[
            PhaseEvent::PlusEntered { cycle: 5 },
            PhaseEvent::PlusAborted {
                cycle: 100,
                plus_cycles: 95
            },
        ]
    );
    let last = rec.snapshots().last().unwrap();
    assert_eq!(last.phase, PhaseState::Quiescent);
}

#[test]
fn scenario_b_commits_one_replay() {
    let mut e = engine(scenario_b());
    let (result, rec) = run_recorded(&mut e, &config(), 200);
    let result = result.unwrap();

    assert_eq!(result.replay_events, 1);
    let commits: Vec<&EngineCall> = e
        .calls()
        .iter()
        .filter(|c| matches!(c, EngineCall::ContrastiveUpdate { .. }))
        .collect();
    assert_eq!(
        commits,
        vec![&EngineCall::ContrastiveUpdate {
            projection: ProjectionId::new("CTX", "Output"),
            plus_cycles: 5,
            minus_cycles: 10,
        }]
    );
    assert!(rec.events().contains(&PhaseEvent::MinusEntered {
        cycle: 10,
        plus_cycles: 5
    }));
    assert!(rec.events().contains(&PhaseEvent::ReplayCommitted {
        cycle: 20,
        plus_cycles: 5,
        minus_cycles: 10,
        event: 1
    }));
    assert_wake_state(&e);
}

#[test]
fn stop_after_first_replay_ends_the_bout() {
    let mut trace = scenario_b();
    trace.truncate(20);
    let mut repeated = Vec::new();
    for _ in 0..5 {
        repeated.extend(&trace);
        repeated.extend(vec![0.9; 10]);
    }
    let mut cfg = config();

    let mut e = engine(repeated.clone());
    let all = start_sleep_bout(&mut e, Stage::Default, repeated.len() as u64, &cfg).unwrap();
    assert_eq!(all.replay_events, 5);

    cfg.stop_after_first_replay = true;
    let mut e = engine(repeated.clone());
    let first = start_sleep_bout(&mut e, Stage::Default, repeated.len() as u64, &cfg).unwrap();
    assert_eq!(first.replay_events, 1);
    assert_eq!(first.cycles_run, 21);
    assert_eq!(first.status, BoutStatus::Completed);
    assert_wake_state(&e);
}

#[test]
fn engine_failure_restores_and_reports_progress() {
    // Fails in the middle of the first minus window.
    let mut e = ScriptedEngine::builder()
        .layer("CTX", 4)
        .layer("Output", 2)
        .layer("CA3", 3)
        .inhibition("CTX", 2.0)
        .projection("CTX", "Output")
        .projection("CA3", "CTX")
        .stability(scenario_b())
        .fail_at("step", 15)
        .build();
    let mut cfg = config();
    cfg.lesioned_layers.insert(Stage::Default, vec!["CA3".into()]);

    let err = start_sleep_bout(&mut e, Stage::Default, 200, &cfg).unwrap_err();
    match &err {
        SleepError::EngineUnavailable {
            operation,
            replay_events,
            ..
        } => {
            assert_eq!(*operation, "step");
            assert_eq!(*replay_events, 0);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_wake_state(&e);
}

#[test]
fn failure_after_a_replay_carries_the_count() {
    let mut e = ScriptedEngine::builder()
        .layer("CTX", 4)
        .layer("Output", 2)
        .layer("CA3", 3)
        .inhibition("CTX", 2.0)
        .projection("CTX", "Output")
        .projection("CA3", "CTX")
        .stability(scenario_b())
        .fail_at("layer_similarity", 40)
        .build();

    let err = start_sleep_bout(&mut e, Stage::Default, 200, &config()).unwrap_err();
    assert_eq!(err.replay_events(), 1);
    assert_wake_state(&e);
}

#[test]
fn configuration_errors_touch_nothing() {
    let mut e = engine(scenario_b());
    let mut cfg = config();
    cfg.lesioned_layers
        .insert(Stage::Default, vec!["Entorhinal".into()]);
    let err = start_sleep_bout(&mut e, Stage::Default, 10, &cfg).unwrap_err();
    assert!(matches!(
        err,
        SleepError::Configuration(ConfigError::UnknownLayer(_))
    ));
    assert!(e.calls().is_empty());

    let mut cfg = config();
    cfg.plus_threshold = 0.5;
    let err = start_sleep_bout(&mut e, Stage::Default, 10, &cfg).unwrap_err();
    assert!(matches!(
        err,
        SleepError::Configuration(ConfigError::ThresholdOrder { .. })
    ));
    assert!(e.calls().is_empty());
}

struct StopAt {
    cycle: u64,
    stop: StopSignal,
}

impl BoutObserver for StopAt {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot) {
        if snapshot.cycle == self.cycle {
            self.stop.raise();
        }
    }
}

#[test]
fn stop_signal_aborts_and_restores() {
    let mut e = engine(scenario_b());
    let stop = StopSignal::new();
    let result = SleepBout::new(&config(), Stage::Default, 200)
        .unwrap()
        .with_stop_signal(stop.clone())
        .with_observer(StopAt {
            cycle: 14,
            stop: stop.clone(),
        })
        .run(&mut e)
        .unwrap();

    assert_eq!(result.status, BoutStatus::Aborted);
    assert_eq!(result.cycles_run, 15);
    assert_eq!(result.replay_events, 0);
    assert_eq!(e.steps(), 15);
    // The open minus window was discarded, not committed.
    assert_eq!(e.replay_commits(), 0);
    assert_wake_state(&e);
}

#[test]
fn depression_brackets_every_step() {
    let mut e = engine(scenario_b());
    start_sleep_bout(&mut e, Stage::Default, 50, &config()).unwrap();

    let calls = e.calls();
    let install = calls
        .iter()
        .position(|c| matches!(c, EngineCall::InstallDepression(_)))
        .unwrap();
    let remove = calls
        .iter()
        .position(|c| matches!(c, EngineCall::RemoveDepression))
        .unwrap();
    let first_step = calls.iter().position(|c| *c == EngineCall::Step).unwrap();
    let last_step = calls.iter().rposition(|c| *c == EngineCall::Step).unwrap();
    assert!(install < first_step);
    assert!(remove > last_step);
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, EngineCall::InstallDepression(_)))
            .count(),
        1
    );
}

#[test]
fn inhibition_is_baseline_times_gain_never_compounded() {
    let cfg = config();
    let mut e = engine(vec![0.5]);
    start_sleep_bout(&mut e, Stage::Default, 120, &cfg).unwrap();

    let writes: Vec<f32> = e
        .calls()
        .iter()
        .filter_map(|c| match c {
            EngineCall::SetInhibition { layer, conductance } if layer == "CTX" => {
                Some(*conductance)
            }
            _ => None,
        })
        .collect();
    // One write per cycle plus the restore.
    assert_eq!(writes.len(), 121);

    let osc = InhibitionOscillator::new(cfg.oscillation.period, &cfg.oscillation.amplitude).unwrap();
    for (cycle, w) in writes[..120].iter().enumerate() {
        assert_eq!(*w, 2.0 * osc.gain_at("high", cycle as u64));
    }
    assert_eq!(writes[12], writes[62]);
    assert_eq!(writes[120], 2.0);
}

#[test]
fn lesioned_layers_are_excluded_and_restored() {
    let mut e = ScriptedEngine::builder()
        .layer("CTX", 2)
        .layer("CA3", 2)
        .inhibition("CTX", 2.0)
        .layer_similarity("CTX", vec![0.5])
        .layer_similarity("CA3", vec![f64::NAN])
        .build();
    let mut cfg = config();
    cfg.eligible_projections.clear();
    cfg.lesioned_layers.insert(Stage::Rem, vec!["CA3".into()]);

    let rem = start_sleep_bout(&mut e, Stage::Rem, 10, &cfg).unwrap();
    assert_eq!(rem.degenerate_cycles, 0);
    assert!(e.calls().contains(&EngineCall::SetLayerActive {
        layer: "CA3".into(),
        active: false
    }));
    assert!(e.layer_active("CA3").unwrap());

    let default = start_sleep_bout(&mut e, Stage::Default, 10, &cfg).unwrap();
    assert_eq!(default.degenerate_cycles, 10);
}

#[test]
fn randomization_is_reproducible_per_seed() {
    let run = |seed: u64| {
        let mut e = engine(scenario_b());
        let mut cfg = config();
        cfg.seed = seed;
        start_sleep_bout(&mut e, Stage::Default, 30, &cfg).unwrap();
        e.calls().to_vec()
    };
    assert_eq!(run(3), run(3));
}

fn randomized_layers(e: &ScriptedEngine) -> Vec<&str> {
    e.calls()
        .iter()
        .filter_map(|c| match c {
            EngineCall::RandomizeActivation { layer } => Some(layer.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn lesioned_layers_are_never_randomized() {
    let mut e = engine(vec![0.5]);
    let mut cfg = config();
    cfg.lesioned_layers.insert(Stage::Rem, vec!["CA3".into()]);
    cfg.reignite = Some(ReigniteConfig {
        after_cycle: 10,
        floor: 0.8,
        period: 10,
        burst: 1,
    });

    let result = start_sleep_bout(&mut e, Stage::Rem, 60, &cfg).unwrap();
    assert_eq!(result.reignitions, 4);

    let randomized = randomized_layers(&e);
    assert_eq!(randomized.len(), 2 * 5);
    assert!(!randomized.contains(&"CA3"));

    let lesion = e
        .calls()
        .iter()
        .position(|c| {
            *c == EngineCall::SetLayerActive {
                layer: "CA3".into(),
                active: false,
            }
        })
        .unwrap();
    let first_noise = e
        .calls()
        .iter()
        .position(|c| matches!(c, EngineCall::RandomizeActivation { .. }))
        .unwrap();
    assert!(lesion < first_noise);
    assert_wake_state(&e);
}

#[test]
fn collapsed_network_is_reignited_in_bursts() {
    let mut cfg = config();
    cfg.reignite = Some(ReigniteConfig {
        after_cycle: 10,
        floor: 0.8,
        period: 10,
        burst: 2,
    });

    let mut e = engine(vec![0.5]);
    let (result, rec) = run_recorded(&mut e, &cfg, 60);
    let result = result.unwrap();
    assert_eq!(result.reignitions, 8);

    let fired: Vec<u64> = rec
        .events()
        .iter()
        .filter_map(|ev| match ev {
            PhaseEvent::Reignited { cycle } => Some(*cycle),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec![20, 21, 30, 31, 40, 41, 50, 51]);
    // Sleep onset plus one draw per burst cycle, three live layers each time.
    assert_eq!(randomized_layers(&e).len(), 3 * 9);
    assert_wake_state(&e);

    // A settled network is left alone.
    let mut e = engine(vec![0.99995]);
    let (result, _) = run_recorded(&mut e, &cfg, 60);
    assert_eq!(result.unwrap().reignitions, 0);
    assert_eq!(randomized_layers(&e).len(), 3);
}

#[test]
fn silent_layers_read_as_unstable() {
    let silent_engine = || {
        ScriptedEngine::builder()
            .layer("CTX", 4)
            .layer("Output", 2)
            .layer("CA3", 3)
            .inhibition("CTX", 2.0)
            .projection("CTX", "Output")
            .projection("CA3", "CTX")
            .stability(vec![0.99995])
            .activation(0.0)
            .build()
    };
    let mut cfg = config();

    let mut e = silent_engine();
    let (result, rec) = run_recorded(&mut e, &cfg, 50);
    result.unwrap();
    assert!(rec
        .events()
        .iter()
        .any(|ev| matches!(ev, PhaseEvent::PlusEntered { .. })));

    cfg.min_layer_activity = 0.1;
    let mut e = silent_engine();
    let (result, rec) = run_recorded(&mut e, &cfg, 50);
    assert_eq!(result.unwrap().replay_events, 0);
    assert!(rec
        .snapshots()
        .all(|s| s.stability == 0.0 && s.phase == PhaseState::Quiescent));
    assert!(rec.events().is_empty());
}
