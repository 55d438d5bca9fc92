//! Plus/minus phase detection during sleep.
//!
//! A dual-threshold hysteresis machine over the stability scalar:
//!
//! ```text
//!            s >= plus for debounce_len cycles, then s >= plus
//! Quiescent ─────────────────────────────────────────────────▶ Plus
//!     ▲  ▲                                                       │
//!     │  │ s < minus (abort, no update)                          │ minus <= s < plus
//!     │  └───────────────────────────────────────────────────────┤
//!     │                                                          ▼
//!     └───────────────── s < minus (replay event) ────────────  Minus
//! ```
//!
//! A plus window is a settled attractor; the minus window is the
//! destabilised transition out of it. Only a plus window followed by a
//! matching minus window produces a replay event. Falling straight from plus
//! to below the minus threshold discards the window.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PhaseState {
    #[default]
    Quiescent,
    Plus,
    Minus,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Quiescent => "quiescent",
            PhaseState::Plus => "plus",
            PhaseState::Minus => "minus",
        }
    }
}

impl core::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated detector parameters for one sleep stage.
///
/// `debounce_len` counts the qualifying cycles that must pass *before* plus is
/// entered: with `debounce_len = 5` a run of high stability starting at cycle
/// 0 enters plus on cycle 5, its sixth qualifying cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhaseThresholds {
    plus: f64,
    minus: f64,
    debounce_len: u32,
}

impl PhaseThresholds {
    pub fn new(plus: f64, minus: f64, debounce_len: u32) -> Result<Self, ConfigError> {
        for (name, value) in [("plusThreshold", plus), ("minusThreshold", minus)] {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteThreshold { name, value });
            }
        }
        if plus <= minus {
            return Err(ConfigError::ThresholdOrder { plus, minus });
        }
        if debounce_len < 1 {
            return Err(ConfigError::DebounceTooShort);
        }
        Ok(Self {
            plus,
            minus,
            debounce_len,
        })
    }

    pub fn plus(&self) -> f64 {
        self.plus
    }

    pub fn minus(&self) -> f64 {
        self.minus
    }

    pub fn debounce_len(&self) -> u32 {
        self.debounce_len
    }
}

/// What a single observed cycle did to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStep {
    /// Still quiescent (debounce may have advanced or reset).
    Idle,
    /// Entered plus; this cycle is the first accumulated plus cycle.
    PlusEntered,
    PlusContinued,
    /// Plus finalized over `plus_cycles`; this cycle is the first minus cycle.
    MinusEntered { plus_cycles: u32 },
    MinusContinued,
    /// Dropped below the minus band straight from plus. Nothing is learned.
    PlusAborted { plus_cycles: u32 },
    /// Minus finalized; a replay event should fire.
    MinusCompleted { plus_cycles: u32, minus_cycles: u32 },
}

impl PhaseStep {
    /// True for every step that changes [`PhaseState`].
    pub fn is_transition(&self) -> bool {
        !matches!(
            self,
            PhaseStep::Idle | PhaseStep::PlusContinued | PhaseStep::MinusContinued
        )
    }

    /// The phase whose activation should be accumulated this cycle, if any.
    pub fn accumulating(&self) -> Option<PhaseState> {
        match self {
            PhaseStep::PlusEntered | PhaseStep::PlusContinued => Some(PhaseState::Plus),
            PhaseStep::MinusEntered { .. } | PhaseStep::MinusContinued => Some(PhaseState::Minus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseDetector {
    thresholds: PhaseThresholds,
    state: PhaseState,
    debounce: u32,
    plus_count: u32,
    minus_count: u32,
    // Length of the plus window that led into the current minus window.
    finalized_plus: u32,
}

impl PhaseDetector {
    pub fn new(thresholds: PhaseThresholds) -> Self {
        Self {
            thresholds,
            state: PhaseState::Quiescent,
            debounce: 0,
            plus_count: 0,
            minus_count: 0,
            finalized_plus: 0,
        }
    }

    pub fn thresholds(&self) -> PhaseThresholds {
        self.thresholds
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn debounce_count(&self) -> u32 {
        self.debounce
    }

    pub fn plus_count(&self) -> u32 {
        self.plus_count
    }

    pub fn minus_count(&self) -> u32 {
        self.minus_count
    }

    /// Feed one cycle's stability. Non-finite input counts as 0.
    pub fn observe(&mut self, stability: f64) -> PhaseStep {
        let s = if stability.is_finite() { stability } else { 0.0 };
        let PhaseThresholds {
            plus,
            minus,
            debounce_len,
        } = self.thresholds;

        match self.state {
            PhaseState::Quiescent => {
                if s < plus {
                    self.debounce = 0;
                    return PhaseStep::Idle;
                }
                if self.debounce < debounce_len {
                    self.debounce += 1;
                    return PhaseStep::Idle;
                }
                self.clear_counters();
                self.state = PhaseState::Plus;
                self.plus_count = 1;
                PhaseStep::PlusEntered
            }
            PhaseState::Plus => {
                if s >= plus {
                    self.plus_count += 1;
                    PhaseStep::PlusContinued
                } else if s >= minus {
                    let plus_cycles = self.plus_count;
                    self.finalized_plus = plus_cycles;
                    self.plus_count = 0;
                    self.minus_count = 1;
                    self.state = PhaseState::Minus;
                    PhaseStep::MinusEntered { plus_cycles }
                } else {
                    let plus_cycles = self.plus_count;
                    self.clear_counters();
                    self.state = PhaseState::Quiescent;
                    PhaseStep::PlusAborted { plus_cycles }
                }
            }
            PhaseState::Minus => {
                if s >= minus {
                    self.minus_count += 1;
                    PhaseStep::MinusContinued
                } else {
                    let step = PhaseStep::MinusCompleted {
                        plus_cycles: self.finalized_plus,
                        minus_cycles: self.minus_count,
                    };
                    self.clear_counters();
                    self.state = PhaseState::Quiescent;
                    step
                }
            }
        }
    }

    /// Drop any open window without completing it. Returns the phase that
    /// was discarded, if one was open.
    pub fn reset(&mut self) -> Option<PhaseState> {
        let open = match self.state {
            PhaseState::Quiescent => None,
            s => Some(s),
        };
        self.clear_counters();
        self.state = PhaseState::Quiescent;
        open
    }

    fn clear_counters(&mut self) {
        self.debounce = 0;
        self.plus_count = 0;
        self.minus_count = 0;
        self.finalized_plus = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    const PLUS: f64 = 0.9999;
    const MINUS: f64 = 0.9974;

    fn detector() -> PhaseDetector {
        PhaseDetector::new(PhaseThresholds::new(PLUS, MINUS, 5).unwrap())
    }

    fn run(det: &mut PhaseDetector, seq: &[f64]) -> Vec<PhaseStep> {
        seq.iter().map(|s| det.observe(*s)).collect()
    }

    #[test]
    fn thresholds_must_be_ordered() {
        assert!(matches!(
            PhaseThresholds::new(0.5, 0.5, 1),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        assert!(matches!(
            PhaseThresholds::new(0.4, 0.5, 1),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        assert_eq!(
            PhaseThresholds::new(0.9, 0.5, 0),
            Err(ConfigError::DebounceTooShort)
        );
        assert!(matches!(
            PhaseThresholds::new(f64::NAN, 0.5, 1),
            Err(ConfigError::NonFiniteThreshold { .. })
        ));
    }

    #[test]
    fn plus_entered_after_debounce() {
        let mut det = detector();
        let steps = run(&mut det, &[0.99995; 6]);
        assert!(steps[..5].iter().all(|s| *s == PhaseStep::Idle));
        assert_eq!(steps[5], PhaseStep::PlusEntered);
        assert_eq!(det.state(), PhaseState::Plus);
        assert_eq!(det.plus_count(), 1);
    }

    #[test]
    fn debounce_resets_on_dip() {
        let mut det = detector();
        run(&mut det, &[0.99995, 0.99995, 0.99995, 0.99995]);
        assert_eq!(det.debounce_count(), 4);
        det.observe(0.5);
        assert_eq!(det.debounce_count(), 0);
        let steps = run(&mut det, &[0.99995; 5]);
        assert!(steps.iter().all(|s| *s == PhaseStep::Idle));
        assert_eq!(det.observe(0.99995), PhaseStep::PlusEntered);
    }

    #[test]
    fn debounce_len_one_enters_on_second_cycle() {
        let mut det = PhaseDetector::new(PhaseThresholds::new(PLUS, MINUS, 1).unwrap());
        assert_eq!(det.observe(1.0), PhaseStep::Idle);
        assert_eq!(det.observe(1.0), PhaseStep::PlusEntered);
    }

    #[test]
    fn constant_high_signal_never_leaves_plus() {
        let mut det = detector();
        let steps = run(&mut det, &[0.99995; 200]);
        let entries = steps.iter().filter(|s| **s == PhaseStep::PlusEntered).count();
        assert_eq!(entries, 1);
        assert_eq!(det.state(), PhaseState::Plus);
        assert_eq!(det.plus_count(), 195);
    }

    #[test]
    fn constant_low_signal_stays_quiescent() {
        let mut det = detector();
        let steps = run(&mut det, &[0.5; 200]);
        assert!(steps.iter().all(|s| *s == PhaseStep::Idle));
        assert_eq!(det.state(), PhaseState::Quiescent);
    }

    #[test]
    fn direct_drop_from_plus_aborts() {
        // Scenario A: 100 cycles stable then a hard drop.
        let mut det = detector();
        let mut seq = vec![0.99995; 100];
        seq.extend(vec![0.9; 100]);
        let steps = run(&mut det, &seq);

        assert_eq!(steps[5], PhaseStep::PlusEntered);
        assert!(steps[6..100].iter().all(|s| *s == PhaseStep::PlusContinued));
        assert_eq!(steps[100], PhaseStep::PlusAborted { plus_cycles: 95 });
        assert!(steps[101..].iter().all(|s| *s == PhaseStep::Idle));
        assert!(!steps
            .iter()
            .any(|s| matches!(s, PhaseStep::MinusCompleted { .. })));
        assert_eq!(det.state(), PhaseState::Quiescent);
    }

    #[test]
    fn plus_then_minus_completes_one_cycle() {
        // Scenario B.
        let mut det = detector();
        let mut seq = vec![0.99995; 10];
        seq.extend(vec![0.998; 10]);
        seq.extend(vec![0.9; 30]);
        let steps = run(&mut det, &seq);

        assert_eq!(steps[5], PhaseStep::PlusEntered);
        assert_eq!(steps[10], PhaseStep::MinusEntered { plus_cycles: 5 });
        assert_eq!(
            steps[20],
            PhaseStep::MinusCompleted {
                plus_cycles: 5,
                minus_cycles: 10
            }
        );
        let completed = steps
            .iter()
            .filter(|s| matches!(s, PhaseStep::MinusCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(det.state(), PhaseState::Quiescent);
    }

    #[test]
    fn minus_band_is_half_open() {
        let mut det = detector();
        run(&mut det, &[1.0; 6]);
        // Exactly the minus threshold is still inside the band.
        assert_eq!(det.observe(MINUS), PhaseStep::MinusEntered { plus_cycles: 1 });
        assert_eq!(det.observe(MINUS), PhaseStep::MinusContinued);
        // Climbing back above plus while in minus keeps accumulating minus.
        assert_eq!(det.observe(1.0), PhaseStep::MinusContinued);
        assert_eq!(det.minus_count(), 3);
    }

    #[test]
    fn nan_is_treated_as_zero() {
        let mut det = detector();
        run(&mut det, &[1.0; 6]);
        assert_eq!(det.observe(f64::NAN), PhaseStep::PlusAborted { plus_cycles: 1 });
    }

    #[test]
    fn reset_discards_open_window() {
        let mut det = detector();
        run(&mut det, &[1.0; 8]);
        assert_eq!(det.reset(), Some(PhaseState::Plus));
        assert_eq!(det.state(), PhaseState::Quiescent);
        assert_eq!(det.plus_count(), 0);
        assert_eq!(det.reset(), None);
    }

    #[test]
    fn only_legal_edges_for_noisy_sequences() {
        use PhaseState::*;
        let mut rng = Prng::new(1234);
        for _ in 0..50 {
            let mut det = detector();
            let mut prev = det.state();
            let mut qualifying_run = 0u32;
            for _ in 0..2000 {
                // Mixture biased around the two thresholds.
                let s = match rng.next_u32() % 4 {
                    0 => 1.0,
                    1 => 0.99995,
                    2 => 0.998,
                    _ => f64::from(rng.next_f32_01()),
                };
                let step = det.observe(s);
                let next = det.state();
                let legal = matches!(
                    (prev, next),
                    (Quiescent, Quiescent)
                        | (Quiescent, Plus)
                        | (Plus, Plus)
                        | (Plus, Minus)
                        | (Plus, Quiescent)
                        | (Minus, Minus)
                        | (Minus, Quiescent)
                );
                assert!(legal, "illegal edge {prev:?} -> {next:?}");
                assert_eq!(step.is_transition(), prev != next);

                if step == PhaseStep::PlusEntered {
                    assert!(qualifying_run >= 5);
                }
                qualifying_run = if prev == Quiescent && s >= PLUS {
                    qualifying_run + 1
                } else {
                    0
                };
                prev = next;
            }
        }
    }
}
