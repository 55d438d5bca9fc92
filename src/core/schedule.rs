//! Multi-bout sleep: a fixed sequence of stage blocks, repeated.

use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bout::{BoutResult, BoutStatus, SleepBout, StopSignal};
use crate::config::{SleepConfig, Stage};
use crate::engine::Engine;
use crate::error::{ConfigError, SleepError};
use crate::observer::BoutObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScheduleBlock {
    pub stage: Stage,
    pub cycles: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SleepSchedule {
    pub blocks: Vec<ScheduleBlock>,
    pub repeats: u32,
}

impl Default for SleepSchedule {
    /// Five alternating SWS/REM pairs of 10000 cycles each.
    fn default() -> Self {
        Self {
            blocks: vec![
                ScheduleBlock {
                    stage: Stage::Sws,
                    cycles: 10_000,
                },
                ScheduleBlock {
                    stage: Stage::Rem,
                    cycles: 10_000,
                },
            ],
            repeats: 5,
        }
    }
}

impl SleepSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks.is_empty() || self.repeats == 0 {
            return Err(ConfigError::EmptySchedule);
        }
        Ok(())
    }

    /// Every bout in run order.
    pub fn bouts(&self) -> impl Iterator<Item = ScheduleBlock> + '_ {
        (0..self.repeats).flat_map(move |_| self.blocks.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.blocks.len() * self.repeats as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScheduleReport {
    pub bouts: Vec<BoutResult>,
    /// Bouts run per stage.
    pub stage_counts: HashMap<Stage, u32>,
    pub replay_by_stage: HashMap<Stage, u32>,
    pub status: BoutStatus,
}

impl ScheduleReport {
    pub fn total_replay_events(&self) -> u32 {
        self.bouts.iter().map(|b| b.replay_events).sum()
    }

    pub fn total_cycles(&self) -> u64 {
        self.bouts.iter().map(|b| b.cycles_run).sum()
    }
}

/// Runs every bout of a [`SleepSchedule`] against one engine.
///
/// Bout `i` is seeded with `config.seed + i`. The run stops at the first
/// failing bout or when the stop signal is raised.
pub struct ScheduleRunner<'a> {
    config: &'a SleepConfig,
    schedule: &'a SleepSchedule,
    stop: StopSignal,
    observer: Option<&'a mut dyn BoutObserver>,
}

impl<'a> ScheduleRunner<'a> {
    pub fn new(config: &'a SleepConfig, schedule: &'a SleepSchedule) -> Self {
        Self {
            config,
            schedule,
            stop: StopSignal::new(),
            observer: None,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn BoutObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run<E: Engine + ?Sized>(mut self, engine: &mut E) -> Result<ScheduleReport, SleepError> {
        self.schedule.validate()?;

        // Resolve every stage up front so a bad stage fails before any bout runs.
        let mut resolved = Vec::with_capacity(self.schedule.len());
        for block in self.schedule.bouts() {
            resolved.push(self.config.resolve(block.stage, block.cycles)?);
        }

        let mut report = ScheduleReport {
            bouts: Vec::with_capacity(resolved.len()),
            stage_counts: HashMap::new(),
            replay_by_stage: HashMap::new(),
            status: BoutStatus::Completed,
        };

        for (index, bout_config) in resolved.into_iter().enumerate() {
            if self.stop.is_raised() {
                report.status = BoutStatus::Aborted;
                break;
            }
            let seed = self.config.seed.wrapping_add(index as u64);
            let mut bout = SleepBout::from_resolved(bout_config)
                .with_seed(seed)
                .with_stop_signal(self.stop.clone());
            if let Some(obs) = self.observer.as_deref_mut() {
                bout = bout.with_observer(obs);
            }

            let result = bout.run(engine)?;
            *report.stage_counts.entry(result.stage).or_insert(0) += 1;
            *report.replay_by_stage.entry(result.stage).or_insert(0) += result.replay_events;
            let aborted = result.status == BoutStatus::Aborted;
            report.bouts.push(result);
            if aborted {
                report.status = BoutStatus::Aborted;
                break;
            }
        }

        info!(
            bouts = report.bouts.len(),
            replay_events = report.total_replay_events(),
            status = ?report.status,
            "sleep schedule finished"
        );
        Ok(report)
    }
}
