use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::Stage;
use crate::phase::PhaseState;

/// A read-only view of one sleep cycle.
///
/// Design intent:
/// - Observers cannot mutate or steer the bout.
/// - Snapshots are plain values; sinks that cannot keep up must drop, never
///   block the cycle loop.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CycleSnapshot {
    pub stage: Stage,
    pub cycle: u64,
    pub stability: f64,
    /// Oscillation gain of the first configured group (1.0 when off).
    pub gain: f32,
    pub phase: PhaseState,
    pub plus_count: u32,
    pub minus_count: u32,
    pub replay_events: u32,
}

/// Phase-boundary and housekeeping events.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum PhaseEvent {
    PlusEntered {
        cycle: u64,
    },
    MinusEntered {
        cycle: u64,
        plus_cycles: u32,
    },
    PlusAborted {
        cycle: u64,
        plus_cycles: u32,
    },
    ReplayCommitted {
        cycle: u64,
        plus_cycles: u32,
        minus_cycles: u32,
        event: u32,
    },
    /// An open window was dropped at bout end.
    WindowDiscarded {
        cycle: u64,
        phase: PhaseState,
    },
    Reignited {
        cycle: u64,
    },
}

impl PhaseEvent {
    pub fn cycle(&self) -> u64 {
        match self {
            PhaseEvent::PlusEntered { cycle }
            | PhaseEvent::MinusEntered { cycle, .. }
            | PhaseEvent::PlusAborted { cycle, .. }
            | PhaseEvent::ReplayCommitted { cycle, .. }
            | PhaseEvent::WindowDiscarded { cycle, .. }
            | PhaseEvent::Reignited { cycle } => *cycle,
        }
    }
}

/// Telemetry sink for a running bout.
pub trait BoutObserver {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot);

    fn on_event(&mut self, _event: &PhaseEvent) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BoutObserver for NoopObserver {
    fn on_cycle(&mut self, _snapshot: &CycleSnapshot) {}
}

impl<T: BoutObserver + ?Sized> BoutObserver for &mut T {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot) {
        (**self).on_cycle(snapshot);
    }

    fn on_event(&mut self, event: &PhaseEvent) {
        (**self).on_event(event);
    }
}

impl<T: BoutObserver + ?Sized> BoutObserver for Box<T> {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot) {
        (**self).on_cycle(snapshot);
    }

    fn on_event(&mut self, event: &PhaseEvent) {
        (**self).on_event(event);
    }
}

/// Keeps the most recent `capacity` snapshots and every event.
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    capacity: usize,
    snapshots: VecDeque<CycleSnapshot>,
    events: Vec<PhaseEvent>,
    dropped: u64,
}

impl TraceRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: VecDeque::with_capacity(capacity.clamp(1, 4096)),
            events: Vec::new(),
            dropped: 0,
        }
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &CycleSnapshot> {
        self.snapshots.iter()
    }

    pub fn events(&self) -> &[PhaseEvent] {
        &self.events
    }

    /// Snapshots evicted to stay within capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_parts(self.snapshots.iter(), &self.events)
    }
}

impl BoutObserver for TraceRecorder {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot) {
        if self.snapshots.len() == self.capacity {
            self.snapshots.pop_front();
            self.dropped += 1;
        }
        self.snapshots.push_back(snapshot.clone());
    }

    fn on_event(&mut self, event: &PhaseEvent) {
        self.events.push(event.clone());
    }
}

/// Message carried by a [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Telemetry {
    Cycle(CycleSnapshot),
    Event(PhaseEvent),
}

/// Forwards telemetry over a bounded channel without ever blocking.
///
/// Messages that do not fit are dropped and counted. Once the receiver is
/// gone every later message counts as dropped.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: SyncSender<Telemetry>,
    dropped: u64,
}

impl ChannelObserver {
    pub fn new(bound: usize) -> (Self, Receiver<Telemetry>) {
        let (tx, rx) = sync_channel(bound);
        (Self { tx, dropped: 0 }, rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn send(&mut self, msg: Telemetry) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
            }
        }
    }
}

impl BoutObserver for ChannelObserver {
    fn on_cycle(&mut self, snapshot: &CycleSnapshot) {
        self.send(Telemetry::Cycle(snapshot.clone()));
    }

    fn on_event(&mut self, event: &PhaseEvent) {
        self.send(Telemetry::Event(event.clone()));
    }
}

/// Aggregate view over recorded telemetry.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TraceSummary {
    pub cycles: u64,
    pub mean_stability: f64,
    pub plus_cycles: u64,
    pub minus_cycles: u64,
    pub plus_entries: u32,
    pub aborted_windows: u32,
    pub replay_events: u32,
    pub mean_plus_len: f64,
    pub mean_minus_len: f64,
}

impl TraceSummary {
    pub fn from_parts<'a>(
        snapshots: impl Iterator<Item = &'a CycleSnapshot>,
        events: &[PhaseEvent],
    ) -> Self {
        let mut s = TraceSummary::default();
        let mut stability_sum = 0.0;
        for snap in snapshots {
            s.cycles += 1;
            stability_sum += snap.stability;
            match snap.phase {
                PhaseState::Plus => s.plus_cycles += 1,
                PhaseState::Minus => s.minus_cycles += 1,
                PhaseState::Quiescent => {}
            }
        }
        if s.cycles > 0 {
            s.mean_stability = stability_sum / s.cycles as f64;
        }

        let (mut plus_len, mut minus_len) = (0u64, 0u64);
        for ev in events {
            match ev {
                PhaseEvent::PlusEntered { .. } => s.plus_entries += 1,
                PhaseEvent::PlusAborted { .. } => s.aborted_windows += 1,
                PhaseEvent::ReplayCommitted {
                    plus_cycles,
                    minus_cycles,
                    ..
                } => {
                    s.replay_events += 1;
                    plus_len += u64::from(*plus_cycles);
                    minus_len += u64::from(*minus_cycles);
                }
                _ => {}
            }
        }
        if s.replay_events > 0 {
            s.mean_plus_len = plus_len as f64 / f64::from(s.replay_events);
            s.mean_minus_len = minus_len as f64 / f64::from(s.replay_events);
        }
        s
    }
}
