//! Sleep-replay control: drive a neural simulator through sleep bouts, detect
//! settled attractors (plus phase) and the transitions out of them (minus
//! phase), and commit a contrastive learning update for every completed pair.

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/oscillator.rs"]
pub mod oscillator;

#[path = "core/depression.rs"]
pub mod depression;

#[path = "core/stability.rs"]
pub mod stability;

#[path = "core/phase.rs"]
pub mod phase;

#[path = "core/replay.rs"]
pub mod replay;

#[path = "core/bout.rs"]
pub mod bout;

#[path = "core/schedule.rs"]
pub mod schedule;

#[path = "core/scripted.rs"]
pub mod scripted;

#[path = "core/substrate.rs"]
pub mod substrate;

pub mod observer;

pub mod prelude {
    pub use crate::bout::{start_sleep_bout, BoutResult, BoutStatus, SleepBout, StopSignal};
    pub use crate::config::{SleepConfig, Stage};
    pub use crate::engine::{Engine, EngineError, LayerId, ProjectionId};
    pub use crate::error::{ConfigError, SleepError};
    pub use crate::observer::{
        BoutObserver, ChannelObserver, CycleSnapshot, PhaseEvent, TraceRecorder,
    };
    pub use crate::schedule::{ScheduleRunner, SleepSchedule};
}
