//! Telemetry output and recorded-trace input.

use std::io::Write;
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use sleep_replay::observer::{ChannelObserver, Telemetry};
use tracing::warn;

/// Writes telemetry as one JSON object per line.
///
/// Write failures are logged once and then only counted.
pub struct JsonLinesWriter<W: Write> {
    out: W,
    failures: u64,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, failures: 0 }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write(&mut self, msg: &Telemetry) {
        let res = serde_json::to_writer(&mut self.out, msg)
            .map_err(std::io::Error::from)
            .and_then(|_| self.out.write_all(b"\n"));
        if let Err(e) = res {
            self.fail(e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            self.fail(e);
        }
    }

    fn fail(&mut self, e: std::io::Error) {
        if self.failures == 0 {
            warn!("trace write failed: {}", e);
        }
        self.failures += 1;
    }
}

/// Background thread draining a [`ChannelObserver`] into a [`JsonLinesWriter`].
///
/// The bout only ever does a `try_send`; file I/O happens here.
pub struct TraceSink<W: Write + Send + 'static> {
    handle: JoinHandle<JsonLinesWriter<W>>,
}

impl<W: Write + Send + 'static> TraceSink<W> {
    pub fn spawn(out: W, bound: usize) -> (ChannelObserver, Self) {
        let (observer, rx) = ChannelObserver::new(bound);
        let handle = thread::spawn(move || {
            let mut writer = JsonLinesWriter::new(out);
            for msg in rx {
                writer.write(&msg);
            }
            writer.flush();
            writer
        });
        (observer, Self { handle })
    }

    /// Wait for every queued line to be written. The paired observer must be
    /// dropped first or this never returns. `None` if the thread panicked.
    pub fn finish(self) -> Option<JsonLinesWriter<W>> {
        self.handle.join().ok()
    }
}

/// A recorded stability trace: either a bare array or `{"stability": [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecordedTrace {
    Bare(Vec<f64>),
    Wrapped { stability: Vec<f64> },
}

impl RecordedTrace {
    pub fn into_values(self) -> Vec<f64> {
        match self {
            RecordedTrace::Bare(v) | RecordedTrace::Wrapped { stability: v } => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sleep_replay::config::Stage;
    use sleep_replay::observer::{BoutObserver, CycleSnapshot, PhaseEvent};
    use sleep_replay::phase::PhaseState;

    fn snapshot(cycle: u64) -> CycleSnapshot {
        CycleSnapshot {
            stage: Stage::Rem,
            cycle,
            stability: 1.0,
            gain: 1.0,
            phase: PhaseState::Plus,
            plus_count: 1,
            minus_count: 0,
            replay_events: 0,
        }
    }

    #[test]
    fn writes_one_line_per_message() {
        let mut w = JsonLinesWriter::new(Vec::new());
        w.write(&Telemetry::Event(PhaseEvent::PlusEntered { cycle: 3 }));
        w.write(&Telemetry::Cycle(snapshot(3)));
        assert_eq!(w.failures(), 0);
        let text = String::from_utf8(w.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""kind":"plusEntered""#));
        assert!(lines[1].contains(r#""stage":"REM""#));
    }

    #[test]
    fn sink_drains_everything_sent_before_the_observer_drops() {
        let (mut obs, sink) = TraceSink::spawn(Vec::new(), 64);
        for cycle in 0..10 {
            obs.on_cycle(&snapshot(cycle));
        }
        obs.on_event(&PhaseEvent::Reignited { cycle: 9 });
        assert_eq!(obs.dropped(), 0);
        drop(obs);

        let writer = sink.finish().unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 11);
        let last: Telemetry = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last, Telemetry::Event(PhaseEvent::Reignited { cycle: 9 }));
    }

    #[test]
    fn accepts_both_trace_shapes() {
        let bare: RecordedTrace = serde_json::from_str("[0.1, 0.2]").unwrap();
        let wrapped: RecordedTrace = serde_json::from_str(r#"{"stability": [0.3]}"#).unwrap();
        assert_eq!(bare.into_values(), vec![0.1, 0.2]);
        assert_eq!(wrapped.into_values(), vec![0.3]);
    }
}
