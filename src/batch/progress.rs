//! Progress reporting: the only coupling between verification and whatever
//! presents it (console, GUI, nothing).
//!
//! Workers never call a presentation observer directly.  They hold a
//! [`ProgressFunnel`], which turns each call into a [`ProgressEvent`] on an
//! unbounded channel; a single sink thread drains the channel and invokes the
//! real observer.  The observer therefore sees one call at a time, and the
//! events of any one file arrive in the order its worker produced them:
//! `on_new_file`, any number of `on_progress`, then one `on_complete`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::warn;

pub trait ProgressObserver: Send + Sync {
    fn on_new_file(&self, id: usize, name: &str);
    fn on_progress(&self, id: usize, phase: &str, percent: u8);
    fn on_complete(&self, id: usize, phase: &str, result: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_new_file(&self, _: usize, _: &str) {}
    fn on_progress(&self, _: usize, _: &str, _: u8) {}
    fn on_complete(&self, _: usize, _: &str, _: &str) {}
}

// ── Funnel ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    NewFile { id: usize, name: String },
    Progress { id: usize, phase: String, percent: u8 },
    Complete { id: usize, phase: String, result: String },
}

/// Sending half handed to workers.
#[derive(Debug, Clone)]
pub struct ProgressFunnel {
    tx: Sender<ProgressEvent>,
}

impl ProgressFunnel {
    fn send(&self, event: ProgressEvent) {
        // The sink only goes away after every funnel is dropped.
        if self.tx.send(event).is_err() {
            warn!("progress sink closed; dropping event");
        }
    }
}

impl ProgressObserver for ProgressFunnel {
    fn on_new_file(&self, id: usize, name: &str) {
        self.send(ProgressEvent::NewFile { id, name: name.to_string() });
    }

    fn on_progress(&self, id: usize, phase: &str, percent: u8) {
        self.send(ProgressEvent::Progress { id, phase: phase.to_string(), percent });
    }

    fn on_complete(&self, id: usize, phase: &str, result: &str) {
        self.send(ProgressEvent::Complete { id, phase: phase.to_string(), result: result.to_string() });
    }
}

/// Start the sink thread.  It exits once every clone of the returned funnel
/// has been dropped.
pub fn spawn_sink(observer: Arc<dyn ProgressObserver>) -> io::Result<(ProgressFunnel, JoinHandle<()>)> {
    let (tx, rx) = unbounded::<ProgressEvent>();
    let handle = thread::Builder::new()
        .name("progress-sink".into())
        .spawn(move || {
            for event in rx {
                match event {
                    ProgressEvent::NewFile { id, name }           => observer.on_new_file(id, &name),
                    ProgressEvent::Progress { id, phase, percent } => observer.on_progress(id, &phase, percent),
                    ProgressEvent::Complete { id, phase, result }  => observer.on_complete(id, &phase, &result),
                }
            }
        })?;
    Ok((ProgressFunnel { tx }, handle))
}

// ── Console ───────────────────────────────────────────────────────────────────

/// One line per finished file on stdout; with `show_progress`, a line per
/// quarter of each pass as well.
#[derive(Debug, Default)]
pub struct ConsoleProgress {
    show_progress: bool,
    names:         Mutex<HashMap<usize, String>>,
}

impl ConsoleProgress {
    pub fn new(show_progress: bool) -> Self {
        Self { show_progress, names: Mutex::new(HashMap::new()) }
    }

    fn name(&self, id: usize) -> String {
        let names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.get(&id).cloned().unwrap_or_else(|| format!("#{id}"))
    }
}

impl ProgressObserver for ConsoleProgress {
    fn on_new_file(&self, id: usize, name: &str) {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.insert(id, name.to_string());
    }

    fn on_progress(&self, id: usize, phase: &str, percent: u8) {
        if self.show_progress && percent % 25 == 0 {
            println!("  {:<40} {:<7} {:>3}%", self.name(id), phase, percent);
        }
    }

    fn on_complete(&self, id: usize, phase: &str, result: &str) {
        println!("  {:<40} {:<7} {}", self.name(id), phase, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressObserver for Recorder {
        fn on_new_file(&self, id: usize, name: &str) {
            self.0.lock().unwrap().push(ProgressEvent::NewFile { id, name: name.into() });
        }
        fn on_progress(&self, id: usize, phase: &str, percent: u8) {
            self.0.lock().unwrap().push(ProgressEvent::Progress { id, phase: phase.into(), percent });
        }
        fn on_complete(&self, id: usize, phase: &str, result: &str) {
            self.0.lock().unwrap().push(ProgressEvent::Complete { id, phase: phase.into(), result: result.into() });
        }
    }

    #[test]
    fn funnel_preserves_per_sender_order() {
        let recorder = Arc::new(Recorder::default());
        let (funnel, sink) = spawn_sink(recorder.clone()).unwrap();

        thread::scope(|s| {
            for id in 0..4 {
                let f = funnel.clone();
                s.spawn(move || {
                    f.on_new_file(id, "x.blk");
                    for p in [0, 50, 100] {
                        f.on_progress(id, "Pass 1", p);
                    }
                    f.on_complete(id, "Pass 2", "passed");
                });
            }
        });
        drop(funnel);
        sink.join().unwrap();

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 4 * 5);
        for id in 0..4 {
            let mine: Vec<_> = events
                .iter()
                .filter(|e| match e {
                    ProgressEvent::NewFile { id: i, .. }
                    | ProgressEvent::Progress { id: i, .. }
                    | ProgressEvent::Complete { id: i, .. } => *i == id,
                })
                .collect();
            assert!(matches!(mine[0], ProgressEvent::NewFile { .. }));
            assert!(matches!(mine[4], ProgressEvent::Complete { .. }));
        }
    }
}
