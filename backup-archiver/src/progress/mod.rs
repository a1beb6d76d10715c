//! Pipeline lifecycle events and the observers that render them.
//!
//! Stages emit [`PipelineEvent`]s through an [`ObserverSet`] handed to them
//! explicitly; they never know how (or whether) the events are displayed.

pub mod channel;
pub mod console;
pub mod format;

pub use channel::ChannelObserver;
pub use console::ConsoleObserver;
pub use format::{format_bytes, format_duration, format_speed, ThroughputMeter};

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Stages of one backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Walking,
    CheckingSpace,
    Compressing,
    Finalizing,
}

impl Phase {
    /// Short tag used to prefix console lines
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Walking => "walk",
            Phase::CheckingSpace => "space",
            Phase::Compressing => "compress",
            Phase::Finalizing => "manifest",
        }
    }
}

/// Events emitted while a backup runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    #[serde(rename = "run:started")]
    RunStarted {
        output: String,
        preferred_format: String,
        strategy: String,
    },

    #[serde(rename = "run:phase")]
    PhaseChanged(Phase),

    /// Files and bytes enumerated so far
    #[serde(rename = "walk:progress")]
    EnumerationProgress { files: u64, bytes: u64 },

    #[serde(rename = "walk:warning")]
    WalkWarning { path: String, reason: String },

    #[serde(rename = "space:checked")]
    SpaceChecked { required: u64, available: u64 },

    #[serde(rename = "compress:started")]
    CompressionStarted {
        strategy: String,
        format: String,
        files: u64,
        bytes: u64,
    },

    #[serde(rename = "compress:progress")]
    CompressionProgress(CompressionProgressPayload),

    /// A file disappeared or became unreadable between walk and compression
    #[serde(rename = "compress:skipped")]
    EntrySkipped { path: String, reason: String },

    #[serde(rename = "compress:finished")]
    CompressionFinished {
        output: String,
        size_bytes: u64,
        elapsed_secs: f64,
    },

    #[serde(rename = "run:completed")]
    RunCompleted {
        output: String,
        manifest: String,
        files: u64,
        bytes: u64,
        size_bytes: u64,
        elapsed_secs: f64,
    },

    #[serde(rename = "run:failed")]
    RunFailed { phase: Phase, error: String },
}

/// Progress of the in-process archiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionProgressPayload {
    pub files_done: u64,
    pub bytes_done: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub current_file: Option<String>,
}

impl CompressionProgressPayload {
    pub fn percent(&self) -> f64 {
        if self.total_bytes > 0 {
            ((self.bytes_done as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_files > 0 {
            (self.files_done as f64 / self.total_files as f64) * 100.0
        } else {
            100.0
        }
    }
}

/// Sink for pipeline events
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent) -> anyhow::Result<()>;
}

/// Explicit list of observers attached to one run
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Deliver an event to every observer. A failing or panicking observer
    /// is logged and skipped; delivery to the others continues.
    pub fn notify(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Progress observer failed: {:#}", e),
                Err(_) => warn!("Progress observer panicked"),
            }
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl ProgressObserver for Recorder {
        fn on_event(&self, event: &PipelineEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(serde_json::to_string(event)?);
            Ok(())
        }
    }

    struct Failing;

    impl ProgressObserver for Failing {
        fn on_event(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    struct Panicking;

    impl ProgressObserver for Panicking {
        fn on_event(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
            panic!("observer bug")
        }
    }

    #[test]
    fn test_failing_observers_do_not_stop_delivery() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut set = ObserverSet::new();
        set.push(Arc::new(Failing));
        set.push(Arc::new(Panicking));
        set.push(recorder.clone());

        set.notify(&PipelineEvent::PhaseChanged(Phase::Walking));
        set.notify(&PipelineEvent::EnumerationProgress { files: 1000, bytes: 42 });

        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::EnumerationProgress { files: 2000, bytes: 1024 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("walk:progress"));
        assert!(json.contains("2000"));

        let phase = serde_json::to_string(&PipelineEvent::PhaseChanged(Phase::CheckingSpace)).unwrap();
        assert_eq!(phase, r#"{"type":"run:phase","payload":"checking_space"}"#);
    }

    #[test]
    fn test_compression_percent() {
        let mut payload = CompressionProgressPayload {
            files_done: 1,
            bytes_done: 50,
            total_files: 2,
            total_bytes: 200,
            bytes_per_second: 0,
            current_file: None,
        };
        assert!((payload.percent() - 25.0).abs() < 0.01);

        payload.total_bytes = 0;
        assert!((payload.percent() - 50.0).abs() < 0.01);

        payload.total_files = 0;
        assert!((payload.percent() - 100.0).abs() < 0.01);
    }
}
