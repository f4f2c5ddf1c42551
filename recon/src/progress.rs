use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Progress,
    Artifact,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReconEvent {
    pub kind: EventKind,
    pub stage: String,
    pub ts_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Forwards events of one run to a caller supplied callback. A panicking
/// callback is logged and otherwise ignored.
pub struct Reporter<'a> {
    stage: String,
    emit: &'a mut dyn FnMut(&ReconEvent),
}

impl<'a> Reporter<'a> {
    pub fn new(stage: &str, emit: &'a mut dyn FnMut(&ReconEvent)) -> Self {
        Reporter {
            stage: stage.to_string(),
            emit,
        }
    }

    fn event(&self, kind: EventKind) -> ReconEvent {
        ReconEvent {
            kind,
            stage: self.stage.clone(),
            ts_ns: now_ns(),
            message: None,
            progress: None,
            artifact: None,
        }
    }

    fn send(&mut self, event: ReconEvent) {
        let emit = &mut self.emit;
        if catch_unwind(AssertUnwindSafe(|| emit(&event))).is_err() {
            warn!("progress callback failed on {:?} event", event.kind);
        }
    }

    pub fn log(&mut self, message: &str) {
        info!("{}", message);
        let mut event = self.event(EventKind::Log);
        event.message = Some(message.to_string());
        self.send(event);
    }

    /// Reports the fraction of work done, clamped to [0, 1]. A message
    /// goes out as a log event first.
    pub fn progress(&mut self, value: f64, message: Option<&str>) {
        if let Some(message) = message {
            self.log(message);
        }
        let mut event = self.event(EventKind::Progress);
        event.progress = Some(if value.is_nan() {
            0.0
        } else {
            value.max(0.0).min(1.0)
        });
        event.message = message.map(str::to_string);
        self.send(event);
    }

    pub fn artifact(&mut self, name: &str, path: &Path) {
        let mut event = self.event(EventKind::Artifact);
        event.artifact = Some(Artifact {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        self.send(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_events_are_clamped_and_tagged() {
        let mut events = vec![];
        let mut emit = |e: &ReconEvent| events.push(e.clone());
        let mut reporter = Reporter::new("rebuild", &mut emit);
        reporter.progress(1.7, Some("done"));
        reporter.progress(-0.5, None);
        reporter.artifact("mesh", Path::new("/tmp/model.glb"));
        drop(reporter);

        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, EventKind::Log);
        assert_eq!(events[0].message.as_deref(), Some("done"));
        assert_eq!(events[1].kind, EventKind::Progress);
        assert_eq!(events[1].progress, Some(1.0));
        assert_eq!(events[2].progress, Some(0.0));
        assert_eq!(events[3].artifact.as_ref().unwrap().name, "mesh");
        assert!(events.iter().all(|e| e.stage == "rebuild"));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut calls = 0;
        let mut emit = |_: &ReconEvent| {
            calls += 1;
            panic!("callback failure");
        };
        let mut reporter = Reporter::new("rebuild", &mut emit);
        reporter.progress(0.5, Some("halfway"));
        reporter.progress(0.6, None);
        drop(reporter);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_event_serialization() {
        let event = ReconEvent {
            kind: EventKind::Progress,
            stage: "rebuild".to_string(),
            ts_ns: 7,
            message: None,
            progress: Some(0.25),
            artifact: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "progress",
                "stage": "rebuild",
                "ts_ns": 7,
                "progress": 0.25,
            })
        );
    }
}
