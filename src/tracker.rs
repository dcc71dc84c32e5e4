//! Read-only projection of run state for external status queries.
//!
//! The tracker is a downstream consumer of the engine's event stream: it
//! subscribes to run transitions and stage commits and folds them into its
//! own table of [`RunStatusView`]s. It never mutates run state and holds no
//! reference to the engine, so a dashboard or API layer can query it without
//! touching the orchestration path.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::task;

use crate::event_bus::Event;
use crate::run::{RunId, RunStatus, RunStatusView};

/// Event-fed status projection.
pub struct StatusTracker {
    views: Arc<Mutex<FxHashMap<RunId, RunStatusView>>>,
    ingest: task::JoinHandle<()>,
}

impl StatusTracker {
    /// Starts a tracker ingesting from an engine event subscription
    /// (see [`ExecutionEngine::subscribe`](crate::engine::ExecutionEngine::subscribe)).
    #[must_use]
    pub fn spawn(events: flume::Receiver<Event>) -> Self {
        let views: Arc<Mutex<FxHashMap<RunId, RunStatusView>>> =
            Arc::new(Mutex::new(FxHashMap::default()));
        let table = Arc::clone(&views);
        let ingest = task::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                Self::apply(&table, &event);
            }
        });
        Self { views, ingest }
    }

    fn apply(table: &Mutex<FxHashMap<RunId, RunStatusView>>, event: &Event) {
        match event {
            Event::Run(run) => {
                let mut views = table.lock();
                let view = views
                    .entry(run.run_id.clone())
                    .or_insert_with(|| RunStatusView {
                        run_id: run.run_id.clone(),
                        status: run.status,
                        current_stage: None,
                        error: None,
                        artifacts: Vec::new(),
                        created_at: run.when,
                        finished_at: None,
                    });
                view.status = run.status;
                if run.stage.is_some() {
                    view.current_stage = run.stage.clone();
                }
                if run.error.is_some() {
                    view.error = run.error.clone();
                }
                if run.status.is_terminal() {
                    view.finished_at = Some(run.when);
                }
            }
            Event::Stage(stage) => {
                let mut views = table.lock();
                if let Some(view) = views.get_mut(&stage.run_id) {
                    view.current_stage = Some(stage.stage.clone());
                    view.artifacts.extend(stage.artifacts.iter().cloned());
                }
            }
            Event::Diagnostic(_) => {}
        }
    }

    /// Current projection of a run, if any events for it have been seen.
    #[must_use]
    pub fn status(&self, run_id: &str) -> Option<RunStatusView> {
        self.views.lock().get(run_id).cloned()
    }

    /// All tracked runs, most recently created first.
    #[must_use]
    pub fn list(&self) -> Vec<RunStatusView> {
        let mut views: Vec<RunStatusView> = self.views.lock().values().cloned().collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        views
    }

    /// Runs currently in a given status.
    #[must_use]
    pub fn with_status(&self, status: RunStatus) -> Vec<RunStatusView> {
        self.views
            .lock()
            .values()
            .filter(|view| view.status == status)
            .cloned()
            .collect()
    }
}

impl Drop for StatusTracker {
    fn drop(&mut self) {
        self.ingest.abort();
    }
}
