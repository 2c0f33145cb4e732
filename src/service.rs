use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, anyhow};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    accumulator::SystemClock,
    config::Config,
    correlator::{CaptureEvent, Correlator, CorrelatorSettings},
    entry::{FinalizedEntry, TabId},
    history::HistoryStore,
    persistence::{self, PersistenceBridge},
    storage::SqliteArea,
};

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug)]
enum Command {
    Event(CaptureEvent),
    Entries {
        tab_id: TabId,
        reply: oneshot::Sender<Vec<FinalizedEntry>>,
    },
    Clear {
        tab_id: TabId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable sender side of the correlator service.
#[derive(Debug, Clone)]
pub struct CorrelatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CorrelatorHandle {
    pub async fn send(&self, event: CaptureEvent) -> anyhow::Result<()> {
        self.command(Command::Event(event)).await
    }

    pub async fn entries(&self, tab_id: TabId) -> anyhow::Result<Vec<FinalizedEntry>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Entries { tab_id, reply }).await?;
        rx.await.context("correlator service dropped entries reply")
    }

    pub async fn clear_entries(&self, tab_id: TabId) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Clear { tab_id, reply }).await?;
        rx.await.context("correlator service dropped clear reply")
    }

    /// Stops the service after every command queued before this one is applied.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.command(Command::Shutdown).await
    }

    async fn command(&self, command: Command) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("correlator service stopped"))
    }
}

/// Moves `correlator` into a task that applies commands in arrival order and
/// sweeps idle requests every `sweep_interval`. The task hands the correlator
/// back once it stops.
pub fn spawn(
    mut correlator: Correlator,
    sweep_interval: Duration,
) -> (CorrelatorHandle, JoinHandle<Correlator>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let join = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Event(event) => correlator.apply(event),
                        Command::Entries { tab_id, reply } => {
                            let _ = reply.send(correlator.entries(tab_id));
                        }
                        Command::Clear { tab_id, reply } => {
                            let _ = reply.send(correlator.clear_entries(tab_id));
                        }
                        Command::Shutdown => break,
                    }
                }
                _ = sweep.tick() => {
                    correlator.sweep_idle();
                }
            }
        }

        tracing::debug!(pending = correlator.pending_len(), "correlator service stopped");
        correlator
    });
    (CorrelatorHandle { tx }, join)
}

/// A running correlator with its optional durable writer.
#[derive(Debug)]
pub struct RunningService {
    handle: CorrelatorHandle,
    join: JoinHandle<Correlator>,
    writer: Option<JoinHandle<()>>,
}

impl RunningService {
    pub fn handle(&self) -> CorrelatorHandle {
        self.handle.clone()
    }

    /// Stops the service and waits for the final snapshot to reach storage.
    pub async fn shutdown(self) -> anyhow::Result<HistoryStore> {
        let Self {
            handle,
            join,
            writer,
        } = self;
        if handle.shutdown().await.is_err() {
            tracing::debug!("correlator service already stopped");
        }
        drop(handle);

        let correlator = join.await.context("join correlator service")?;
        let history = correlator.history().clone();
        drop(correlator);

        if let Some(writer) = writer {
            writer.await.context("join capture history writer")?;
        }
        Ok(history)
    }
}

/// Loads persisted history (when storage is configured) and starts the service.
pub async fn start(config: &Config) -> anyhow::Result<RunningService> {
    let settings = CorrelatorSettings::from_config(config);

    let (history, writer) = match (config.storage_path()?, config.storage.as_ref()) {
        (Some(path), Some(storage)) => {
            let area = SqliteArea::open(path.clone())
                .with_context(|| format!("open capture store {}", path.display()))?;
            let bridge = PersistenceBridge::new(Arc::new(area), storage.timeout());
            let history =
                HistoryStore::from_persisted(bridge.load_all().await, settings.max_entries_per_tab);
            tracing::info!(
                path = %path.display(),
                tabs = history.tab_ids().count(),
                "capture store opened"
            );
            (history, Some(persistence::spawn_writer(bridge)))
        }
        _ => {
            tracing::info!("storage not configured; capture history is in-memory only");
            (HistoryStore::new(settings.max_entries_per_tab), None)
        }
    };

    let mut correlator = Correlator::new(Box::new(SystemClock), settings, history);
    let writer = match writer {
        Some((persistence, join)) => {
            correlator = correlator.with_persistence(persistence);
            Some(join)
        }
        None => None,
    };

    let (handle, join) = spawn(correlator, config.capture.sweep_interval());
    Ok(RunningService {
        handle,
        join,
        writer,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{spawn, start};
    use crate::{
        accumulator::{ManualClock, RequestStart},
        config::Config,
        correlator::{CaptureEvent, Correlator, CorrelatorSettings},
        history::HistoryStore,
    };

    fn start_event(request_id: &str, tab_id: i64) -> CaptureEvent {
        CaptureEvent::RequestStart(RequestStart {
            request_id: request_id.to_owned(),
            tab_id,
            url: format!("https://app.test/{request_id}"),
            method: "GET".to_owned(),
            timestamp_ms: 0.0,
            resource_type: "fetch".to_owned(),
            frame_id: 0,
            request_body: None,
        })
    }

    fn succeeded(request_id: &str) -> CaptureEvent {
        CaptureEvent::RequestSucceeded {
            request_id: request_id.to_owned(),
            timestamp_ms: 12.0,
            from_cache: false,
            server_ip: None,
        }
    }

    fn correlator(clock: &ManualClock, settings: CorrelatorSettings) -> Correlator {
        Correlator::new(
            Box::new(clock.clone()),
            settings,
            HistoryStore::new(settings.max_entries_per_tab),
        )
    }

    #[tokio::test]
    async fn commands_are_applied_in_arrival_order() {
        let clock = ManualClock::at(0.0);
        let (handle, join) = spawn(
            correlator(&clock, CorrelatorSettings::default()),
            Duration::from_secs(30),
        );

        handle.send(start_event("r1", 3)).await.unwrap();
        handle.send(succeeded("r1")).await.unwrap();
        let entries = handle.entries(3).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].elapsed_ms, 12.0);

        assert!(handle.clear_entries(3).await.unwrap());
        assert!(!handle.clear_entries(3).await.unwrap());
        assert!(handle.entries(3).await.unwrap().is_empty());

        drop(handle);
        let correlator = join.await.unwrap();
        assert!(correlator.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_evicts_idle_requests() {
        let clock = ManualClock::at(0.0);
        let mut settings = CorrelatorSettings::default();
        settings.accumulator.pending_idle_ms = 1_000;
        let (handle, join) = spawn(correlator(&clock, settings), Duration::from_millis(50));

        handle.send(start_event("stale", 1)).await.unwrap();
        assert!(handle.entries(1).await.unwrap().is_empty());
        clock.advance(5_000.0);
        tokio::time::sleep(Duration::from_millis(60)).await;

        handle.send(succeeded("stale")).await.unwrap();
        assert!(handle.entries(1).await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        let correlator = join.await.unwrap();
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn handles_fail_once_the_service_stops() {
        let clock = ManualClock::at(0.0);
        let (handle, join) = spawn(
            correlator(&clock, CorrelatorSettings::default()),
            Duration::from_secs(30),
        );

        handle.shutdown().await.unwrap();
        join.await.unwrap();

        let err = handle.entries(1).await.unwrap_err();
        assert!(err.to_string().contains("stopped"), "unexpected error: {err:#}");
    }

    #[tokio::test]
    async fn started_service_persists_and_reloads_history() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("capture.db");
        let config = Config::from_toml_str(&format!(
            "[storage]\npath = \"{}\"\n",
            db_path.display()
        ))
        .unwrap();

        let running = start(&config).await.unwrap();
        let handle = running.handle();
        handle.send(start_event("r1", 8)).await.unwrap();
        handle.send(succeeded("r1")).await.unwrap();
        drop(handle);
        let history = running.shutdown().await.unwrap();
        assert_eq!(history.len(8), 1);

        let reopened = start(&config).await.unwrap();
        let entries = reopened.handle().entries(8).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request.url, "https://app.test/r1");
        reopened.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn service_without_storage_runs_in_memory() {
        let running = start(&Config::default()).await.unwrap();
        let handle = running.handle();
        handle.send(start_event("r1", 2)).await.unwrap();
        handle.send(succeeded("r1")).await.unwrap();
        assert_eq!(handle.entries(2).await.unwrap().len(), 1);
        drop(handle);

        let history = running.shutdown().await.unwrap();
        assert_eq!(history.len(2), 1);
    }
}
