//! Background push of cached snapshots
//!
//! A single task owns the push schedule. [`SyncHandle::submit`] writes the
//! snapshot to the [`LocalCache`] before anything is sent, so an edit
//! survives a failed push or a restart. Each report has at most one
//! scheduled push; a newer submit replaces it and resets its retry count.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use laudo_core::{ControlNumber, LocalSnapshot};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, LocalCache};
use crate::error::SyncError;
use crate::remote::{Remote, SyncPayload};

/// Timing of the sync worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last submit before pushing
    pub debounce: Duration,
    /// Delay before the first retry; doubles per failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

enum Command {
    Submit(CacheEntry),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Client side of a running [`SyncWorker`]
#[derive(Debug, Clone)]
pub struct SyncHandle {
    cache: LocalCache,
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncHandle {
    /// Cache a snapshot and schedule its push.
    ///
    /// Returns once the snapshot is on disk. A snapshot without a timestamp
    /// is stamped now.
    pub async fn submit(
        &self,
        report_id: i64,
        controle: ControlNumber,
        mut snapshot: LocalSnapshot,
    ) -> Result<(), SyncError> {
        if snapshot.updated_at.is_none() {
            snapshot.updated_at = Some(Utc::now());
        }
        let entry = CacheEntry {
            report_id,
            controle,
            snapshot,
            synced: false,
        };
        // Queued under the cache lock so the worker sees submits in the
        // order they reached disk
        let commands = &self.commands;
        self.cache
            .save_then(&entry, || commands.send(Command::Submit(entry.clone())))
            .await?
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Push every scheduled snapshot now, ignoring debounce and backoff, and
    /// wait for the attempt to finish
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .map_err(|_| SyncError::WorkerStopped)?;
        done.await.map_err(|_| SyncError::WorkerStopped)
    }

    /// Flush, then stop the worker. Snapshots that still fail stay in the
    /// cache and are replayed by the next [`SyncWorker::start`].
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(ack))
            .map_err(|_| SyncError::WorkerStopped)?;
        done.await.map_err(|_| SyncError::WorkerStopped)
    }
}

struct Scheduled {
    entry: CacheEntry,
    due: Instant,
    /// Failed pushes of this snapshot so far
    attempt: u32,
}

pub struct SyncWorker<R> {
    cache: LocalCache,
    remote: R,
    config: SyncConfig,
    scheduled: HashMap<i64, Scheduled>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<R: Remote + 'static> SyncWorker<R> {
    /// Spawn the worker task.
    ///
    /// Entries an earlier run left unsynced are pushed straight away.
    pub async fn start(
        cache: LocalCache,
        remote: R,
        config: SyncConfig,
    ) -> Result<(SyncHandle, JoinHandle<()>), SyncError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut worker = SyncWorker {
            cache: cache.clone(),
            remote,
            config,
            scheduled: HashMap::new(),
            commands: receiver,
        };

        let pending = cache.pending().await?;
        if !pending.is_empty() {
            info!(
                "Replaying {} unsynced reports from {}",
                pending.len(),
                cache.dir().display()
            );
        }
        let now = Instant::now();
        for entry in pending {
            worker.scheduled.insert(
                entry.report_id,
                Scheduled {
                    entry,
                    due: now,
                    attempt: 0,
                },
            );
        }

        let task = tokio::spawn(worker.run());
        let handle = SyncHandle {
            cache,
            commands: sender,
        };
        Ok((handle, task))
    }

    async fn run(mut self) {
        loop {
            let next_due = self.scheduled.values().map(|s| s.due).min();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(entry)) => self.schedule(entry),
                    Some(Command::Flush(ack)) => {
                        self.push_all().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.push_all().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.push_all().await;
                        break;
                    }
                },
                _ = wait_until(next_due) => self.push_due().await,
            }
        }
        debug!("Sync worker stopped");
    }

    fn schedule(&mut self, entry: CacheEntry) {
        if self.scheduled.contains_key(&entry.report_id) {
            debug!("Superseding scheduled push of {}", entry.controle);
        }
        let due = Instant::now() + self.config.debounce;
        self.scheduled.insert(
            entry.report_id,
            Scheduled {
                entry,
                due,
                attempt: 0,
            },
        );
    }

    async fn push_due(&mut self) {
        let now = Instant::now();
        let due: Vec<i64> = self
            .scheduled
            .iter()
            .filter(|(_, s)| s.due <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.push(id).await;
        }
    }

    async fn push_all(&mut self) {
        let all: Vec<i64> = self.scheduled.keys().copied().collect();
        for id in all {
            self.push(id).await;
        }
    }

    async fn push(&mut self, report_id: i64) {
        let Some(mut scheduled) = self.scheduled.remove(&report_id) else {
            return;
        };
        let control = scheduled.entry.controle;
        let payload = SyncPayload::from(&scheduled.entry.snapshot);

        match self.remote.put_report(report_id, &payload).await {
            Ok(()) => {
                let stamp = scheduled.entry.snapshot.updated_at;
                match self.cache.mark_synced(&control, stamp).await {
                    Ok(_) => info!("Synced {}", control),
                    Err(e) => warn!("Synced {} but could not update the cache: {}", control, e),
                }
            }
            Err(e) if e.is_retryable() => {
                scheduled.attempt += 1;
                let delay = self.config.backoff(scheduled.attempt);
                warn!(
                    "Push of {} failed (attempt {}): {}; retrying in {:?}",
                    control, scheduled.attempt, e, delay
                );
                scheduled.due = Instant::now() + delay;
                self.scheduled.insert(report_id, scheduled);
            }
            Err(e) => {
                warn!("Giving up on {}: {}; it stays in the local cache", control, e);
            }
        }
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => std::future::pending().await,
    }
}
