//! Lock coordinator
//!
//! One task per (script, process) exclusively owns the lock state
//! machine. Commands from consumers, heartbeat ticks, and realtime
//! change events all arrive through the same `select!` loop, so the
//! independent asynchronous sources can never interleave a state update.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use quill_common::{EditSession, QuillError};
use quill_persistence::{LockChangeEvent, LockChangeKind, LockPersistence};

use crate::model::{LockState, LockStatus, RemoteHolder};
use crate::service::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatSchedule};

/// Tuning knobs for a coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

pub(crate) enum Command {
    Release(oneshot::Sender<anyhow::Result<()>>),
    Reacquire(oneshot::Sender<()>),
    ForceUnlock(oneshot::Sender<anyhow::Result<()>>),
    Shutdown,
}

/// Cloneable consumer handle to a running coordinator.
///
/// Every clone observes the same state snapshots; commands funnel into
/// the single owning task.
#[derive(Clone)]
pub struct LockHandle {
    script_id: Arc<str>,
    session: Arc<EditSession>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LockState>,
}

impl LockHandle {
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    pub fn session(&self) -> &EditSession {
        &self.session
    }

    pub fn state(&self) -> LockState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> LockStatus {
        self.state.borrow().status
    }

    pub fn held_by(&self) -> Option<RemoteHolder> {
        self.state.borrow().held_by.clone()
    }

    /// Watch receiver for state transitions. All consumers of one
    /// coordinator share the same underlying channel.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.clone()
    }

    /// Give the lock up. Best-effort against the store; local state
    /// moves to `Unlocked` regardless.
    pub async fn release(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Release(tx))?;
        rx.await.map_err(|_| coordinator_stopped())?
    }

    /// Leave `Unlocked` (or contend from `Locked`) by re-entering the
    /// acquisition flow.
    pub async fn request_reacquire(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reacquire(tx))?;
        rx.await.map_err(|_| coordinator_stopped())
    }

    /// Administrative override: delete the lock record regardless of
    /// holder. Requires a session with the admin capability.
    pub async fn force_unlock(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ForceUnlock(tx))?;
        rx.await.map_err(|_| coordinator_stopped())?
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| coordinator_stopped())
    }
}

fn coordinator_stopped() -> anyhow::Error {
    anyhow::anyhow!("lock coordinator stopped")
}

/// The per-script coordinator actor
pub struct LockCoordinator {
    script_id: String,
    session: EditSession,
    store: Arc<dyn LockPersistence>,
    events: broadcast::Receiver<LockChangeEvent>,
    events_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<LockState>,
    heartbeat: HeartbeatSchedule,
    status: LockStatus,
    held_by: Option<RemoteHolder>,
    /// Completion time of the last successful direct store call. A
    /// direct result reflects a committed point in store state, so any
    /// event stamped at or before it is stale and must be ignored
    /// (realtime delivery is at-least-once and may lag).
    last_direct_at: DateTime<Utc>,
}

impl LockCoordinator {
    /// Spawn the actor and return the consumer handle. The initial
    /// acquire runs before the first message is processed.
    pub fn spawn(
        script_id: impl Into<String>,
        session: EditSession,
        store: Arc<dyn LockPersistence>,
        events: broadcast::Receiver<LockChangeEvent>,
        config: CoordinatorConfig,
    ) -> LockHandle {
        let script_id = script_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LockState::checking(&script_id));

        let handle = LockHandle {
            script_id: Arc::from(script_id.as_str()),
            session: Arc::new(session.clone()),
            commands: cmd_tx,
            state: state_rx,
        };

        let actor = Self {
            script_id,
            session,
            store,
            events,
            events_open: true,
            commands: cmd_rx,
            state_tx,
            heartbeat: HeartbeatSchedule::new(config.heartbeat_interval),
            status: LockStatus::Checking,
            held_by: None,
            last_direct_at: Utc::now(),
        };
        tokio::spawn(actor.run());

        handle
    }

    async fn run(mut self) {
        self.try_acquire().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = self.heartbeat.tick() => self.on_heartbeat().await,
                event = self.events.recv(), if self.events_open => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => self.resync(missed).await,
                    Err(broadcast::error::RecvError::Closed) => {
                        // Bus gone; heartbeat and commands keep working
                        self.events_open = false;
                    }
                },
            }
        }

        self.teardown().await;
    }

    fn set_state(&mut self, status: LockStatus, held_by: Option<RemoteHolder>) {
        if self.status == status && self.held_by == held_by {
            return;
        }
        debug!(
            script_id = %self.script_id,
            from = ?self.status,
            to = ?status,
            "lock state transition"
        );
        self.status = status;
        self.held_by = held_by.clone();
        let _ = self.state_tx.send(LockState {
            script_id: self.script_id.clone(),
            status,
            held_by,
        });
    }

    fn mark_direct(&mut self) {
        self.last_direct_at = Utc::now();
    }

    fn own_holder(&self) -> RemoteHolder {
        RemoteHolder::new(&self.session.holder_id, &self.session.holder_name)
    }

    async fn try_acquire(&mut self) {
        self.set_state(LockStatus::Checking, None);

        match self.store.acquire(&self.script_id, &self.session).await {
            Ok(outcome) => {
                self.mark_direct();
                if outcome.acquired {
                    info!(script_id = %self.script_id, "script lock acquired");
                    self.heartbeat.restart();
                    let holder = self.own_holder();
                    self.set_state(LockStatus::Acquired, Some(holder));
                } else {
                    debug!(
                        script_id = %self.script_id,
                        holder = %outcome.holder_name,
                        "script lock held elsewhere"
                    );
                    let holder = RemoteHolder::new(outcome.holder_id, outcome.holder_name);
                    self.set_state(LockStatus::Locked, Some(holder));
                }
            }
            Err(err) => {
                warn!(
                    script_id = %self.script_id,
                    error = %err,
                    "lock store unavailable during acquire"
                );
                self.set_state(LockStatus::Unlocked, None);
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.status != LockStatus::Acquired {
            return;
        }

        match self
            .store
            .heartbeat(&self.script_id, &self.session.holder_id)
            .await
        {
            Ok(true) => {
                self.mark_direct();
            }
            Ok(false) => {
                self.mark_direct();
                warn!(
                    script_id = %self.script_id,
                    "heartbeat rejected; lock ownership lost"
                );
                self.set_state(LockStatus::Unlocked, None);
                // One automatic recovery attempt; renewed denial settles
                // in Locked, renewed transport failure in Unlocked
                self.try_acquire().await;
            }
            Err(err) => {
                // Transient store failure: keep the lock, beat again on
                // the next scheduled tick
                warn!(
                    script_id = %self.script_id,
                    error = %err,
                    "heartbeat failed; retrying on next tick"
                );
            }
        }
    }

    async fn on_event(&mut self, event: LockChangeEvent) {
        if event.script_id != self.script_id {
            return;
        }
        if event.at <= self.last_direct_at {
            debug!(
                script_id = %self.script_id,
                kind = %event.kind,
                "ignoring stale realtime event"
            );
            return;
        }

        match event.kind {
            LockChangeKind::Insert | LockChangeKind::Update => {
                let Some(record) = event.record else { return };
                if record.holder_id == self.session.holder_id {
                    // Our own write echoed back
                    return;
                }
                match self.status {
                    LockStatus::Acquired => {
                        // Unreachable with an atomic store; demote rather
                        // than risk two writers
                        warn!(
                            script_id = %self.script_id,
                            holder = %record.holder_name,
                            "lock reassigned while held; treating as lost"
                        );
                        let holder = RemoteHolder::from(&record);
                        self.set_state(LockStatus::Locked, Some(holder));
                    }
                    LockStatus::Locked => {
                        // Refresh the displayed holder
                        let holder = RemoteHolder::from(&record);
                        self.set_state(LockStatus::Locked, Some(holder));
                    }
                    LockStatus::Checking | LockStatus::Unlocked => {}
                }
            }
            LockChangeKind::Delete => match self.status {
                LockStatus::Locked => {
                    debug!(
                        script_id = %self.script_id,
                        "lock released remotely; attempting acquisition"
                    );
                    self.try_acquire().await;
                }
                LockStatus::Acquired => {
                    warn!(
                        script_id = %self.script_id,
                        "lock record deleted while held (force-unlock observed)"
                    );
                    self.set_state(LockStatus::Unlocked, None);
                }
                LockStatus::Checking | LockStatus::Unlocked => {}
            },
        }
    }

    /// The broadcast channel dropped events for us; the store is the
    /// only trustworthy source now.
    async fn resync(&mut self, missed: u64) {
        warn!(
            script_id = %self.script_id,
            missed,
            "realtime channel lagged; resynchronizing from store"
        );

        match self.store.find_one(&self.script_id).await {
            Ok(record) => {
                self.mark_direct();
                match (self.status, record) {
                    (LockStatus::Acquired, Some(record))
                        if record.holder_id == self.session.holder_id => {}
                    (LockStatus::Acquired, _) => {
                        warn!(
                            script_id = %self.script_id,
                            "lock lost while realtime lagged"
                        );
                        self.set_state(LockStatus::Unlocked, None);
                        self.try_acquire().await;
                    }
                    (LockStatus::Locked, None) => self.try_acquire().await,
                    (LockStatus::Locked, Some(record)) => {
                        let holder = RemoteHolder::from(&record);
                        self.set_state(LockStatus::Locked, Some(holder));
                    }
                    _ => {}
                }
            }
            Err(err) => {
                warn!(
                    script_id = %self.script_id,
                    error = %err,
                    "lock store unavailable during resync; state unchanged"
                );
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Release(reply) => {
                let result = self.do_release().await;
                let _ = reply.send(result);
            }
            Command::Reacquire(reply) => {
                if matches!(self.status, LockStatus::Unlocked | LockStatus::Locked) {
                    self.try_acquire().await;
                }
                let _ = reply.send(());
            }
            Command::ForceUnlock(reply) => {
                let result = self.do_force_unlock().await;
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn do_release(&mut self) -> anyhow::Result<()> {
        if self.status != LockStatus::Acquired {
            return Ok(());
        }

        match self
            .store
            .release(&self.script_id, &self.session.holder_id)
            .await
        {
            Ok(released) => {
                self.mark_direct();
                if !released {
                    debug!(script_id = %self.script_id, "release found no owned record");
                }
            }
            Err(err) => {
                // Best effort; expiry reclaims the record if this failed
                warn!(script_id = %self.script_id, error = %err, "release failed");
            }
        }
        self.set_state(LockStatus::Unlocked, None);
        Ok(())
    }

    async fn do_force_unlock(&mut self) -> anyhow::Result<()> {
        if !self.session.admin {
            return Err(QuillError::PermissionDenied(format!(
                "force-unlock of '{}' requires an administrative session",
                self.script_id
            ))
            .into());
        }

        let removed = self.store.force_unlock(&self.script_id).await?;
        self.mark_direct();
        info!(script_id = %self.script_id, removed, "force-unlock executed");

        match self.status {
            // Freed someone else's lock: contend for it right away
            LockStatus::Locked => self.try_acquire().await,
            LockStatus::Acquired => self.set_state(LockStatus::Unlocked, None),
            _ => {}
        }
        Ok(())
    }

    async fn teardown(mut self) {
        if self.status == LockStatus::Acquired {
            // Best effort, not retried; expiry is the backstop
            match self
                .store
                .release(&self.script_id, &self.session.holder_id)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        script_id = %self.script_id,
                        error = %err,
                        "release on teardown failed"
                    );
                }
            }
        }
        self.set_state(LockStatus::Unlocked, None);
        debug!(script_id = %self.script_id, "lock coordinator stopped");
    }
}
