//! Routing maintenance daemons and their owning service.
//!
//! Introduction: runs a pass, then sleeps on a doubling ramp that starts at
//! the floor and is capped at the ceiling. With one neighbour or none it
//! has nobody to gossip with and wakes Reunion instead.
//!
//! Reunion: sleeps for the reunion interval (or until woken), then pings
//! every remembered peer that is not currently a neighbour.
//!
//! Each daemon is a task fed by an mpsc command channel and publishing its
//! status on a watch channel. Commands are only looked at while sleeping, so
//! a pass in progress always runs to completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use trellis_core::envelope::unix_millis;

use crate::routing::{IntroductionPass, RoutingProtocol};

const COMMAND_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    Wake,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Running,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub phase: DaemonPhase,
    pub runs: u64,
    pub last_run_ms: Option<u64>,
    pub last_duration: Option<Duration>,
    pub next_wakeup_ms: Option<u64>,
    /// Current sleep interval. For Introduction this is the ramp position.
    pub interval: Duration,
}

impl DaemonStatus {
    fn new(interval: Duration) -> Self {
        Self {
            phase: DaemonPhase::Running,
            runs: 0,
            last_run_ms: None,
            last_duration: None,
            next_wakeup_ms: None,
            interval,
        }
    }
}

/// Doubling back-off: after N advances the interval is
/// `min(floor × 2^N, ceiling)`.
#[derive(Debug, Clone, Copy)]
pub struct IntroductionRamp {
    current: Duration,
}

impl IntroductionRamp {
    pub fn new(floor: Duration) -> Self {
        Self { current: floor }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self, ceiling: Duration) -> Duration {
        self.current = self.current.saturating_mul(2).min(ceiling);
        self.current
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("routing maintenance already running")]
    AlreadyRunning,
    #[error("routing maintenance has been stopped")]
    Stopped,
}

struct DaemonHandle {
    commands: mpsc::Sender<DaemonCommand>,
    status: watch::Receiver<DaemonStatus>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    fn wake(&self) -> bool {
        self.commands.try_send(DaemonCommand::Wake).is_ok()
    }

    async fn stop(self, name: &str) {
        let _ = self.commands.send(DaemonCommand::Stop).await;
        if let Err(e) = self.task.await {
            tracing::error!(daemon = name, error = %e, "daemon task failed");
        }
    }
}

enum Lifecycle {
    NotStarted,
    Running {
        introduction: DaemonHandle,
        reunion: DaemonHandle,
    },
    Stopped,
}

/// Owns the two daemons. `NotStarted → Running → Stopped`; a stopped
/// service cannot be restarted.
pub struct RoutingService {
    protocol: Arc<RoutingProtocol>,
    state: Lifecycle,
}

impl RoutingService {
    pub fn new(protocol: Arc<RoutingProtocol>) -> Self {
        Self {
            protocol,
            state: Lifecycle::NotStarted,
        }
    }

    pub fn protocol(&self) -> &Arc<RoutingProtocol> {
        &self.protocol
    }

    /// Spawn both daemons on the current runtime.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            Lifecycle::NotStarted => {}
            Lifecycle::Running { .. } => return Err(LifecycleError::AlreadyRunning),
            Lifecycle::Stopped => return Err(LifecycleError::Stopped),
        }
        let settings = self.protocol.context().routing_settings();

        let (reunion_tx, reunion_rx) = mpsc::channel(COMMAND_BUFFER);
        let (reunion_status_tx, reunion_status) = watch::channel(DaemonStatus::new(settings.reunion_interval));
        let reunion_task = tokio::spawn(run_reunion(self.protocol.clone(), reunion_rx, reunion_status_tx));

        let (intro_tx, intro_rx) = mpsc::channel(COMMAND_BUFFER);
        let (intro_status_tx, intro_status) = watch::channel(DaemonStatus::new(settings.introduction_floor));
        let intro_task = tokio::spawn(run_introduction(
            self.protocol.clone(),
            intro_rx,
            reunion_tx.clone(),
            intro_status_tx,
        ));

        self.state = Lifecycle::Running {
            introduction: DaemonHandle {
                commands: intro_tx,
                status: intro_status,
                task: intro_task,
            },
            reunion: DaemonHandle {
                commands: reunion_tx,
                status: reunion_status,
                task: reunion_task,
            },
        };
        tracing::info!(
            floor = ?settings.introduction_floor,
            ceiling = ?settings.introduction_ceiling,
            reunion = ?settings.reunion_interval,
            "routing maintenance started"
        );
        Ok(())
    }

    /// Cut the current Introduction sleep short. False if not running.
    pub fn wake_introduction(&self) -> bool {
        match &self.state {
            Lifecycle::Running { introduction, .. } => introduction.wake(),
            _ => false,
        }
    }

    /// Cut the current Reunion sleep short. False if not running.
    pub fn wake_reunion(&self) -> bool {
        match &self.state {
            Lifecycle::Running { reunion, .. } => reunion.wake(),
            _ => false,
        }
    }

    pub fn introduction_status(&self) -> Option<DaemonStatus> {
        match &self.state {
            Lifecycle::Running { introduction, .. } => Some(introduction.status.borrow().clone()),
            _ => None,
        }
    }

    pub fn reunion_status(&self) -> Option<DaemonStatus> {
        match &self.state {
            Lifecycle::Running { reunion, .. } => Some(reunion.status.borrow().clone()),
            _ => None,
        }
    }

    /// Subscribe to status changes, e.g. to wait for a pass to finish.
    pub fn watch_introduction(&self) -> Option<watch::Receiver<DaemonStatus>> {
        match &self.state {
            Lifecycle::Running { introduction, .. } => Some(introduction.status.clone()),
            _ => None,
        }
    }

    pub fn watch_reunion(&self) -> Option<watch::Receiver<DaemonStatus>> {
        match &self.state {
            Lifecycle::Running { reunion, .. } => Some(reunion.status.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, Lifecycle::Running { .. })
    }

    /// Stop both daemons and wait for them to exit.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, Lifecycle::Stopped) {
            Lifecycle::Running { introduction, reunion } => {
                introduction.stop("introduction").await;
                reunion.stop("reunion").await;
                tracing::info!("routing maintenance stopped");
            }
            Lifecycle::NotStarted | Lifecycle::Stopped => {}
        }
    }
}

// ── Daemon loops ─────────────────────────────────────────────────────────────

/// Sleep for `interval` unless a command arrives first. False means stop.
/// Wall-clock millis `interval` from now, saturating.
fn wakeup_after(interval: Duration) -> u64 {
    let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    unix_millis().saturating_add(millis)
}

async fn pause(interval: Duration, commands: &mut mpsc::Receiver<DaemonCommand>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        command = commands.recv() => matches!(command, Some(DaemonCommand::Wake)),
    }
}

async fn run_introduction(
    protocol: Arc<RoutingProtocol>,
    mut commands: mpsc::Receiver<DaemonCommand>,
    reunion: mpsc::Sender<DaemonCommand>,
    status: watch::Sender<DaemonStatus>,
) {
    let mut ramp = IntroductionRamp::new(protocol.context().routing_settings().introduction_floor);

    loop {
        let settings = protocol.context().routing_settings();
        status.send_modify(|s| s.phase = DaemonPhase::Running);
        let started_ms = unix_millis();
        let started = Instant::now();

        if protocol.introduce().await == IntroductionPass::TooFewNeighbours {
            tracing::debug!("too few neighbours to introduce, waking reunion");
            let _ = reunion.try_send(DaemonCommand::Wake);
        }

        let interval = ramp.advance(settings.introduction_ceiling);
        status.send_modify(|s| {
            s.phase = DaemonPhase::Sleeping;
            s.runs += 1;
            s.last_run_ms = Some(started_ms);
            s.last_duration = Some(started.elapsed());
            s.next_wakeup_ms = Some(wakeup_after(interval));
            s.interval = interval;
        });

        if !pause(interval, &mut commands).await {
            break;
        }
    }

    status.send_modify(|s| {
        s.phase = DaemonPhase::Stopped;
        s.next_wakeup_ms = None;
    });
    tracing::info!("introduction daemon stopped");
}

async fn run_reunion(
    protocol: Arc<RoutingProtocol>,
    mut commands: mpsc::Receiver<DaemonCommand>,
    status: watch::Sender<DaemonStatus>,
) {
    loop {
        let interval = protocol.context().routing_settings().reunion_interval;
        status.send_modify(|s| {
            s.phase = DaemonPhase::Sleeping;
            s.next_wakeup_ms = Some(wakeup_after(interval));
            s.interval = interval;
        });
        if !pause(interval, &mut commands).await {
            break;
        }

        status.send_modify(|s| s.phase = DaemonPhase::Running);
        let started_ms = unix_millis();
        let started = Instant::now();
        let pass = protocol.reunite().await;
        if pass.attempted > 0 {
            tracing::info!(attempted = pass.attempted, recovered = pass.recovered, "reunion pass finished");
        }
        status.send_modify(|s| {
            s.runs += 1;
            s.last_run_ms = Some(started_ms);
            s.last_duration = Some(started.elapsed());
        });
    }

    status.send_modify(|s| {
        s.phase = DaemonPhase::Stopped;
        s.next_wakeup_ms = None;
    });
    tracing::info!("reunion daemon stopped");
}
