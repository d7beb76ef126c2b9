//! Process manager: spawns worker processes, owns their channels, multiplexes
//! replies, and shuts the fleet down.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{LineReader, poll_readable, remaining, write_frame};
use crate::config::SessionConfig;
use crate::error::{FleetError, ProtocolError};
use crate::health_monitor::HealthMonitor;
use crate::log_dev;
use crate::protocol::{Request, Response};
use crate::robot::{ControlEvent, EXIT_ON_TREASURE};
use crate::signals;
use crate::types::{BatteryLevel, Position, RobotId, RunState};

// Polling interval used while waiting for workers to exit.
const REAP_POLL_MS: u64 = 10;

/// Which workers a directive addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    One(RobotId),
    All,
}

/// Something observed on a worker channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Reply(RobotId, Response),
    Malformed(RobotId, ProtocolError),
    /// The worker closed its end; its handle is now terminated.
    Closed(RobotId),
}

/// Coordinator-side record of one worker process.
pub struct WorkerHandle {
    id: RobotId,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: LineReader<ChildStdout>,
    position: Position,
    battery: BatteryLevel,
    run_state: RunState,
    alive: bool,
    exiting: bool,
}

impl WorkerHandle {
    pub fn id(&self) -> RobotId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Last position the worker reported (or its start).
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn battery(&self) -> BatteryLevel {
        self.battery
    }

    /// Run-state as last set by the coordinator's control signals.
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    fn fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    fn absorb(&mut self, response: &Response) {
        match response {
            Response::Moved { position, battery } => {
                self.position = *position;
                self.battery = *battery;
            }
            Response::Position(position) | Response::Sensed { position, .. } => self.position = *position,
            Response::Battery(level) => self.battery = *level,
            Response::Ready(_) | Response::Blocked(_) | Response::Error(_) => {}
        }
    }
}

/// How a worker process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReport {
    Exited(i32),
    Signaled(i32),
    /// Still running after the grace period; killed.
    ForceKilled,
    Unknown,
}

impl ExitReport {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReport::Exited(code),
            (None, Some(signal)) => ExitReport::Signaled(signal),
            (None, None) => ExitReport::Unknown,
        }
    }

    pub fn on_treasure(self) -> bool {
        self == ExitReport::Exited(EXIT_ON_TREASURE)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReport::Exited(code) => write!(f, "status {code}"),
            ExitReport::Signaled(signal) => write!(f, "killed by signal {signal}"),
            ExitReport::ForceKilled => f.write_str("force-killed after grace period"),
            ExitReport::Unknown => f.write_str("unknown status"),
        }
    }
}

/// Final state collected from one worker at shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalReport {
    pub id: RobotId,
    pub pid: u32,
    pub position: Option<Position>,
    pub battery: Option<BatteryLevel>,
    pub exit: ExitReport,
}

impl FinalReport {
    fn complete(&self) -> bool {
        self.position.is_some() && self.battery.is_some()
    }
}

/// Owns every worker handle. Ids are assigned from 1 and never reused.
pub struct Fleet {
    handles: BTreeMap<RobotId, WorkerHandle>,
    health: HealthMonitor,
}

impl Fleet {
    /// Spawn one worker per start position and wait for each to announce
    /// itself. Any failure tears the partial fleet down and names the first
    /// failing worker.
    pub fn spawn_all(config: &SessionConfig) -> Result<Self, FleetError> {
        let mut fleet = Fleet {
            handles: BTreeMap::new(),
            health: HealthMonitor::new(),
        };
        for (index, &start) in config.starts.iter().enumerate() {
            let id = index as RobotId + 1;
            let handle = spawn_worker(config, id, start)?;
            info!(robot = id, pid = handle.pid, %start, "spawned worker");
            fleet.health.register_robot(id);
            fleet.handles.insert(id, handle);
        }
        fleet.await_ready(config.spawn_timeout)?;
        Ok(fleet)
    }

    fn await_ready(&mut self, timeout: Duration) -> Result<(), FleetError> {
        let deadline = Instant::now() + timeout;
        let mut pending: BTreeSet<RobotId> = self.handles.keys().copied().collect();
        while !pending.is_empty() {
            let ids: Vec<RobotId> = pending.iter().copied().collect();
            for event in self.collect_ready(&ids, remaining(deadline)) {
                match event {
                    ChannelEvent::Reply(id, Response::Ready(announced)) if announced == id => {
                        pending.remove(&id);
                    }
                    ChannelEvent::Reply(id, other) => {
                        return Err(FleetError::spawn(id, format!("unexpected handshake '{other}'")));
                    }
                    ChannelEvent::Malformed(id, source) => {
                        return Err(FleetError::spawn(id, format!("malformed handshake: {source}")));
                    }
                    ChannelEvent::Closed(id) => {
                        return Err(FleetError::spawn(id, "exited during startup"));
                    }
                }
            }
            if Instant::now() >= deadline {
                if let Some(&id) = pending.iter().next() {
                    return Err(FleetError::spawn(id, "no READY before the spawn timeout"));
                }
            }
        }
        Ok(())
    }

    pub fn handle(&self, id: RobotId) -> Option<&WorkerHandle> {
        self.handles.get(&id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.handles.values()
    }

    pub fn alive_ids(&self) -> Vec<RobotId> {
        self.handles.values().filter(|h| h.alive).map(|h| h.id).collect()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Expand a target into live worker ids. A single dead or unknown id is
    /// an error; `All` silently skips terminated workers.
    pub fn resolve(&self, target: Target) -> Result<Vec<RobotId>, FleetError> {
        match target {
            Target::All => Ok(self.alive_ids()),
            Target::One(id) => match self.handles.get(&id) {
                None => Err(FleetError::UnknownRobot(id)),
                Some(handle) if !handle.alive => Err(FleetError::NotAlive(id)),
                Some(_) => Ok(vec![id]),
            },
        }
    }

    /// Write one request frame to a live worker.
    pub fn send(&mut self, id: RobotId, request: Request) -> Result<(), FleetError> {
        let handle = self.handles.get_mut(&id).ok_or(FleetError::UnknownRobot(id))?;
        let stdin = match handle.stdin.as_mut() {
            Some(stdin) if handle.alive => stdin,
            _ => return Err(FleetError::NotAlive(id)),
        };
        let written = write_frame(stdin, &request.encode());
        if let Err(source) = written {
            self.mark_terminated(id);
            return Err(FleetError::Channel { id, source });
        }
        log_dev!("[FLEET] -> robot {id}: {}", request.encode());
        self.health.request_sent(id);
        Ok(())
    }

    /// Deliver a control event to a live worker via its signal.
    pub fn signal(&mut self, id: RobotId, event: ControlEvent) -> Result<(), FleetError> {
        let handle = self.handles.get_mut(&id).ok_or(FleetError::UnknownRobot(id))?;
        if !handle.alive {
            return Err(FleetError::NotAlive(id));
        }
        let Some(signal) = signals::signal_for(event) else {
            return Ok(());
        };
        signals::send(handle.pid, signal).map_err(FleetError::Signal)?;
        match event {
            ControlEvent::Suspend => handle.run_state = RunState::Suspended,
            ControlEvent::Resume => handle.run_state = RunState::Active,
            _ => {}
        }
        Ok(())
    }

    /// Wait up to `timeout` for any of `ids` to become readable and return
    /// every complete frame available. Frames already buffered are returned
    /// without waiting. An empty result means nothing arrived in time.
    pub fn collect_ready(&mut self, ids: &[RobotId], timeout: Duration) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        for id in ids {
            if let Some(handle) = self.handles.get_mut(id) {
                drain_frames(handle, &mut self.health, &mut events);
            }
        }
        if !events.is_empty() {
            return events;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let live: Vec<(RobotId, RawFd)> = ids
                .iter()
                .filter_map(|id| self.handles.get(id))
                .filter(|handle| handle.alive)
                .map(|handle| (handle.id, handle.fd()))
                .collect();
            if live.is_empty() {
                return events;
            }
            let fds: Vec<RawFd> = live.iter().map(|&(_, fd)| fd).collect();
            let ready = match poll_readable(&fds, Some(remaining(deadline))) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!("poll over worker channels failed: {err}");
                    return events;
                }
            };
            for (&(id, _), is_ready) in live.iter().zip(ready) {
                if is_ready {
                    self.read_channel(id, &mut events);
                }
            }
            if !events.is_empty() || Instant::now() >= deadline {
                return events;
            }
        }
    }

    /// Robots whose outstanding request has gone unanswered for `timeout`;
    /// each stall is reported once.
    pub fn detect_stalled(&mut self, timeout: Duration) -> BTreeSet<RobotId> {
        self.health.detect_stalled(timeout)
    }

    fn read_channel(&mut self, id: RobotId, events: &mut Vec<ChannelEvent>) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        let closed = match handle.reader.fill() {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(robot = id, "read from worker failed: {err}");
                true
            }
        };
        drain_frames(handle, &mut self.health, events);
        if closed {
            self.mark_terminated(id);
            events.push(ChannelEvent::Closed(id));
        }
    }

    fn mark_terminated(&mut self, id: RobotId) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        if !handle.alive {
            return;
        }
        handle.alive = false;
        handle.stdin = None;
        if handle.exiting {
            debug!(robot = id, "worker closed its channel on exit");
        } else {
            warn!(robot = id, pid = handle.pid, "worker channel closed unexpectedly");
        }
        let _ = handle.child.try_wait();
        self.health.mark_lost(id);
    }

    /// Ask every live worker to exit, collect final reports, and reap every
    /// process. Workers still running when the grace period ends are killed.
    pub fn terminate_all(&mut self, grace: Duration) -> Vec<FinalReport> {
        let deadline = Instant::now() + grace;
        let mut reports: BTreeMap<RobotId, FinalReport> = self
            .handles
            .values()
            .map(|handle| {
                (
                    handle.id,
                    FinalReport {
                        id: handle.id,
                        pid: handle.pid,
                        position: None,
                        battery: None,
                        exit: ExitReport::Unknown,
                    },
                )
            })
            .collect();

        let mut pending = BTreeSet::new();
        for id in self.alive_ids() {
            if let Some(handle) = self.handles.get_mut(&id) {
                handle.exiting = true;
            }
            match self.send(id, Request::Exit) {
                Ok(()) => {
                    pending.insert(id);
                }
                Err(err) => warn!(robot = id, "could not request exit: {err}"),
            }
        }

        while !pending.is_empty() && Instant::now() < deadline {
            let ids: Vec<RobotId> = pending.iter().copied().collect();
            for event in self.collect_ready(&ids, remaining(deadline)) {
                match event {
                    ChannelEvent::Reply(id, response) => {
                        let Some(report) = reports.get_mut(&id) else {
                            continue;
                        };
                        match response {
                            Response::Position(position) => report.position = Some(position),
                            Response::Battery(level) => report.battery = Some(level),
                            other => debug!(robot = id, "ignoring '{other}' during shutdown"),
                        }
                        if report.complete() {
                            pending.remove(&id);
                        }
                    }
                    ChannelEvent::Malformed(id, err) => {
                        warn!(robot = id, "malformed final report: {err}");
                    }
                    ChannelEvent::Closed(id) => {
                        pending.remove(&id);
                    }
                }
            }
        }

        for handle in self.handles.values_mut() {
            handle.stdin = None;
            handle.alive = false;
            let exit = reap(&mut handle.child, deadline);
            if exit == ExitReport::ForceKilled {
                warn!(robot = handle.id, pid = handle.pid, "worker unresponsive; killed");
            }
            if let Some(report) = reports.get_mut(&handle.id) {
                report.exit = exit;
            }
        }
        reports.into_values().collect()
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        for handle in self.handles.values_mut() {
            if let Ok(None) = handle.child.try_wait() {
                let _ = handle.child.kill();
                let _ = handle.child.wait();
            }
        }
    }
}

fn spawn_worker(config: &SessionConfig, id: RobotId, start: Position) -> Result<WorkerHandle, FleetError> {
    let tick_ms = config.tick.map(|tick| tick.as_millis()).unwrap_or(0);
    let mut command = Command::new(&config.worker_program);
    command
        .arg("worker")
        .arg("--id")
        .arg(id.to_string())
        .arg("--row")
        .arg(start.row.to_string())
        .arg("--col")
        .arg(start.col.to_string())
        .arg("--battery")
        .arg(config.initial_battery.to_string())
        .arg("--tick-ms")
        .arg(tick_ms.to_string())
        .arg("--log-level")
        .arg(&config.worker_log_level)
        .arg("--room")
        .arg(&config.room_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        // Terminal-generated signals reach the coordinator only.
        .process_group(0);

    let mut child = command
        .spawn()
        .map_err(|source| FleetError::spawn_with_source(id, "cannot start worker process", source))?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(FleetError::spawn(id, "worker pipes unavailable"));
    };
    Ok(WorkerHandle {
        id,
        pid: child.id(),
        child,
        stdin: Some(stdin),
        reader: LineReader::new(stdout),
        position: start,
        battery: config.initial_battery,
        run_state: RunState::Active,
        alive: true,
        exiting: false,
    })
}

fn drain_frames(handle: &mut WorkerHandle, health: &mut HealthMonitor, events: &mut Vec<ChannelEvent>) {
    while let Some(frame) = handle.reader.next_frame() {
        if frame.trim().is_empty() {
            continue;
        }
        log_dev!("[FLEET] <- robot {}: {frame}", handle.id);
        health.heartbeat(handle.id);
        match Response::decode(&frame) {
            Ok(response) => {
                handle.absorb(&response);
                events.push(ChannelEvent::Reply(handle.id, response));
            }
            Err(err) => events.push(ChannelEvent::Malformed(handle.id, err)),
        }
    }
}

fn reap(child: &mut Child, deadline: Instant) -> ExitReport {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return ExitReport::from_status(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(REAP_POLL_MS)),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return ExitReport::ForceKilled;
            }
            Err(err) => {
                warn!("cannot query worker status: {err}");
                return ExitReport::Unknown;
            }
        }
    }
}
