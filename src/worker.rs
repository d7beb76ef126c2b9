//! Worker process runtime.
//!
//! Single-threaded event loop over two inputs: the signal pipe (control
//! events, always consumed first) and stdin (request frames, one at a time).
//! The poll timeout is bounded by the next tick deadline; each tick re-arms
//! the deadline before control returns to the wait.

use std::io::{self, Write};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::channel::{FdReader, LineReader, poll_readable, remaining, write_frame};
use crate::config::{RoomModel, WorkerConfig};
use crate::log_dev;
use crate::protocol::{Request, Response};
use crate::robot::{ControlEvent, EXIT_CHANNEL_FAILURE, EXIT_NORMAL, Outcome, Robot};
use crate::signals::{self, SignalPipe, WORKER_SIGNALS};

/// Run a worker until it is told to exit or loses its channel. Returns the
/// process exit status.
pub fn run(config: WorkerConfig, room: RoomModel) -> i32 {
    let signals = match SignalPipe::install(&WORKER_SIGNALS) {
        Ok(pipe) => pipe,
        Err(err) => {
            error!(robot = config.id, "cannot install signal handlers: {err}");
            return EXIT_CHANNEL_FAILURE;
        }
    };
    let mut robot = Robot::new(config.id, config.start, config.battery, room);
    let mut input = LineReader::new(FdReader::stdin());
    let mut output = io::stdout().lock();

    match serve(&mut robot, &config, &signals, &mut input, &mut output) {
        Ok(status) => status,
        Err(err) => {
            // The channel is gone; nothing more may be sent on it.
            warn!(robot = robot.id(), "channel failure: {err}");
            EXIT_CHANNEL_FAILURE
        }
    }
}

fn serve<W: Write>(
    robot: &mut Robot,
    config: &WorkerConfig,
    signals: &SignalPipe,
    input: &mut LineReader<FdReader>,
    output: &mut W,
) -> io::Result<i32> {
    write_frame(output, &Response::Ready(robot.id()).encode())?;
    let mut next_tick = config.tick.map(|interval| Instant::now() + interval);

    loop {
        for signal in signals.drain() {
            if let Some(event) = signals::control_event(signal) {
                apply_control(robot, event);
            }
        }

        if let (Some(interval), Some(due)) = (config.tick, next_tick.as_mut()) {
            while Instant::now() >= *due {
                robot.apply(ControlEvent::Tick);
                *due += interval;
            }
        }

        if let Some(frame) = input.next_frame() {
            if frame.trim().is_empty() {
                continue;
            }
            let outcome = match Request::decode(&frame) {
                Ok(request) => {
                    log_dev!("[WORKER {}] {:?}", robot.id(), request);
                    robot.handle(request)
                }
                Err(err) => {
                    warn!(robot = robot.id(), "rejected frame '{frame}': {err}");
                    Outcome::Reply(Response::Error(err.to_string()))
                }
            };
            match outcome {
                Outcome::Reply(response) => write_frame(output, &response.encode())?,
                Outcome::Terminate { frames, status } => {
                    for response in frames {
                        write_frame(output, &response.encode())?;
                    }
                    debug!(robot = robot.id(), status, "exiting on request");
                    return Ok(status);
                }
            }
            continue;
        }

        if input.is_drained() {
            debug!(robot = robot.id(), "inbound channel closed");
            return Ok(EXIT_NORMAL);
        }

        let timeout = next_tick.map(remaining);
        let ready = poll_readable(&[signals.fd(), input.get_ref().fd()], timeout)?;
        if ready[1] {
            input.fill()?;
        }
    }
}

fn apply_control(robot: &mut Robot, event: ControlEvent) {
    robot.apply(event);
    if event == ControlEvent::PrintStatus {
        eprintln!("{}", robot.status_line());
    }
    debug!(robot = robot.id(), state = %robot.run_state(), battery = robot.battery(), "applied {event:?}");
    log_dev!("[WORKER {}] control {:?} -> {}", robot.id(), event, robot.status_line());
}
