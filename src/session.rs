//! Coordinator event loop: operator lines on stdin and terminal signals,
//! both multiplexed through one poll.

use std::io::{self, Write};

use tracing::{error, info, warn};

use crate::channel::{FdReader, LineReader, poll_readable};
use crate::config::SessionConfig;
use crate::dispatcher::{Directive, Dispatcher, Flow};
use crate::fleet::Fleet;
use crate::signals::{COORDINATOR_SIGNALS, SignalPipe};
use crate::world::WorldModel;

pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;

/// Start the fleet and serve the operator until `exit`, end of input, or an
/// interrupt. Returns the process exit status.
pub fn run(config: SessionConfig) -> i32 {
    let signals = match SignalPipe::install(&COORDINATOR_SIGNALS) {
        Ok(pipe) => pipe,
        Err(err) => {
            error!("cannot install signal handlers: {err}");
            eprintln!("error: cannot install signal handlers: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let fleet = match Fleet::spawn_all(&config) {
        Ok(fleet) => fleet,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    info!(robots = config.starts.len(), "fleet ready");

    let world = WorldModel::new(config.room.clone());
    let mut dispatcher = Dispatcher::new(fleet, world, config.reply_timeout, config.grace_period, io::stdout());
    dispatcher.print_room();

    let interactive = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
    let mut input = LineReader::new(FdReader::stdin());
    serve(&mut dispatcher, &signals, &mut input, interactive);
    dispatcher.shutdown();
    EXIT_OK
}

/// Returns once the session should shut down. Signals are handled before
/// any pending operator line.
fn serve<W: Write>(
    dispatcher: &mut Dispatcher<W>,
    signals: &SignalPipe,
    input: &mut LineReader<FdReader>,
    interactive: bool,
) {
    prompt(interactive);
    loop {
        for signal in signals.drain() {
            match signal {
                libc::SIGINT => {
                    info!("interrupted; shutting down");
                    return;
                }
                libc::SIGQUIT => dispatcher.replenish_all(),
                libc::SIGTSTP => dispatcher.status_all(),
                other => warn!("ignoring signal {other}"),
            }
        }

        if let Some(line) = input.next_frame() {
            match Directive::parse(&line) {
                Ok(Some(directive)) => {
                    if dispatcher.execute(directive) == Flow::Exit {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => dispatcher.report_error(&err),
            }
            prompt(interactive);
            continue;
        }
        if input.is_drained() {
            info!("operator input closed; shutting down");
            return;
        }

        let ready = match poll_readable(&[signals.fd(), input.get_ref().fd()], None) {
            Ok(ready) => ready,
            Err(err) => {
                error!("poll failed: {err}");
                return;
            }
        };
        if ready.get(1).copied().unwrap_or(false) {
            if let Err(err) = input.fill() {
                error!("cannot read operator input: {err}");
                return;
            }
        }
    }
}

fn prompt(interactive: bool) {
    if interactive {
        print!("Command: ");
        let _ = io::stdout().flush();
    }
}
