//! Self-pipe delivery of Unix signals.
//!
//! Handlers only write the signal number into a non-blocking pipe; the owning
//! event loop polls the read end alongside its other descriptors and handles
//! the signals synchronously between frames.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::robot::ControlEvent;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signal: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signal as u8;
        // A full pipe drops the signal; there is already one pending.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    unsafe {
        let status = libc::fcntl(fd, libc::F_GETFL);
        if status < 0 || libc::fcntl(fd, libc::F_SETFL, status | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let descriptor = libc::fcntl(fd, libc::F_GETFD);
        if descriptor < 0 || libc::fcntl(fd, libc::F_SETFD, descriptor | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read end of the process-wide signal pipe. One per process.
pub struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and route each of `signals` into it.
    pub fn install(signals: &[libc::c_int]) -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_flags(read.as_raw_fd())?;
        set_flags(write.as_raw_fd())?;
        PIPE_WRITE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

        for &signal in signals {
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = forward_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            unsafe {
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(Self { read, _write: write })
    }

    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Take every pending signal, oldest first, without blocking.
    pub fn drain(&self) -> Vec<libc::c_int> {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read.as_raw_fd(), chunk.as_mut_ptr().cast(), chunk.len()) };
            if n <= 0 {
                break;
            }
            pending.extend(chunk[..n as usize].iter().map(|&b| libc::c_int::from(b)));
        }
        pending
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
    }
}

/// Signals a worker reacts to.
pub const WORKER_SIGNALS: [libc::c_int; 4] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTSTP, libc::SIGUSR1];

/// Signals the coordinator reacts to.
pub const COORDINATOR_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTSTP];

/// Worker-side meaning of a delivered signal.
pub fn control_event(signal: libc::c_int) -> Option<ControlEvent> {
    match signal {
        libc::SIGINT => Some(ControlEvent::Suspend),
        libc::SIGQUIT => Some(ControlEvent::Resume),
        libc::SIGTSTP => Some(ControlEvent::PrintStatus),
        libc::SIGUSR1 => Some(ControlEvent::Replenish),
        _ => None,
    }
}

/// Signal carrying `event` to a worker process. Ticks are generated locally
/// and have no signal.
pub fn signal_for(event: ControlEvent) -> Option<libc::c_int> {
    match event {
        ControlEvent::Suspend => Some(libc::SIGINT),
        ControlEvent::Resume => Some(libc::SIGQUIT),
        ControlEvent::PrintStatus => Some(libc::SIGTSTP),
        ControlEvent::Replenish => Some(libc::SIGUSR1),
        ControlEvent::Tick => None,
    }
}

/// Deliver `signal` to `pid`.
pub fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_signals_map_both_ways() {
        for event in [
            ControlEvent::Suspend,
            ControlEvent::Resume,
            ControlEvent::PrintStatus,
            ControlEvent::Replenish,
        ] {
            let signal = signal_for(event).expect("event has a signal");
            assert!(WORKER_SIGNALS.contains(&signal));
            assert_eq!(control_event(signal), Some(event));
        }
        assert_eq!(signal_for(ControlEvent::Tick), None);
        assert_eq!(control_event(libc::SIGTERM), None);
    }
}
