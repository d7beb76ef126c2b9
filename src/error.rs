//! Error taxonomy for configuration, wire frames, and the worker fleet.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{Position, RobotId};

/// Malformed or inconsistent startup configuration. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("{kind} at {position} is outside a {rows}x{cols} room")]
    OutOfBounds {
        kind: &'static str,
        position: Position,
        rows: i64,
        cols: i64,
    },

    #[error("robot {id} cannot start at {position}: {reason}")]
    InvalidStart {
        id: RobotId,
        position: Position,
        reason: &'static str,
    },
}

impl ConfigError {
    pub fn malformed(line: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            message: message.into(),
        }
    }
}

/// A frame that does not decode into a known request or response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame tag '{0}'")]
    UnknownTag(String),

    #[error("bad arguments for {tag}: '{frame}'")]
    BadArguments { tag: &'static str, frame: String },
}

/// Process-manager failures: spawning, channel I/O, signalling.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("failed to spawn robot {index}: {message}")]
    Spawn {
        index: RobotId,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("robot {0} is not alive")]
    NotAlive(RobotId),

    #[error("unknown robot {0}")]
    UnknownRobot(RobotId),

    #[error("channel to robot {id} failed: {source}")]
    Channel {
        id: RobotId,
        #[source]
        source: io::Error,
    },

    #[error("robot {id} sent a malformed reply: {source}")]
    Protocol {
        id: RobotId,
        #[source]
        source: ProtocolError,
    },

    #[error("signal delivery failed: {0}")]
    Signal(#[source] io::Error),
}

impl FleetError {
    pub fn spawn(index: RobotId, message: impl Into<String>) -> Self {
        Self::Spawn {
            index,
            message: message.into(),
            source: None,
        }
    }

    pub fn spawn_with_source(index: RobotId, message: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            index,
            message: message.into(),
            source: Some(source),
        }
    }
}

/// An operator line that is not a valid directive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid robot id '{0}'")]
    BadTarget(String),

    #[error("invalid direction '{0}' (expected up, down, left or right)")]
    BadDirection(String),
}
