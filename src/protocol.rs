//! Newline-delimited text frames exchanged between coordinator and workers.

use std::fmt;

use crate::error::ProtocolError;
use crate::types::{BatteryLevel, Direction, Position, RobotId};

/// Coordinator → worker frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Move(Direction),
    Battery,
    Position,
    Sense,
    Exit,
}

/// Why a move was refused. `Collision` is only ever produced by the
/// coordinator; workers never send it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    OutOfBounds,
    Obstacle,
    LowBattery,
    Suspended,
    Collision,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::OutOfBounds => "OutOfBounds",
            BlockReason::Obstacle => "Obstacle",
            BlockReason::LowBattery => "LowBattery",
            BlockReason::Suspended => "Suspended",
            BlockReason::Collision => "Collision",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word {
            "OutOfBounds" => Some(BlockReason::OutOfBounds),
            "Obstacle" => Some(BlockReason::Obstacle),
            "LowBattery" => Some(BlockReason::LowBattery),
            "Suspended" => Some(BlockReason::Suspended),
            "Collision" => Some(BlockReason::Collision),
            _ => None,
        }
    }
}

/// Worker → coordinator frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ready(RobotId),
    Moved {
        position: Position,
        battery: BatteryLevel,
    },
    Blocked(BlockReason),
    Battery(BatteryLevel),
    Position(Position),
    Sensed {
        position: Position,
        treasure: bool,
    },
    Error(String),
}

impl Request {
    /// Frame text without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Request::Move(direction) => format!("MOVE {direction}"),
            Request::Battery => "BATTERY".to_string(),
            Request::Position => "POSITION".to_string(),
            Request::Sense => "SENSE".to_string(),
            Request::Exit => "EXIT".to_string(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut fields = frame.split_whitespace();
        let tag = fields.next().ok_or(ProtocolError::Empty)?;
        let rest: Vec<&str> = fields.collect();
        let request = match (tag, rest.as_slice()) {
            ("MOVE", [word]) => Request::Move(Direction::parse(word).ok_or_else(|| bad("MOVE", frame))?),
            ("MOVE", _) => return Err(bad("MOVE", frame)),
            ("BATTERY", []) => Request::Battery,
            ("POSITION", []) => Request::Position,
            ("SENSE", []) => Request::Sense,
            ("EXIT", []) => Request::Exit,
            ("BATTERY", _) => return Err(bad("BATTERY", frame)),
            ("POSITION", _) => return Err(bad("POSITION", frame)),
            ("SENSE", _) => return Err(bad("SENSE", frame)),
            ("EXIT", _) => return Err(bad("EXIT", frame)),
            (other, _) => return Err(ProtocolError::UnknownTag(other.to_string())),
        };
        Ok(request)
    }
}

impl Response {
    pub fn encode(&self) -> String {
        match self {
            Response::Ready(id) => format!("READY {id}"),
            Response::Moved { position, battery } => {
                format!("OK {} {} {battery}", position.row, position.col)
            }
            Response::Blocked(reason) => format!("BLOCKED {}", reason.as_str()),
            Response::Battery(level) => format!("BATTERY {level}"),
            Response::Position(position) => format!("POSITION {} {}", position.row, position.col),
            Response::Sensed { position, treasure } => format!(
                "CELL {} {} {}",
                position.row,
                position.col,
                if *treasure { "treasure" } else { "empty" }
            ),
            // Details never span lines on the wire.
            Response::Error(detail) => format!("ERROR {}", detail.replace('\n', " ")),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let trimmed = frame.trim();
        let (tag, rest) = match trimmed.split_once(' ') {
            Some((tag, rest)) => (tag, rest),
            None => (trimmed, ""),
        };
        if tag.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let response = match tag {
            "READY" => match fields.as_slice() {
                [id] => Response::Ready(id.parse().map_err(|_| bad("READY", frame))?),
                _ => return Err(bad("READY", frame)),
            },
            "OK" => match fields.as_slice() {
                [row, col, battery] => Response::Moved {
                    position: parse_position(row, col).ok_or_else(|| bad("OK", frame))?,
                    battery: battery.parse().map_err(|_| bad("OK", frame))?,
                },
                _ => return Err(bad("OK", frame)),
            },
            "BLOCKED" => match fields.as_slice() {
                [reason] => Response::Blocked(BlockReason::parse(reason).ok_or_else(|| bad("BLOCKED", frame))?),
                _ => return Err(bad("BLOCKED", frame)),
            },
            "BATTERY" => match fields.as_slice() {
                [level] => Response::Battery(level.parse().map_err(|_| bad("BATTERY", frame))?),
                _ => return Err(bad("BATTERY", frame)),
            },
            "POSITION" => match fields.as_slice() {
                [row, col] => Response::Position(parse_position(row, col).ok_or_else(|| bad("POSITION", frame))?),
                _ => return Err(bad("POSITION", frame)),
            },
            "CELL" => match fields.as_slice() {
                [row, col, kind] => {
                    let treasure = match *kind {
                        "treasure" => true,
                        "empty" => false,
                        _ => return Err(bad("CELL", frame)),
                    };
                    Response::Sensed {
                        position: parse_position(row, col).ok_or_else(|| bad("CELL", frame))?,
                        treasure,
                    }
                }
                _ => return Err(bad("CELL", frame)),
            },
            "ERROR" => Response::Error(rest.trim().to_string()),
            other => return Err(ProtocolError::UnknownTag(other.to_string())),
        };
        Ok(response)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_position(row: &str, col: &str) -> Option<Position> {
    Some(Position::new(row.parse().ok()?, col.parse().ok()?))
}

fn bad(tag: &'static str, frame: &str) -> ProtocolError {
    ProtocolError::BadArguments {
        tag,
        frame: frame.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_wire_words() {
        assert_eq!(Request::Move(Direction::Left).encode(), "MOVE left");
        assert_eq!(Request::decode("MOVE up"), Ok(Request::Move(Direction::Up)));
        assert_eq!(Request::decode("  EXIT  "), Ok(Request::Exit));
        assert_eq!(Request::decode("BATTERY"), Ok(Request::Battery));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_eq!(Request::decode(""), Err(ProtocolError::Empty));
        assert!(matches!(Request::decode("MOVE"), Err(ProtocolError::BadArguments { tag: "MOVE", .. })));
        assert!(matches!(Request::decode("MOVE sideways"), Err(ProtocolError::BadArguments { .. })));
        assert!(matches!(Request::decode("EXIT now"), Err(ProtocolError::BadArguments { tag: "EXIT", .. })));
        assert_eq!(Request::decode("mv up"), Err(ProtocolError::UnknownTag("mv".to_string())));
    }

    #[test]
    fn responses_decode_from_worker_lines() {
        assert_eq!(
            Response::decode("OK 1 3 95"),
            Ok(Response::Moved {
                position: Position::new(1, 3),
                battery: 95
            })
        );
        assert_eq!(Response::decode("BLOCKED LowBattery"), Ok(Response::Blocked(BlockReason::LowBattery)));
        assert_eq!(Response::decode("POSITION 0 3"), Ok(Response::Position(Position::new(0, 3))));
        assert_eq!(Response::decode("BATTERY 0"), Ok(Response::Battery(0)));
        assert_eq!(Response::decode("READY 4"), Ok(Response::Ready(4)));
        assert_eq!(
            Response::decode("CELL 3 4 treasure"),
            Ok(Response::Sensed {
                position: Position::new(3, 4),
                treasure: true
            })
        );
        assert_eq!(
            Response::decode("ERROR unknown frame tag 'mv'"),
            Ok(Response::Error("unknown frame tag 'mv'".to_string()))
        );
    }

    #[test]
    fn malformed_responses_are_rejected() {
        assert!(Response::decode("OK 1 3").is_err());
        assert!(Response::decode("BATTERY -1").is_err());
        assert!(Response::decode("BLOCKED Tired").is_err());
        assert!(Response::decode("Position: 1 2").is_err());
        assert_eq!(Response::decode("   "), Err(ProtocolError::Empty));
    }

    #[test]
    fn error_detail_stays_on_one_line() {
        let frame = Response::Error("bad\nframe".to_string()).encode();
        assert_eq!(frame, "ERROR bad frame");
    }
}
