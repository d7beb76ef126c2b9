//! Shared identifiers and grid model used across the system.

use std::fmt;

/// Unique identifier for a worker process (1-based, start-file line number).
pub type RobotId = u64;

/// Battery charge held by a worker, always within `0..=MAX_BATTERY`.
pub type BatteryLevel = u32;

/// Full charge; replenish always lands here.
pub const MAX_BATTERY: BatteryLevel = 100;
/// Charge consumed by one committed move.
pub const MOVE_COST: BatteryLevel = 5;
/// Charge consumed by one tick.
pub const TICK_COST: BatteryLevel = 1;

/// Zero-indexed grid coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub row: i64,
    pub col: i64,
}

impl Position {
    pub const fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }

    /// Neighbouring coordinate one unit step away; may fall outside the room.
    pub fn step(self, direction: Direction) -> Self {
        let (dr, dc) = direction.offset();
        Self {
            row: self.row + dr,
            col: self.col + dc,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Movement directions understood by workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// Unit vector as (row delta, col delta).
    pub fn offset(self) -> (i64, i64) {
        match self {
            Direction::Up => (-1, 0),
            Direction::Down => (1, 0),
            Direction::Left => (0, -1),
            Direction::Right => (0, 1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a worker currently honours movement requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Active,
    Suspended,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Active => f.write_str("active"),
            RunState::Suspended => f.write_str("suspended"),
        }
    }
}

/// Coordinator belief about one grid position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cell {
    Unknown,
    Obstacle,
    Empty,
    Treasure,
    RobotOnEmpty,
    RobotOnTreasure,
}

impl Cell {
    /// Fixed render token for the operator view.
    pub fn symbol(self) -> &'static str {
        match self {
            Cell::Unknown => "?",
            Cell::Obstacle => "X",
            Cell::Empty => "-",
            Cell::Treasure => "T",
            Cell::RobotOnEmpty => "R",
            Cell::RobotOnTreasure => "RT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_moves_by_unit_vector() {
        let origin = Position::new(2, 3);
        assert_eq!(origin.step(Direction::Up), Position::new(1, 3));
        assert_eq!(origin.step(Direction::Down), Position::new(3, 3));
        assert_eq!(origin.step(Direction::Left), Position::new(2, 2));
        assert_eq!(origin.step(Direction::Right), Position::new(2, 4));
    }

    #[test]
    fn direction_words_parse_back() {
        for direction in Direction::ALL {
            assert_eq!(Direction::parse(direction.as_str()), Some(direction));
        }
        assert_eq!(Direction::parse("north"), None);
        assert_eq!(Direction::parse("UP"), None);
    }

    #[test]
    fn cell_symbols_match_render_legend() {
        let symbols: Vec<&str> = [
            Cell::Unknown,
            Cell::Obstacle,
            Cell::RobotOnEmpty,
            Cell::Treasure,
            Cell::RobotOnTreasure,
            Cell::Empty,
        ]
        .iter()
        .map(|cell| cell.symbol())
        .collect();
        assert_eq!(symbols, ["?", "X", "R", "T", "RT", "-"]);
    }
}
