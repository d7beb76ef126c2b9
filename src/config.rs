//! Room and start-position files, plus the immutable session settings built
//! from them once at startup.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{BatteryLevel, MAX_BATTERY, Position, RobotId};

/// Default reply wait for a dispatched request.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Default wait for workers to exit after `EXIT` before force-killing.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Default wait for a freshly spawned worker to announce itself.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Default interval between battery ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Largest accepted room side; the coordinator keeps one cell per square.
pub const MAX_ROOM_SIDE: i64 = 1024;

/// Static room layout: dimensions, obstacles, treasures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomModel {
    rows: i64,
    cols: i64,
    obstacles: BTreeSet<Position>,
    treasures: BTreeSet<Position>,
}

impl RoomModel {
    pub fn new(
        rows: i64,
        cols: i64,
        obstacles: impl IntoIterator<Item = Position>,
        treasures: impl IntoIterator<Item = Position>,
    ) -> Result<Self, ConfigError> {
        if rows <= 0 || cols <= 0 {
            return Err(ConfigError::malformed(1, "room dimensions must be positive"));
        }
        if rows > MAX_ROOM_SIDE || cols > MAX_ROOM_SIDE {
            return Err(ConfigError::malformed(
                1,
                format!("room dimensions {rows}x{cols} exceed {MAX_ROOM_SIDE}x{MAX_ROOM_SIDE}"),
            ));
        }
        let room = Self {
            rows,
            cols,
            obstacles: obstacles.into_iter().collect(),
            treasures: treasures.into_iter().collect(),
        };
        for &position in &room.obstacles {
            room.check_bounds("obstacle", position)?;
        }
        for &position in &room.treasures {
            room.check_bounds("treasure", position)?;
        }
        Ok(room)
    }

    /// Load a room description from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse the three-line room format:
    /// `<rows> <cols>`, then obstacles and treasures as `<count> (r,c) ...`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = text.lines();
        let dims = lines
            .next()
            .ok_or_else(|| ConfigError::malformed(1, "missing room dimensions"))?;
        let mut fields = dims.split_whitespace();
        let rows = parse_int(fields.next(), 1, "rows")?;
        let cols = parse_int(fields.next(), 1, "columns")?;
        if fields.next().is_some() {
            return Err(ConfigError::malformed(1, "expected exactly '<rows> <cols>'"));
        }
        let obstacles = parse_counted_positions(lines.next(), 2)?;
        let treasures = parse_counted_positions(lines.next(), 3)?;
        Self::new(rows, cols, obstacles, treasures)
    }

    pub fn rows(&self) -> i64 {
        self.rows
    }

    pub fn cols(&self) -> i64 {
        self.cols
    }

    pub fn in_bounds(&self, position: Position) -> bool {
        (0..self.rows).contains(&position.row) && (0..self.cols).contains(&position.col)
    }

    pub fn is_obstacle(&self, position: Position) -> bool {
        self.obstacles.contains(&position)
    }

    pub fn is_treasure(&self, position: Position) -> bool {
        self.treasures.contains(&position)
    }

    pub fn obstacles(&self) -> impl Iterator<Item = Position> + '_ {
        self.obstacles.iter().copied()
    }

    pub fn treasure_count(&self) -> usize {
        self.treasures.len()
    }

    fn check_bounds(&self, kind: &'static str, position: Position) -> Result<(), ConfigError> {
        if self.in_bounds(position) {
            Ok(())
        } else {
            Err(ConfigError::OutOfBounds {
                kind,
                position,
                rows: self.rows,
                cols: self.cols,
            })
        }
    }
}

fn parse_int(field: Option<&str>, line: usize, what: &str) -> Result<i64, ConfigError> {
    let field = field.ok_or_else(|| ConfigError::malformed(line, format!("missing {what}")))?;
    field
        .parse::<i64>()
        .map_err(|_| ConfigError::malformed(line, format!("invalid {what} '{field}'")))
}

/// Parse `(r,c)` with optional whitespace around either number.
fn parse_pair(inner: &str, line: usize) -> Result<Position, ConfigError> {
    let (row, col) = inner
        .split_once(',')
        .ok_or_else(|| ConfigError::malformed(line, format!("expected '(row,col)', got '({inner})'")))?;
    let row = parse_int(Some(row.trim()), line, "row")?;
    let col = parse_int(Some(col.trim()), line, "column")?;
    Ok(Position::new(row, col))
}

/// Extract every parenthesised pair from `rest`; only whitespace may sit
/// between pairs.
fn parse_pairs(rest: &str, line: usize) -> Result<Vec<Position>, ConfigError> {
    let mut positions = Vec::new();
    let mut remaining = rest.trim_start();
    while !remaining.is_empty() {
        let body = remaining
            .strip_prefix('(')
            .ok_or_else(|| ConfigError::malformed(line, format!("unexpected text '{remaining}'")))?;
        let close = body
            .find(')')
            .ok_or_else(|| ConfigError::malformed(line, "unclosed '('"))?;
        positions.push(parse_pair(&body[..close], line)?);
        remaining = body[close + 1..].trim_start();
    }
    Ok(positions)
}

fn parse_counted_positions(text: Option<&str>, line: usize) -> Result<Vec<Position>, ConfigError> {
    let text = text
        .map(str::trim)
        .ok_or_else(|| ConfigError::malformed(line, "missing line"))?;
    let (count, rest) = match text.split_once(char::is_whitespace) {
        Some((count, rest)) => (count, rest),
        None => (text, ""),
    };
    let count = count
        .parse::<usize>()
        .map_err(|_| ConfigError::malformed(line, format!("invalid count '{count}'")))?;
    let positions = parse_pairs(rest, line)?;
    if positions.len() != count {
        return Err(ConfigError::malformed(
            line,
            format!("declared {count} positions but listed {}", positions.len()),
        ));
    }
    Ok(positions)
}

/// Parse the start file: one `(row,col)` per non-empty line. Worker ids are
/// assigned 1, 2, ... in file order.
pub fn parse_start_positions(text: &str) -> Result<Vec<Position>, ConfigError> {
    let mut starts = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let pairs = parse_pairs(line, index + 1)?;
        match pairs.as_slice() {
            [position] => starts.push(*position),
            _ => {
                return Err(ConfigError::malformed(
                    index + 1,
                    "expected a single '(row,col)'",
                ));
            }
        }
    }
    if starts.is_empty() {
        return Err(ConfigError::malformed(1, "no start positions"));
    }
    Ok(starts)
}

pub fn load_start_positions(path: &Path) -> Result<Vec<Position>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_start_positions(&text)
}

/// Reject starts that are off-grid, on an obstacle, or shared.
pub fn validate_starts(room: &RoomModel, starts: &[Position]) -> Result<(), ConfigError> {
    let mut taken = BTreeSet::new();
    for (index, &position) in starts.iter().enumerate() {
        let id = index as RobotId + 1;
        let reason = if !room.in_bounds(position) {
            Some("out of bounds")
        } else if room.is_obstacle(position) {
            Some("obstacle")
        } else if !taken.insert(position) {
            Some("position already occupied")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::InvalidStart { id, position, reason });
        }
    }
    Ok(())
}

/// Everything the coordinator needs, loaded once.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub room: RoomModel,
    pub room_path: PathBuf,
    pub starts: Vec<Position>,
    pub initial_battery: BatteryLevel,
    /// `None` disables the battery tick in workers.
    pub tick: Option<Duration>,
    pub reply_timeout: Duration,
    pub grace_period: Duration,
    pub spawn_timeout: Duration,
    /// Executable re-launched in `worker` mode for each robot.
    pub worker_program: PathBuf,
    /// Log filter forwarded to workers.
    pub worker_log_level: String,
}

impl SessionConfig {
    pub fn load(room_path: &Path, starts_path: &Path, worker_program: PathBuf) -> Result<Self, ConfigError> {
        let room = RoomModel::load(room_path)?;
        let starts = load_start_positions(starts_path)?;
        validate_starts(&room, &starts)?;
        Ok(Self {
            room,
            room_path: room_path.to_path_buf(),
            starts,
            initial_battery: MAX_BATTERY,
            tick: Some(DEFAULT_TICK),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            worker_program,
            worker_log_level: "warn".to_string(),
        })
    }
}

/// Settings for one worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub id: RobotId,
    pub start: Position,
    pub battery: BatteryLevel,
    pub tick: Option<Duration>,
}
