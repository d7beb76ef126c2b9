//! Coordinator-side world model: what the fleet has learned about the room.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::RoomModel;
use crate::types::{Cell, Position, RobotId};

/// Grid of cell beliefs merged from worker reports.
///
/// Cells start `Unknown`, except obstacles which the coordinator reads from
/// the room file up front. A cell shows a robot only while some worker stands
/// on it; once vacated it reverts to `Empty` or `Treasure`.
pub struct WorldModel {
    room: RoomModel,
    cells: Vec<Vec<Cell>>,
    occupants: BTreeMap<RobotId, Position>,
    discovered: BTreeSet<Position>,
}

impl WorldModel {
    pub fn new(room: RoomModel) -> Self {
        let mut cells = vec![vec![Cell::Unknown; room.cols() as usize]; room.rows() as usize];
        for obstacle in room.obstacles() {
            cells[obstacle.row as usize][obstacle.col as usize] = Cell::Obstacle;
        }
        Self {
            room,
            cells,
            occupants: BTreeMap::new(),
            discovered: BTreeSet::new(),
        }
    }

    /// Merge a worker's reported position. Returns true when this report is
    /// the first time any worker stood on that treasure.
    pub fn apply_report(&mut self, id: RobotId, position: Position) -> bool {
        if !self.room.in_bounds(position) || self.room.is_obstacle(position) {
            warn!(robot = id, %position, "ignoring impossible position report");
            return false;
        }
        if let Some(previous) = self.occupants.insert(id, position) {
            if previous != position {
                self.vacate(previous);
            }
        }
        self.occupy(position)
    }

    /// Forget a worker that left the session; its cell is vacated.
    pub fn remove(&mut self, id: RobotId) {
        if let Some(previous) = self.occupants.remove(&id) {
            self.vacate(previous);
        }
    }

    pub fn cell(&self, position: Position) -> Option<Cell> {
        if !self.room.in_bounds(position) {
            return None;
        }
        Some(self.cells[position.row as usize][position.col as usize])
    }

    /// Fixed-symbol view, one line per row.
    pub fn render(&self) -> String {
        self.cells
            .iter()
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn found(&self) -> usize {
        self.discovered.len()
    }

    pub fn total_treasures(&self) -> usize {
        self.room.treasure_count()
    }

    pub fn all_found(&self) -> bool {
        self.found() == self.total_treasures()
    }

    fn set(&mut self, position: Position, cell: Cell) {
        self.cells[position.row as usize][position.col as usize] = cell;
    }

    fn occupy(&mut self, position: Position) -> bool {
        if self.room.is_treasure(position) {
            self.set(position, Cell::RobotOnTreasure);
            self.discovered.insert(position)
        } else {
            self.set(position, Cell::RobotOnEmpty);
            false
        }
    }

    fn vacate(&mut self, position: Position) {
        if self.occupants.values().any(|&other| other == position) {
            return;
        }
        let base = if self.room.is_treasure(position) {
            Cell::Treasure
        } else {
            Cell::Empty
        };
        self.set(position, base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldModel {
        let room = RoomModel::new(3, 4, [Position::new(1, 1)], [Position::new(0, 1), Position::new(2, 3)])
            .expect("valid room");
        WorldModel::new(room)
    }

    #[test]
    fn fresh_world_knows_only_obstacles() {
        let world = world();
        assert_eq!(world.render(), "? ? ? ?\n? X ? ?\n? ? ? ?");
        assert_eq!(world.found(), 0);
        assert!(!world.all_found());
    }

    #[test]
    fn moving_reverts_previous_cell_to_room_type() {
        let mut world = world();
        assert!(!world.apply_report(1, Position::new(0, 0)));
        assert!(world.apply_report(1, Position::new(0, 1)));
        assert_eq!(world.cell(Position::new(0, 0)), Some(Cell::Empty));
        assert_eq!(world.cell(Position::new(0, 1)), Some(Cell::RobotOnTreasure));

        assert!(!world.apply_report(1, Position::new(0, 2)));
        assert_eq!(world.cell(Position::new(0, 1)), Some(Cell::Treasure));
        assert_eq!(world.render(), "- T R ?\n? X ? ?\n? ? ? ?");
    }

    #[test]
    fn found_counter_is_monotonic() {
        let mut world = world();
        assert!(world.apply_report(1, Position::new(0, 1)));
        world.apply_report(1, Position::new(0, 0));
        assert!(!world.apply_report(2, Position::new(0, 1)));
        world.remove(2);
        assert_eq!(world.found(), 1);

        assert!(world.apply_report(3, Position::new(2, 3)));
        assert_eq!(world.found(), 2);
        assert!(world.all_found());
    }

    #[test]
    fn shared_cell_keeps_robot_marker_until_last_leaves() {
        let mut world = world();
        world.apply_report(1, Position::new(2, 0));
        world.apply_report(2, Position::new(2, 0));
        world.apply_report(1, Position::new(2, 1));
        assert_eq!(world.cell(Position::new(2, 0)), Some(Cell::RobotOnEmpty));
        world.remove(2);
        assert_eq!(world.cell(Position::new(2, 0)), Some(Cell::Empty));
    }

    #[test]
    fn render_is_idempotent_and_reports_repeat() {
        let mut world = world();
        world.apply_report(1, Position::new(2, 2));
        let first = world.render();
        assert_eq!(world.render(), first);
        world.apply_report(1, Position::new(2, 2));
        assert_eq!(world.render(), first);
        assert_eq!(first, "? ? ? ?\n? X ? ?\n? ? R ?");
    }

    #[test]
    fn impossible_reports_are_ignored() {
        let mut world = world();
        assert!(!world.apply_report(1, Position::new(7, 7)));
        assert!(!world.apply_report(1, Position::new(1, 1)));
        assert_eq!(world.cell(Position::new(1, 1)), Some(Cell::Obstacle));
        assert_eq!(world.cell(Position::new(-1, 0)), None);
    }
}
