//! Worker-side state machine: position, battery, run-state.
//!
//! `Robot` is driven by two inputs. Requests arrive one at a time from the
//! inbound channel and are answered with a `Response`. Control events arrive
//! out of band and only ever run between requests, so they cannot observe a
//! half-applied move.

use crate::config::RoomModel;
use crate::protocol::{BlockReason, Request, Response};
use crate::types::{
    BatteryLevel, Direction, MAX_BATTERY, MOVE_COST, Position, RobotId, RunState, TICK_COST,
};

/// Out-of-band events delivered to a worker independently of its channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Suspend,
    Resume,
    PrintStatus,
    Replenish,
    Tick,
}

/// What the worker loop should do after handling a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Send these frames and keep serving.
    Reply(Response),
    /// Send these frames in order, then exit with the given status.
    Terminate { frames: Vec<Response>, status: i32 },
}

/// Exit status for a worker leaving normally.
pub const EXIT_NORMAL: i32 = 0;
/// Exit status for a worker that was standing on a treasure when told to exit.
pub const EXIT_ON_TREASURE: i32 = 10;
/// Exit status for a worker whose channel broke.
pub const EXIT_CHANNEL_FAILURE: i32 = 1;

pub struct Robot {
    id: RobotId,
    position: Position,
    battery: BatteryLevel,
    state: RunState,
    room: RoomModel,
}

impl Robot {
    pub fn new(id: RobotId, position: Position, battery: BatteryLevel, room: RoomModel) -> Self {
        Self {
            id,
            position,
            battery: battery.min(MAX_BATTERY),
            state: RunState::Active,
            room,
        }
    }

    pub fn id(&self) -> RobotId {
        self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn battery(&self) -> BatteryLevel {
        self.battery
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    /// One line describing the worker for the status control event.
    pub fn status_line(&self) -> String {
        format!(
            "id: {} P: ({},{}) Bat: {} State: {}",
            self.id, self.position.row, self.position.col, self.battery, self.state
        )
    }

    pub fn handle(&mut self, request: Request) -> Outcome {
        match request {
            Request::Move(direction) => Outcome::Reply(match self.try_move(direction) {
                Ok(()) => Response::Moved {
                    position: self.position,
                    battery: self.battery,
                },
                Err(reason) => Response::Blocked(reason),
            }),
            Request::Battery => Outcome::Reply(Response::Battery(self.battery)),
            Request::Position => Outcome::Reply(Response::Position(self.position)),
            Request::Sense => Outcome::Reply(Response::Sensed {
                position: self.position,
                treasure: self.room.is_treasure(self.position),
            }),
            Request::Exit => Outcome::Terminate {
                frames: vec![Response::Position(self.position), Response::Battery(self.battery)],
                status: self.exit_status(),
            },
        }
    }

    /// Apply a control event. `PrintStatus` has no effect on state; the
    /// caller emits `status_line` itself.
    pub fn apply(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Suspend => self.state = RunState::Suspended,
            ControlEvent::Resume => self.state = RunState::Active,
            ControlEvent::PrintStatus => {}
            ControlEvent::Replenish => self.battery = MAX_BATTERY,
            // A suspended worker's battery is frozen.
            ControlEvent::Tick if self.state == RunState::Active => {
                self.battery = self.battery.saturating_sub(TICK_COST);
            }
            ControlEvent::Tick => {}
        }
    }

    pub fn exit_status(&self) -> i32 {
        if self.room.is_treasure(self.position) {
            EXIT_ON_TREASURE
        } else {
            EXIT_NORMAL
        }
    }

    fn try_move(&mut self, direction: Direction) -> Result<(), BlockReason> {
        if self.state == RunState::Suspended {
            return Err(BlockReason::Suspended);
        }
        if self.battery < MOVE_COST {
            return Err(BlockReason::LowBattery);
        }
        let target = self.position.step(direction);
        if !self.room.in_bounds(target) {
            return Err(BlockReason::OutOfBounds);
        }
        if self.room.is_obstacle(target) {
            return Err(BlockReason::Obstacle);
        }
        self.position = target;
        self.battery -= MOVE_COST;
        Ok(())
    }
}
