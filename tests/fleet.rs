//! Fleet integration tests against real worker processes.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use grid_fleet::config::{RoomModel, SessionConfig};
use grid_fleet::fleet::{ChannelEvent, ExitReport, Fleet, Target};
use grid_fleet::protocol::{BlockReason, Request, Response};
use grid_fleet::robot::ControlEvent;
use grid_fleet::signals;
use grid_fleet::types::{Direction, Position, RobotId};
use tempfile::TempDir;

const ROOM: &str = "6 10\n1 (1,2)\n1 (3,4)\n";
const REPLY: Duration = Duration::from_secs(5);

fn session(dir: &TempDir, starts: Vec<Position>) -> SessionConfig {
    let room_path = dir.path().join("room.txt");
    fs::write(&room_path, ROOM).expect("write room");
    SessionConfig {
        room: RoomModel::parse(ROOM).expect("room parses"),
        room_path,
        starts,
        initial_battery: 100,
        tick: None,
        reply_timeout: REPLY,
        grace_period: Duration::from_secs(2),
        spawn_timeout: Duration::from_secs(10),
        worker_program: PathBuf::from(env!("CARGO_BIN_EXE_grid_fleet")),
        worker_log_level: "error".to_string(),
    }
}

fn round_trip(fleet: &mut Fleet, id: RobotId, request: Request) -> Response {
    fleet.send(id, request).expect("send");
    for event in fleet.collect_ready(&[id], REPLY) {
        if let ChannelEvent::Reply(from, response) = event {
            if from == id {
                return response;
            }
        }
    }
    panic!("robot {id} did not answer {request:?}");
}

#[test]
fn moves_are_answered_and_tracked() {
    let dir = TempDir::new().expect("tempdir");
    let mut fleet = Fleet::spawn_all(&session(&dir, vec![Position::new(0, 0), Position::new(5, 9)])).expect("spawn");
    assert_eq!(fleet.alive_ids(), vec![1, 2]);

    let reply = round_trip(&mut fleet, 1, Request::Move(Direction::Right));
    assert_eq!(
        reply,
        Response::Moved {
            position: Position::new(0, 1),
            battery: 95
        }
    );
    assert_eq!(fleet.handle(1).map(|h| h.position()), Some(Position::new(0, 1)));

    let reply = round_trip(&mut fleet, 1, Request::Move(Direction::Up));
    assert_eq!(reply, Response::Blocked(BlockReason::OutOfBounds));
    assert_eq!(round_trip(&mut fleet, 2, Request::Battery), Response::Battery(100));

    let reports = fleet.terminate_all(Duration::from_secs(2));
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].position, Some(Position::new(0, 1)));
    assert_eq!(reports[0].battery, Some(95));
    assert_eq!(reports[0].exit, ExitReport::Exited(0));
}

#[test]
fn suspended_worker_refuses_moves_until_resumed() {
    let dir = TempDir::new().expect("tempdir");
    let mut fleet = Fleet::spawn_all(&session(&dir, vec![Position::new(0, 0)])).expect("spawn");

    fleet.signal(1, ControlEvent::Suspend).expect("suspend");
    thread::sleep(Duration::from_millis(100));
    let reply = round_trip(&mut fleet, 1, Request::Move(Direction::Down));
    assert_eq!(reply, Response::Blocked(BlockReason::Suspended));
    assert_eq!(
        round_trip(&mut fleet, 1, Request::Position),
        Response::Position(Position::new(0, 0))
    );

    fleet.signal(1, ControlEvent::Resume).expect("resume");
    thread::sleep(Duration::from_millis(100));
    let reply = round_trip(&mut fleet, 1, Request::Move(Direction::Down));
    assert_eq!(
        reply,
        Response::Moved {
            position: Position::new(1, 0),
            battery: 95
        }
    );
    fleet.terminate_all(Duration::from_secs(2));
}

#[test]
fn worker_on_treasure_exits_with_distinct_status() {
    let dir = TempDir::new().expect("tempdir");
    let mut fleet = Fleet::spawn_all(&session(&dir, vec![Position::new(3, 3), Position::new(0, 0)])).expect("spawn");

    let reply = round_trip(&mut fleet, 1, Request::Move(Direction::Right));
    assert!(matches!(reply, Response::Moved { position, .. } if position == Position::new(3, 4)));

    let reports = fleet.terminate_all(Duration::from_secs(2));
    assert!(reports[0].exit.on_treasure());
    assert_eq!(reports[0].position, Some(Position::new(3, 4)));
    assert_eq!(reports[1].exit, ExitReport::Exited(0));
}

#[test]
fn killed_worker_is_reported_closed_and_excluded() {
    let dir = TempDir::new().expect("tempdir");
    let mut fleet = Fleet::spawn_all(&session(&dir, vec![Position::new(0, 0), Position::new(2, 2)])).expect("spawn");
    let pid = fleet.handle(2).map(|h| h.pid()).expect("handle");

    signals::send(pid, libc::SIGKILL).expect("kill");
    let mut closed = false;
    for _ in 0..10 {
        if fleet
            .collect_ready(&[2], Duration::from_millis(500))
            .contains(&ChannelEvent::Closed(2))
        {
            closed = true;
            break;
        }
    }
    assert!(closed, "closed channel not observed");
    assert_eq!(fleet.alive_ids(), vec![1]);
    assert!(fleet.health().is_lost(2));
    assert!(fleet.resolve(Target::One(2)).is_err());
    assert_eq!(fleet.resolve(Target::All).expect("resolve"), vec![1]);

    let reports = fleet.terminate_all(Duration::from_secs(2));
    assert_eq!(reports[1].position, None);
    assert_eq!(reports[1].exit, ExitReport::Signaled(libc::SIGKILL));
}

#[test]
fn spawn_failure_names_the_worker() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = session(&dir, vec![Position::new(0, 0)]);
    config.worker_program = dir.path().join("missing-binary");
    let err = Fleet::spawn_all(&config).err().expect("spawn must fail");
    assert!(err.to_string().contains("robot 1"), "{err}");
}
