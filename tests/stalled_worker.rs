//! A scripted worker that answers slowly and ignores `EXIT`, driven through
//! the dispatcher.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use grid_fleet::config::{RoomModel, SessionConfig};
use grid_fleet::dispatcher::{Dispatcher, Reply};
use grid_fleet::fleet::{ExitReport, Fleet, Target};
use grid_fleet::protocol::{Request, Response};
use grid_fleet::types::{Direction, Position};
use grid_fleet::world::WorldModel;
use tempfile::TempDir;

const ROOM: &str = "6 10\n1 (1,2)\n1 (3,4)\n";

// Answers its first request after a second, its second at once, then hangs.
const SLOW_WORKER: &str = "#!/bin/sh
echo 'READY 1'
read request
sleep 1
echo 'OK 0 1 95'
read request
echo 'BATTERY 95'
read request
exec sleep 30
";

fn write_stub(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("slow-worker.sh");
    fs::write(&path, SLOW_WORKER).expect("write stub");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

#[test]
fn stalled_worker_is_kept_and_force_killed_at_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let room_path = dir.path().join("room.txt");
    fs::write(&room_path, ROOM).expect("write room");
    let room = RoomModel::parse(ROOM).expect("room parses");
    let config = SessionConfig {
        room: room.clone(),
        room_path,
        starts: vec![Position::new(0, 0)],
        initial_battery: 100,
        tick: None,
        reply_timeout: Duration::from_millis(700),
        grace_period: Duration::from_millis(300),
        spawn_timeout: Duration::from_secs(10),
        worker_program: write_stub(dir.path()),
        worker_log_level: "error".to_string(),
    };

    let fleet = Fleet::spawn_all(&config).expect("spawn stub");
    let mut output = Vec::new();
    let mut dispatcher = Dispatcher::new(
        fleet,
        WorldModel::new(room),
        config.reply_timeout,
        config.grace_period,
        &mut output,
    );

    assert_eq!(dispatcher.move_one(1, Direction::Right), Some(Reply::Stalled));

    // The move's answer lands while this query is outstanding and must not
    // be taken for it.
    let replies = dispatcher.query(Target::One(1), Request::Battery);
    assert_eq!(replies.get(&1), Some(&Reply::Answer(Response::Battery(95))));

    let reports = dispatcher.shutdown();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].exit, ExitReport::ForceKilled);
    assert_eq!(reports[0].position, None);

    drop(dispatcher);
    let transcript = String::from_utf8(output).expect("utf-8 output");
    assert!(transcript.contains("Robot 1 status: no reply (stalled)"), "{transcript}");
    assert!(transcript.contains("Robot 1 late reply: OK 0 1 95"), "{transcript}");
    assert!(transcript.contains("status: BATTERY 95"), "{transcript}");
    assert!(transcript.contains("finished with force-killed after grace period"), "{transcript}");
}
