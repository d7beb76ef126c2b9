//! Operator directives, the collision policy, and the reply multiplexing
//! that ties the fleet to the world model.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::channel::remaining;
use crate::error::{CommandError, ProtocolError};
use crate::fleet::{ChannelEvent, FinalReport, Fleet, Target};
use crate::protocol::{BlockReason, Request, Response};
use crate::robot::ControlEvent;
use crate::types::{Direction, Position, RobotId};
use crate::world::WorldModel;

/// One parsed operator command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Move(Target, Direction),
    Print,
    Battery(Target),
    Position(Target),
    Sense(Target),
    Suspend(Target),
    Resume(Target),
    Status,
    Replenish,
    Exit,
}

impl Directive {
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let directive = match words.as_slice() {
            [] => return Ok(None),
            ["mv", target, direction] => Directive::Move(
                parse_target(target)?,
                Direction::parse(direction).ok_or_else(|| CommandError::BadDirection(direction.to_string()))?,
            ),
            ["mv", ..] => return Err(CommandError::Usage("mv <id|all> <up|down|left|right>")),
            ["print"] => Directive::Print,
            ["bat", target] => Directive::Battery(parse_target(target)?),
            ["bat", ..] => return Err(CommandError::Usage("bat <id|all>")),
            ["pos", target] => Directive::Position(parse_target(target)?),
            ["pos", ..] => return Err(CommandError::Usage("pos <id|all>")),
            ["sense", target] => Directive::Sense(parse_target(target)?),
            ["sense", ..] => return Err(CommandError::Usage("sense <id|all>")),
            ["suspend", target] => Directive::Suspend(parse_target(target)?),
            ["suspend", ..] => return Err(CommandError::Usage("suspend <id|all>")),
            ["resume", target] => Directive::Resume(parse_target(target)?),
            ["resume", ..] => return Err(CommandError::Usage("resume <id|all>")),
            ["status"] => Directive::Status,
            ["replenish"] => Directive::Replenish,
            ["exit"] => Directive::Exit,
            [other, ..] => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(directive))
    }
}

fn parse_target(word: &str) -> Result<Target, CommandError> {
    if word == "all" {
        return Ok(Target::All);
    }
    word.parse::<RobotId>()
        .map(Target::One)
        .map_err(|_| CommandError::BadTarget(word.to_string()))
}

/// Split of a batched move. `dispatch` workers head for free cells and go
/// out first; each `follow` entry maps a worker to the mover whose cell it
/// steps into, and goes out only once that mover reports `OK`. `rejected`
/// workers are refused locally with `BLOCKED Collision`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MovePlan {
    pub dispatch: Vec<RobotId>,
    pub follow: BTreeMap<RobotId, RobotId>,
    pub rejected: Vec<RobotId>,
}

/// Apply the collision policy to a batch. `movers` are the workers asked to
/// move; `occupied` holds every live worker's last-known position (movers
/// included). Movers sharing a destination are all rejected. A mover whose
/// destination is held by a worker that is not moving (or was itself
/// rejected) is rejected too; one stepping into a moving worker's cell
/// follows it.
pub fn plan_moves(movers: &[(RobotId, Position)], occupied: &[(RobotId, Position)], direction: Direction) -> MovePlan {
    let mut claims: HashMap<Position, usize> = HashMap::new();
    for &(_, position) in movers {
        *claims.entry(position.step(direction)).or_default() += 1;
    }
    let residents: HashMap<Position, RobotId> = occupied.iter().map(|&(id, at)| (at, id)).collect();
    let moving: BTreeSet<RobotId> = movers.iter().map(|&(id, _)| id).collect();
    let blocker = |id: RobotId, position: Position| {
        residents
            .get(&position.step(direction))
            .copied()
            .filter(|&other| other != id)
    };

    let mut rejected: BTreeSet<RobotId> = movers
        .iter()
        .filter(|&&(_, position)| claims.get(&position.step(direction)).copied().unwrap_or(0) > 1)
        .map(|&(id, _)| id)
        .collect();
    loop {
        let stuck: Vec<RobotId> = movers
            .iter()
            .filter(|&&(id, _)| !rejected.contains(&id))
            .filter(|&&(id, position)| {
                blocker(id, position).is_some_and(|other| !moving.contains(&other) || rejected.contains(&other))
            })
            .map(|&(id, _)| id)
            .collect();
        if stuck.is_empty() {
            break;
        }
        rejected.extend(stuck);
    }

    let mut plan = MovePlan::default();
    for &(id, position) in movers {
        if rejected.contains(&id) {
            plan.rejected.push(id);
        } else if let Some(leader) = blocker(id, position) {
            plan.follow.insert(id, leader);
        } else {
            plan.dispatch.push(id);
        }
    }
    plan
}

/// What came back for one dispatched request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Answer(Response),
    Malformed(ProtocolError),
    /// Channel closed before the worker answered.
    Lost,
    /// No answer before the reply timeout; the handle is retained.
    Stalled,
}

/// Whether the session loop keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Drives the fleet on behalf of the operator and keeps the world model in
/// step with worker replies. All operator-facing text goes to `out`.
pub struct Dispatcher<W: Write> {
    fleet: Fleet,
    world: WorldModel,
    reply_timeout: Duration,
    grace_period: Duration,
    out: W,
    announced_all_found: bool,
    /// Replies still owed for requests that timed out, per worker.
    overdue: BTreeMap<RobotId, usize>,
}

impl<W: Write> Dispatcher<W> {
    /// Take ownership of a started fleet; every worker's start position is
    /// merged into the world (a start on a treasure counts as a discovery).
    pub fn new(fleet: Fleet, world: WorldModel, reply_timeout: Duration, grace_period: Duration, out: W) -> Self {
        let mut dispatcher = Self {
            fleet,
            world,
            reply_timeout,
            grace_period,
            out,
            announced_all_found: false,
            overdue: BTreeMap::new(),
        };
        let starts: Vec<(RobotId, u32, Position)> = dispatcher
            .fleet
            .handles()
            .map(|handle| (handle.id(), handle.pid(), handle.position()))
            .collect();
        for (id, pid, position) in starts {
            dispatcher.say(format!("Robot {id} PID: {pid} Position: {position}"));
            dispatcher.merge_position(id, position);
        }
        dispatcher
    }

    pub fn execute(&mut self, directive: Directive) -> Flow {
        match directive {
            Directive::Move(Target::One(id), direction) => {
                self.move_one(id, direction);
                self.print_room_after_move();
            }
            Directive::Move(Target::All, direction) => {
                self.move_all(direction);
                self.print_room_after_move();
            }
            Directive::Print => self.print_room(),
            Directive::Battery(target) => {
                self.query(target, Request::Battery);
            }
            Directive::Position(target) => {
                self.query(target, Request::Position);
            }
            Directive::Sense(target) => {
                self.query(target, Request::Sense);
            }
            Directive::Suspend(target) => self.control(target, ControlEvent::Suspend),
            Directive::Resume(target) => self.control(target, ControlEvent::Resume),
            Directive::Status => self.status_all(),
            Directive::Replenish => self.replenish_all(),
            Directive::Exit => return Flow::Exit,
        }
        Flow::Continue
    }

    pub fn report_error(&mut self, err: &CommandError) {
        self.say(format!("error: {err}"));
    }

    /// Move a single worker after checking it would not land on another.
    pub fn move_one(&mut self, id: RobotId, direction: Direction) -> Option<Reply> {
        let Some(from) = self.live_position(id) else {
            return None;
        };
        let occupied = self.occupied();
        let plan = plan_moves(&[(id, from)], &occupied, direction);
        if !plan.dispatch.contains(&id) {
            let reply = Reply::Answer(Response::Blocked(BlockReason::Collision));
            self.print_move(id, &reply);
            return Some(reply);
        }
        let mut replies = self.dispatch(&[id], Request::Move(direction));
        let reply = replies.remove(&id).unwrap_or(Reply::Stalled);
        self.print_move(id, &reply);
        Some(reply)
    }

    /// Move every live worker one step; conflicting workers are refused
    /// locally and never contacted. Workers queued behind another mover go
    /// out in later waves, once the cell ahead has been vacated.
    pub fn move_all(&mut self, direction: Direction) -> BTreeMap<RobotId, Reply> {
        let occupied = self.occupied();
        let plan = plan_moves(&occupied, &occupied, direction);
        let collision = || Reply::Answer(Response::Blocked(BlockReason::Collision));
        let mut replies: BTreeMap<RobotId, Reply> = plan.rejected.iter().map(|&id| (id, collision())).collect();

        let mut wave = plan.dispatch;
        let mut queued = plan.follow;
        while !wave.is_empty() {
            let answered = self.dispatch(&wave, Request::Move(direction));
            let released: Vec<(RobotId, RobotId)> = queued
                .iter()
                .filter(|(_, leader)| answered.contains_key(*leader))
                .map(|(&follower, &leader)| (follower, leader))
                .collect();
            wave = Vec::new();
            for (follower, leader) in released {
                queued.remove(&follower);
                match answered.get(&leader) {
                    Some(Reply::Answer(Response::Moved { .. })) => wave.push(follower),
                    _ => {
                        replies.insert(follower, collision());
                    }
                }
            }
            replies.extend(answered);
        }
        for follower in queued.into_keys() {
            replies.insert(follower, collision());
        }
        for (id, reply) in &replies {
            self.print_move(*id, reply);
        }
        replies
    }

    /// Send a query to every targeted worker and print each answer.
    pub fn query(&mut self, target: Target, request: Request) -> BTreeMap<RobotId, Reply> {
        let ids = match self.fleet.resolve(target) {
            Ok(ids) => ids,
            Err(err) => {
                self.say(format!("error: {err}"));
                return BTreeMap::new();
            }
        };
        let replies = self.dispatch(&ids, request);
        for (id, reply) in &replies {
            let pid = self.fleet.handle(*id).map(|h| h.pid()).unwrap_or(0);
            self.say(format!("Robot {id} pid: {pid} status: {}", describe(reply)));
        }
        replies
    }

    /// Deliver a control event to each targeted worker.
    pub fn control(&mut self, target: Target, event: ControlEvent) {
        let ids = match self.fleet.resolve(target) {
            Ok(ids) => ids,
            Err(err) => {
                self.say(format!("error: {err}"));
                return;
            }
        };
        for id in ids {
            match self.fleet.signal(id, event) {
                Ok(()) => {
                    let verb = match event {
                        ControlEvent::Suspend => "suspended",
                        ControlEvent::Resume => "resumed",
                        ControlEvent::Replenish => "replenished",
                        ControlEvent::PrintStatus => "asked for status",
                        ControlEvent::Tick => "ticked",
                    };
                    self.say(format!("Robot {id} {verb}"));
                }
                Err(err) => self.say(format!("error: {err}")),
            }
        }
    }

    /// Every worker prints its own state; the coordinator adds what it knows.
    pub fn status_all(&mut self) {
        self.control(Target::All, ControlEvent::PrintStatus);
        let now = Instant::now();
        let lines: Vec<String> = self
            .fleet
            .handles()
            .map(|handle| {
                let health = self.fleet.health();
                let state = if !handle.is_alive() {
                    "terminated".to_string()
                } else if health.stalled_robots().contains(&handle.id()) {
                    format!("{} (stalled)", handle.run_state())
                } else {
                    handle.run_state().to_string()
                };
                let seen = health
                    .last_seen(handle.id())
                    .map(|at| format!("{}ms ago", now.duration_since(at).as_millis()))
                    .unwrap_or_else(|| "never".to_string());
                format!(
                    "Robot {} pid: {} position: {} battery: {} state: {} last reply: {}",
                    handle.id(),
                    handle.pid(),
                    handle.position(),
                    handle.battery(),
                    state,
                    seen
                )
            })
            .collect();
        for line in lines {
            self.say(line);
        }
    }

    pub fn replenish_all(&mut self) {
        self.say("Replenishing batteries".to_string());
        self.control(Target::All, ControlEvent::Replenish);
    }

    pub fn print_room(&mut self) {
        let view = self.world.render();
        self.say("Our information about the room so far:".to_string());
        self.say(view);
    }

    /// Terminate every worker, print each final report, merge final
    /// positions, and print the final room.
    pub fn shutdown(&mut self) -> Vec<FinalReport> {
        let reports = self.fleet.terminate_all(self.grace_period);
        for report in &reports {
            self.say(format!("Robot {} pid: {} last message:", report.id, report.pid));
            match (report.position, report.battery) {
                (Some(position), Some(battery)) => {
                    self.say(Response::Position(position).encode());
                    self.say(Response::Battery(battery).encode());
                    self.merge_position(report.id, position);
                }
                _ => {
                    self.say("no final report".to_string());
                    self.world.remove(report.id);
                }
            }
            self.say(format!("Robot {} finished with {}", report.id, report.exit));
        }
        self.say(String::new());
        self.say("Final room state:".to_string());
        let view = self.world.render();
        self.say(view);
        reports
    }

    /// Send `request` to each id and gather one reply per id, matched by
    /// channel rather than arrival order.
    fn dispatch(&mut self, ids: &[RobotId], request: Request) -> BTreeMap<RobotId, Reply> {
        self.absorb_late(ids);
        let mut replies = BTreeMap::new();
        let mut pending = BTreeSet::new();
        for &id in ids {
            match self.fleet.send(id, request) {
                Ok(()) => {
                    pending.insert(id);
                }
                Err(err) => {
                    self.say(format!("error: {err}"));
                    self.world.remove(id);
                    replies.insert(id, Reply::Lost);
                }
            }
        }

        let deadline = Instant::now() + self.reply_timeout;
        while !pending.is_empty() && Instant::now() < deadline {
            let waiting: Vec<RobotId> = pending.iter().copied().collect();
            for event in self.fleet.collect_ready(&waiting, remaining(deadline)) {
                match event {
                    ChannelEvent::Reply(id, response) if self.settle_overdue(id) => self.late_reply(id, &response),
                    ChannelEvent::Reply(id, response) if answers(request, &response) && pending.remove(&id) => {
                        self.merge_response(id, &response);
                        replies.insert(id, Reply::Answer(response));
                    }
                    ChannelEvent::Reply(id, response) => self.late_reply(id, &response),
                    ChannelEvent::Malformed(id, err) if self.settle_overdue(id) => {
                        warn!(robot = id, "malformed late reply: {err}");
                    }
                    ChannelEvent::Malformed(id, err) => {
                        warn!(robot = id, "malformed reply: {err}");
                        if pending.remove(&id) {
                            replies.insert(id, Reply::Malformed(err));
                        }
                    }
                    ChannelEvent::Closed(id) => {
                        self.lost(id);
                        if pending.remove(&id) {
                            replies.insert(id, Reply::Lost);
                        }
                    }
                }
            }
        }

        if !pending.is_empty() {
            let stalled = self.fleet.detect_stalled(self.reply_timeout);
            for id in pending {
                if stalled.contains(&id) {
                    warn!(robot = id, "no reply within {:?}", self.reply_timeout);
                }
                *self.overdue.entry(id).or_default() += 1;
                replies.insert(id, Reply::Stalled);
            }
        }
        replies
    }

    /// Pick up frames that arrived after their request timed out so they are
    /// not mistaken for answers to the next request.
    fn absorb_late(&mut self, ids: &[RobotId]) {
        for event in self.fleet.collect_ready(ids, Duration::ZERO) {
            match event {
                ChannelEvent::Reply(id, response) => {
                    self.settle_overdue(id);
                    self.late_reply(id, &response);
                }
                ChannelEvent::Malformed(id, err) => {
                    self.settle_overdue(id);
                    warn!(robot = id, "malformed late reply: {err}");
                }
                ChannelEvent::Closed(id) => self.lost(id),
            }
        }
    }

    /// Count one owed reply as paid. True when `id` still owed one, which
    /// makes the frame at hand the answer to an earlier, timed-out request.
    fn settle_overdue(&mut self, id: RobotId) -> bool {
        match self.overdue.get_mut(&id) {
            Some(owed) if *owed > 0 => {
                *owed -= 1;
                true
            }
            _ => false,
        }
    }

    fn late_reply(&mut self, id: RobotId, response: &Response) {
        info!(robot = id, "late reply '{response}'");
        self.say(format!("Robot {id} late reply: {response}"));
        self.merge_response(id, response);
    }

    fn lost(&mut self, id: RobotId) {
        self.overdue.remove(&id);
        self.say(format!("Robot {id} terminated unexpectedly"));
        self.world.remove(id);
    }

    fn merge_response(&mut self, id: RobotId, response: &Response) {
        match response {
            Response::Moved { position, .. } | Response::Position(position) | Response::Sensed { position, .. } => {
                self.merge_position(id, *position);
            }
            _ => {}
        }
    }

    fn merge_position(&mut self, id: RobotId, position: Position) {
        if self.world.apply_report(id, position) {
            self.say(format!("Treasure found by robot {id}!"));
        }
        if self.world.total_treasures() > 0 && self.world.all_found() && !self.announced_all_found {
            self.announced_all_found = true;
            self.say("All treasures found!".to_string());
        }
    }

    fn live_position(&mut self, id: RobotId) -> Option<Position> {
        match self.fleet.resolve(Target::One(id)) {
            Ok(_) => self.fleet.handle(id).map(|handle| handle.position()),
            Err(err) => {
                self.say(format!("error: {err}"));
                None
            }
        }
    }

    fn occupied(&self) -> Vec<(RobotId, Position)> {
        self.fleet
            .handles()
            .filter(|handle| handle.is_alive())
            .map(|handle| (handle.id(), handle.position()))
            .collect()
    }

    fn print_move(&mut self, id: RobotId, reply: &Reply) {
        self.say(format!("Robot {id} status: {}", describe(reply)));
    }

    fn print_room_after_move(&mut self) {
        self.say(String::new());
        self.say("Room state after movement:".to_string());
        let view = self.world.render();
        self.say(view);
    }

    fn say(&mut self, line: String) {
        if let Err(err) = writeln!(self.out, "{line}").and_then(|()| self.out.flush()) {
            warn!("operator output failed: {err}");
        }
    }
}

/// Whether `response` is a possible answer to `request`.
fn answers(request: Request, response: &Response) -> bool {
    match (request, response) {
        (_, Response::Error(_)) => true,
        (Request::Move(_), Response::Moved { .. } | Response::Blocked(_)) => true,
        (Request::Battery, Response::Battery(_)) => true,
        (Request::Position, Response::Position(_)) => true,
        (Request::Sense, Response::Sensed { .. }) => true,
        (Request::Exit, Response::Position(_) | Response::Battery(_)) => true,
        _ => false,
    }
}

fn describe(reply: &Reply) -> String {
    match reply {
        Reply::Answer(response) => response.encode(),
        Reply::Malformed(err) => format!("malformed reply ({err})"),
        Reply::Lost => "channel closed".to_string(),
        Reply::Stalled => "no reply (stalled)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_commands() {
        assert_eq!(
            Directive::parse("mv all up"),
            Ok(Some(Directive::Move(Target::All, Direction::Up)))
        );
        assert_eq!(
            Directive::parse("  mv 2 left "),
            Ok(Some(Directive::Move(Target::One(2), Direction::Left)))
        );
        assert_eq!(Directive::parse("bat all"), Ok(Some(Directive::Battery(Target::All))));
        assert_eq!(Directive::parse("pos 3"), Ok(Some(Directive::Position(Target::One(3)))));
        assert_eq!(Directive::parse("suspend 1"), Ok(Some(Directive::Suspend(Target::One(1)))));
        assert_eq!(Directive::parse("resume all"), Ok(Some(Directive::Resume(Target::All))));
        assert_eq!(Directive::parse("print"), Ok(Some(Directive::Print)));
        assert_eq!(Directive::parse("exit"), Ok(Some(Directive::Exit)));
        assert_eq!(Directive::parse(""), Ok(None));
    }

    #[test]
    fn rejects_bad_operator_commands() {
        assert_eq!(Directive::parse("fly 1"), Err(CommandError::Unknown("fly".to_string())));
        assert!(matches!(Directive::parse("mv 1"), Err(CommandError::Usage(_))));
        assert_eq!(Directive::parse("mv x up"), Err(CommandError::BadTarget("x".to_string())));
        assert_eq!(
            Directive::parse("mv 1 north"),
            Err(CommandError::BadDirection("north".to_string()))
        );
        assert!(matches!(Directive::parse("bat"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn unrelated_movers_are_all_dispatched() {
        let fleet = [(1, Position::new(1, 0)), (2, Position::new(1, 2)), (3, Position::new(4, 4))];
        let plan = plan_moves(&fleet, &fleet, Direction::Right);
        assert_eq!(plan.dispatch, vec![1, 2, 3]);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn moving_onto_a_stationary_worker_is_a_collision() {
        let fleet = [(1, Position::new(3, 3)), (2, Position::new(2, 3)), (3, Position::new(0, 0))];
        // Only robot 1 moves, and robot 2 stays where robot 1 is heading.
        let single = plan_moves(&fleet[..1], &fleet, Direction::Up);
        assert_eq!(single.rejected, vec![1]);
        assert!(single.dispatch.is_empty());
        assert!(single.follow.is_empty());
    }

    #[test]
    fn convoy_follows_its_leader() {
        let convoy = [(1, Position::new(2, 3)), (2, Position::new(3, 3))];
        let plan = plan_moves(&convoy, &convoy, Direction::Up);
        assert_eq!(plan.dispatch, vec![1]);
        assert_eq!(plan.follow, BTreeMap::from([(2, 1)]));
        assert!(plan.rejected.is_empty());

        let column = [(1, Position::new(3, 3)), (2, Position::new(2, 3)), (3, Position::new(1, 3))];
        let plan = plan_moves(&column, &column, Direction::Up);
        assert_eq!(plan.dispatch, vec![3]);
        assert_eq!(plan.follow, BTreeMap::from([(1, 2), (2, 3)]));
    }

    #[test]
    fn rejection_propagates_down_a_queue() {
        // Robot 2 queues behind robot 1; robot 3 is out of the way.
        let fleet = [(1, Position::new(1, 0)), (2, Position::new(1, -1)), (3, Position::new(0, 1))];
        let plan = plan_moves(&fleet[..2], &fleet, Direction::Right);
        assert_eq!(plan.dispatch, vec![1]);
        assert_eq!(plan.follow, BTreeMap::from([(2, 1)]));

        // With robot 3 parked on (1,1), the whole queue is refused.
        let blocked = [(1, Position::new(1, 0)), (2, Position::new(1, -1)), (3, Position::new(1, 1))];
        let plan = plan_moves(&blocked[..2], &blocked, Direction::Right);
        assert_eq!(plan.rejected, vec![1, 2]);
        assert!(plan.dispatch.is_empty());
    }

    #[test]
    fn replies_must_fit_the_request() {
        let moved = Response::Moved {
            position: Position::new(0, 1),
            battery: 95,
        };
        assert!(answers(Request::Move(Direction::Right), &moved));
        assert!(answers(Request::Move(Direction::Up), &Response::Blocked(BlockReason::Obstacle)));
        assert!(!answers(Request::Battery, &moved));
        assert!(answers(Request::Battery, &Response::Battery(40)));
        assert!(!answers(Request::Position, &Response::Battery(40)));
        assert!(answers(Request::Sense, &Response::Error("bad frame".to_string())));
    }

    #[test]
    fn shared_destination_rejects_every_claimant() {
        let movers = [(1, Position::new(0, 2)), (2, Position::new(0, 2)), (3, Position::new(4, 0))];
        let plan = plan_moves(&movers, &[], Direction::Down);
        assert_eq!(plan.rejected, vec![1, 2]);
        assert_eq!(plan.dispatch, vec![3]);
    }

    #[test]
    fn a_worker_never_collides_with_itself() {
        let fleet = [(1, Position::new(2, 2))];
        let plan = plan_moves(&fleet, &fleet, Direction::Left);
        assert_eq!(plan.dispatch, vec![1]);
    }
}
