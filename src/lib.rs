//! Grid fleet: a coordinator that drives one worker process per robot
//! across a grid room, talking to each over a line-framed pipe and
//! controlling it with signals.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod health_monitor;
pub mod logging;
pub mod protocol;
pub mod robot;
pub mod session;
pub mod signals;
pub mod types;
pub mod worker;
pub mod world;
