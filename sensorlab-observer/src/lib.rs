//! SensorLab Observer
//!
//! Drives one sensor node through its controller and serial link, runs
//! experiment timetables against it, and turns everything it reports into
//! SensorLab event records.
//!
//! # Architecture
//!
//! - Node: lifecycle state machine over a controller (shell commands from a
//!   hardware profile) and a serial session (framing plug-in over a port)
//! - Experiment: lifecycle state machine binding a behavior to the node and
//!   running its timetable on a scheduler thread
//! - Output: an emitter that encodes events and hands records to a transport
//!   worker over a bounded queue
//! - Observer: console command dispatch and bootstrap from persisted state
//!
//! Encoding, decoding and capture files come from `sensorlab-codec`.

pub mod command;
pub mod config;
pub mod error;
pub mod experiment;
pub mod node;
pub mod observer;
pub mod output;
pub mod persistence;
pub mod scheduler;

pub use error::{ObserverError, Result};
pub use experiment::{Experiment, ExperimentState};
pub use node::{Node, NodeState};
pub use observer::{Observer, Reply};
