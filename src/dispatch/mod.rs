//! Concurrent dispatch of one command to many hosts
//!
//! - `job`: per-host state and the line-splitting output writer
//! - `pool`: bounded worker pool
//! - `render`: live terminal view and JSON report
//! - `runner`: the SSH pipeline behind each job

pub mod job;
pub mod pool;
pub mod render;
mod runner;

pub use job::{Job, JobReport, JobWriter, TAIL_LINES};
pub use pool::{dispatch, HostRunner, QUEUE_CAPACITY};
pub use render::{render_frame, write_json_report, Renderer, RENDER_INTERVAL};
pub use runner::SshRunner;
