pub mod check;
pub mod replay;

pub use check::run_config_check;
pub use replay::{run_replay, RecordedSession, ReplaySummary};
