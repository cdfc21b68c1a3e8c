pub mod error;
pub mod events;
pub mod logsink;
pub mod manager;
pub mod process;
pub mod program;
pub mod reaper;
pub mod signals;
pub mod supervisor;
pub mod tasks;
