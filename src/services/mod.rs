pub mod batch;
pub mod clock;
pub mod lock;
pub mod mutation;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod watcher;
