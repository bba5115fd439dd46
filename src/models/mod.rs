pub mod change;
pub mod dataset;
pub mod external_job;
pub mod job;
pub mod mutation;
pub mod requests;
