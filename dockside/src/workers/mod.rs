pub mod health;
pub mod job_runner;
pub mod recovery;
pub mod routing;
