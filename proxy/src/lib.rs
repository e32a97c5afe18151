pub mod config;
pub mod downstream;
pub mod events;
pub mod hashrate;
pub mod jobs;
pub mod metrics;
pub mod router;
pub mod scheduler;
pub mod stratum;
pub mod supervisor;
pub mod upstream;
