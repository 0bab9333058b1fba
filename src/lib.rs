pub mod agents;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod invoker;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod synthesis;
pub mod telemetry;

#[cfg(test)]
mod tests;
