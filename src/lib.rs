pub mod agent;
pub mod catalog;
pub mod chat;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod model;
pub mod node;
pub mod profiles;
pub mod prompts;
pub mod provider;
pub mod runner;
pub mod session;
pub mod telemetry;
pub mod template;
pub mod tool_policy;
pub mod tools;
pub mod workflow;

#[cfg(test)]
mod tests;
