pub mod blueprint;
pub mod config;
pub mod console;
pub mod docker;
pub mod error;
pub mod filesystem;
pub mod image_resolver;
pub mod install;
pub mod instance_manager;
pub mod lockfile;
pub mod port_alloc;
pub mod runtime;
pub mod startup;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::AgentConfig;
pub use error::{OrchestratorError, Result};
pub use instance_manager::{CreateRequest, InstanceManager, InstanceView, SettingsPatch, Transition};
