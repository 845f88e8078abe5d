//! Core module - configuration, capture supervision, restart triggers and housekeeping

pub mod capture;
pub mod config;
pub mod housekeeping;
pub mod identity;
pub mod ini;
pub mod invocation;
pub mod notifier;
pub mod supervisor;
pub mod topology;
pub mod trigger;
pub mod upload;

pub use config::RecorderConfig;
pub use housekeeping::{ExclusiveOpenProbe, Housekeeper};
pub use identity::Identity;
pub use notifier::LogNotifier;
pub use supervisor::{Supervisor, SupervisorOptions};
pub use topology::SystemTopology;
pub use trigger::{RestartTrigger, TriggerSource};
pub use upload::HttpUploader;
