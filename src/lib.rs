pub mod actions;
pub mod browser;
pub mod core;
pub mod dom;
pub mod errors;
pub mod monitor;
pub mod supervisor;
pub mod testing;
pub mod types;
pub mod utils;
pub mod workflow;

pub use crate::core::{BrowserSession, Config, Identity, Locator, PageDriver, SessionFactory};
pub use actions::{ActionIntent, ActionOutcome, ActionResolver, OptionChoice, Pacer};
pub use browser::{ChromeDriver, ChromeSessionFactory};
pub use dom::{PageClassifier, PageSnapshot};
pub use errors::{AutobookError, Result};
pub use monitor::{Alarm, AvailabilityMonitor, PageAudioAlarm};
pub use supervisor::{CycleSupervisor, SupervisorExit};
pub use types::*;
pub use workflow::{FlowPlan, WorkflowEngine};
