pub mod humanize;
pub mod intent;
pub mod resolver;

pub use humanize::Pacer;
pub use intent::{ActionIntent, ActionOutcome, OptionChoice};
pub use resolver::ActionResolver;
