pub mod config;
pub mod driver;
pub mod identity;
pub mod session;

pub use config::Config;
pub use driver::{ElementRef, Locator, PageDriver};
pub use identity::Identity;
pub use session::{BrowserSession, SessionFactory};
