pub mod chrome;
pub mod navigation;
pub mod session;

pub use chrome::ChromeDriver;
pub use navigation::{NavigationManager, NavigationResult};
pub use session::{ChromeSession, ChromeSessionFactory};
