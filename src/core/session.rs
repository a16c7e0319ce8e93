use crate::core::PageDriver;
use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One browser context/profile lifetime.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    /// The session's single page.
    fn page(&self) -> Arc<dyn PageDriver>;

    /// Release the context and the profile lock.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens fresh sessions; the supervisor calls it once per cycle.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>>;
}
