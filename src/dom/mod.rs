pub mod classifier;
pub mod snapshot;
pub mod text;

pub use classifier::PageClassifier;
pub use snapshot::PageSnapshot;
