pub mod notifier;
pub mod observer;
pub mod snapshot;

pub use notifier::{ProgressMessage, ProgressNotifier};
pub use observer::ProgressObserver;
pub use snapshot::{format_bytes, ChunkSnapshot, ProgressSnapshot};
