pub mod event_queue;
pub mod listener;
pub mod provision;
pub mod types;

pub use event_queue::{EventQueue, PgEventQueue, PAGE_SIZE};
pub use listener::NotificationListener;
pub use types::*;
