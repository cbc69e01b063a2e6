pub mod chat;
pub mod notify;
pub mod signaling;

pub use chat::{ClientFrame, HistoryMessage, MediaItem, ServerFrame};
pub use notify::{Notification, NotifyFrame};
pub use signaling::SignalFrame;
