//! Durable visit history

mod history;

pub use history::{AppendError, DurableLog, FileLog, HistoryStore};
