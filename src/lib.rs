pub mod chat_list;
pub mod chats;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod models;
pub mod receipts;
pub mod status;
pub mod storage;
pub mod store;

pub use error::{Error, Result};
