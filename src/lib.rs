pub mod config;
pub mod conversations;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod logging;
pub mod mailbox;
pub mod membership;
pub mod presence;
pub mod push;
pub mod server;
pub mod storage;
