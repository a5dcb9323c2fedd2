pub mod crypto;
pub mod dirs;
pub mod http;
pub mod process;
pub mod retry;
pub mod types;
