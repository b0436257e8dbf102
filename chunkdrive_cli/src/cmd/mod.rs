mod connect;
mod import;

pub use connect::run_connect;
pub use import::{ImportArgs, run_import};
