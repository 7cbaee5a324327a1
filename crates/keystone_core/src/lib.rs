pub mod cancellation;
pub mod config_key;
pub mod hash;
pub mod key_path;
pub mod types;
