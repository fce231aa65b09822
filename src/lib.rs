pub mod config;
pub mod modules;
pub mod services;

pub use services::index_repair::{fix_kyc_token_index, repair, RepairError, RepairReport};
