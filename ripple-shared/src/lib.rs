pub mod types;
pub mod errors;
pub mod middleware;
pub mod clients;

pub use errors::{AppError, AppResult, ErrorCode};
pub use types::*;
