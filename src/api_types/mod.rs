mod error;

pub use error::{ErrorCode, ErrorResponse};
