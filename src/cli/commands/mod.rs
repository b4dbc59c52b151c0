mod pending;
mod serve;
mod upload;

pub use pending::execute_pending;
pub use serve::execute_serve;
pub use upload::{execute_flush, execute_upload};
