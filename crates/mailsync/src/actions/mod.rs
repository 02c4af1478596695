//! Message actions
//!
//! Label mutations (read, star, archive) applied on the server first and
//! then mirrored into the local cache.

mod handler;

pub use handler::ActionHandler;
