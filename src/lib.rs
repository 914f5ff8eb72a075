pub mod app;
pub mod backends;
pub mod error;
pub mod models;
pub mod platform;
pub mod router;
pub mod routing;

pub use error::{BackendError, Error, Result};
pub use router::{BackendStatus, Router};
