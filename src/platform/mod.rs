pub mod credentials;
pub mod paths;

pub use paths::RouterPaths;
