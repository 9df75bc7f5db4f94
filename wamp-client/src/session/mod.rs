pub mod handle;
pub mod handler;
pub mod options;
pub(crate) mod session;
pub mod types;
