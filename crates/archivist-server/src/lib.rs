pub mod catalog;
pub mod config;
mod server;

pub use catalog::*;
pub use config::*;
pub use server::{DynArchiveApi, ServerError, build_api_router, serve};
