//! A Gemini protocol server over TLS.
//!
//! Each connection is admitted by a [`server::Gatekeeper`], reads exactly one request line
//! and hands a [`server::Request`] and [`server::Response`] to the application
//! [`server::Handler`].

pub mod config;
pub mod server;
pub mod utils;

pub use config::{ServerConfig, TlsOptions};
pub use server::{Handler, Request, Response, Server, ServerEvent, Status};
pub use utils::error::GeminiError;
