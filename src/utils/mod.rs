pub mod error;

pub use error::GeminiError;
