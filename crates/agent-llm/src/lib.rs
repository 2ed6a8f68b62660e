pub mod provider;
pub mod reader;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use provider::{GenerationOptions, LLMError, LLMProvider, LLMStream};
pub use reader::CancellableStream;
pub use types::LLMChunk;
