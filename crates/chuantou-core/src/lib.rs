mod context;
pub mod control;
mod error;
pub mod frame;
pub mod log;
pub mod types;

#[cfg(test)]
mod tests;

pub use context::AppContext;
pub use error::*;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the tunnel can run over (plain TCP or a
/// TLS wrap of it).
pub trait AbstractStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AbstractStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
