use crate::config::{CodecOptions, Role, StreamCompressConfig};
use crate::errors::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

mod codec;
mod deadline;
mod decode_side;
mod encode_side;
mod pump;
mod shutdown;
mod stream;

pub use codec::{Decoder, Encoder};
pub use decode_side::DecodeStream;
pub use encode_side::{EncodeStream, RELAY_CAPACITY};
pub use pump::CHUNK_SIZE;
pub use shutdown::{ShutdownState, CLOSE_GRACE, SHUTDOWN_DEADLINE};
pub use stream::CompressedStream;

/// Factory for compressed streams sharing one validated configuration.
///
/// The dictionary is loaded once, when the factory is built, and shared by
/// every stream it wraps.
#[derive(Debug, Clone)]
pub struct StreamCompress {
    options: CodecOptions,
    role: Role,
}

impl StreamCompress {
    pub fn new(config: &StreamCompressConfig) -> Result<StreamCompress> {
        let options = config.codec_options()?;
        debug!(
            algorithm = %options.algorithm,
            level = options.level.get(),
            dictionary = options.dictionary.as_ref().map_or(0, |d| d.len()),
            role = %config.role,
            "stream compression configured"
        );
        Ok(StreamCompress::from_options(options, config.role))
    }

    pub fn from_options(options: CodecOptions, role: Role) -> StreamCompress {
        StreamCompress { options, role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Wraps `conn` in the configured role. Encode-side streams spawn their
    /// pumps here, so this must run inside a tokio runtime.
    pub fn wrap<S>(&self, conn: S) -> Result<CompressedStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream = match self.role {
            Role::Encode => EncodeStream::new(conn, &self.options).map(CompressedStream::Encode),
            Role::Decode => DecodeStream::new(conn, &self.options).map(CompressedStream::Decode),
        };
        stream.map_err(|e| ErrorKind::Codec(format!("error creating zstd codec: {}", e)).into())
    }
}

/// Validates `config` and wraps `conn` with it in one step.
pub fn wrap<S>(conn: S, config: &StreamCompressConfig) -> Result<CompressedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    StreamCompress::new(config)?.wrap(conn)
}
