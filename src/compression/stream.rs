use crate::compression::decode_side::DecodeStream;
use crate::compression::encode_side::EncodeStream;
use crate::compression::shutdown::ShutdownState;
use crate::config::Role;
use crate::errors::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connection wrapped in either compression role
pub enum CompressedStream<S> {
    Encode(EncodeStream<S>),
    Decode(DecodeStream<S>),
}

impl<S> CompressedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn role(&self) -> Role {
        match self {
            CompressedStream::Encode(_) => Role::Encode,
            CompressedStream::Decode(_) => Role::Decode,
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self {
            CompressedStream::Encode(stream) => stream.state(),
            CompressedStream::Decode(stream) => stream.state(),
        }
    }

    pub async fn close_write(&mut self) -> io::Result<()> {
        match self {
            CompressedStream::Encode(stream) => stream.close_write().await,
            CompressedStream::Decode(stream) => stream.close_write().await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            CompressedStream::Encode(stream) => stream.close().await,
            CompressedStream::Decode(stream) => stream.close().await,
        }
    }
}

impl<S> AsyncRead for CompressedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CompressedStream::Encode(stream) => Pin::new(stream).poll_read(cx, buf),
            CompressedStream::Decode(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for CompressedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            CompressedStream::Encode(stream) => Pin::new(stream).poll_write(cx, buf),
            CompressedStream::Decode(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CompressedStream::Encode(stream) => Pin::new(stream).poll_flush(cx),
            CompressedStream::Decode(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CompressedStream::Encode(stream) => Pin::new(stream).poll_shutdown(cx),
            CompressedStream::Decode(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl<S> From<EncodeStream<S>> for CompressedStream<S> {
    fn from(stream: EncodeStream<S>) -> Self {
        CompressedStream::Encode(stream)
    }
}

impl<S> From<DecodeStream<S>> for CompressedStream<S> {
    fn from(stream: DecodeStream<S>) -> Self {
        CompressedStream::Decode(stream)
    }
}
