use crate::compression::codec::{Decoder, Encoder};
use crate::compression::deadline::{self, DeadlineSetter, ReadDeadline};
use crate::compression::pump::{self, Direction, PumpExit, PumpHandle};
use crate::compression::shutdown::{
    grace_expired, not_connected, CloseErrors, Coordinator, ShutdownState, CLOSE_GRACE,
    SHUTDOWN_DEADLINE,
};
use crate::config::CodecOptions;
use crate::errors::*;
use futures::future::poll_fn;
use futures::ready;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::time;
use tracing::{debug, warn};

/// Capacity of each in-process relay between the caller and a pump.
pub const RELAY_CAPACITY: usize = 64 * 1024;

/// Encode-side wrapper: the connection carries plain bytes.
///
/// A read pump drains the connection, compresses and flushes every chunk into
/// a relay the caller reads from. A write pump takes the compressed bytes the
/// caller writes, decompresses them and forwards them to the connection. The
/// two directions share nothing but the connection itself.
pub struct EncodeStream<S> {
    /// Compressed bytes produced by the read pump. Dropped on close so a pump
    /// blocked on a full relay stops too.
    relay_read: Option<DuplexStream>,
    /// Compressed bytes handed to the write pump.
    relay_write: DuplexStream,
    read_pump: PumpHandle<ReadHalf<S>>,
    write_pump: PumpHandle<WriteHalf<S>>,
    deadline: DeadlineSetter,
    coordinator: Coordinator,
}

impl<S> EncodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Builds both codecs, then splits the connection and spawns the pumps.
    /// Must be called from within a tokio runtime.
    pub fn new(conn: S, options: &CodecOptions) -> io::Result<EncodeStream<S>> {
        let encoder = Encoder::new(options)?;
        let decoder = Decoder::new(options)?;

        let (conn_read, conn_write) = split(conn);
        let (relay_read, read_sink) = tokio::io::duplex(RELAY_CAPACITY);
        let (relay_write, write_source) = tokio::io::duplex(RELAY_CAPACITY);
        let (deadline, read_deadline) = deadline::read_deadline();

        let read_task = tokio::spawn(compress_pump(conn_read, read_sink, encoder, read_deadline));
        let write_task = tokio::spawn(decompress_pump(write_source, conn_write, decoder));

        Ok(EncodeStream {
            relay_read: Some(relay_read),
            relay_write,
            read_pump: PumpHandle::new(Direction::Compress, read_task),
            write_pump: PumpHandle::new(Direction::Decompress, write_task),
            deadline,
            coordinator: Coordinator::new(),
        })
    }

    pub fn state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    /// Stops the write direction: the write pump drains what was already
    /// written, ends decoding and half-closes the connection. Waits at most
    /// [`CLOSE_GRACE`] before aborting the pump.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Stops both pumps and closes the connection.
    ///
    /// A pump blocked reading a silent connection is interrupted by arming a
    /// [`SHUTDOWN_DEADLINE`] on its reads. A second call returns `NotOpen`.
    pub async fn close(&mut self) -> Result<()> {
        self.coordinator.check_open()?;
        let mut errors = CloseErrors::default();

        self.deadline.arm(SHUTDOWN_DEADLINE);

        if self.coordinator.state() == ShutdownState::Open {
            if let Err(e) = poll_fn(|cx| self.poll_close_write(cx)).await {
                errors.shutdown(format!("error closing write direction: {}", e));
            }
        }
        if self.write_pump.is_running() {
            self.write_pump.join(CLOSE_GRACE).await;
        }
        drop(self.relay_read.take());
        self.read_pump.join(CLOSE_GRACE).await;

        let read = self.read_pump.finished_mut().and_then(|finished| {
            if let Err(e) = &finished.status {
                match e.kind() {
                    // caused by the armed deadline or by dropping the relay above
                    io::ErrorKind::TimedOut | io::ErrorKind::BrokenPipe => {
                        debug!(error = %e, "read direction interrupted by close")
                    }
                    _ => errors.shutdown(format!("read direction failed: {}", e)),
                }
            }
            errors.codec(std::mem::replace(&mut finished.codec_close, Ok(())));
            finished.half.take()
        });
        let write = self.write_pump.finished_mut().and_then(|finished| {
            errors.codec(std::mem::replace(&mut finished.codec_close, Ok(())));
            finished.half.take().map(|half| (half, finished.sealed))
        });

        match (read, write) {
            (Some(read), Some((write, sealed))) => {
                let mut conn = read.unsplit(write);
                if !sealed {
                    let closed = time::timeout(CLOSE_GRACE, conn.shutdown())
                        .await
                        .unwrap_or_else(|_| Err(grace_expired("connection shutdown")));
                    errors.connection(closed);
                }
                drop(conn);
            }
            _ => {
                // an aborted pump took its half down with it
                warn!("connection closed without a final shutdown");
            }
        }

        self.coordinator.mark_closed();
        debug!("encode-side stream closed");
        errors.into_result()
    }

    fn poll_close_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.relay_write).poll_shutdown(cx))?;

        if self.write_pump.poll_join(cx).is_pending() {
            ready!(self.coordinator.poll_grace(cx));
            self.write_pump.abort();
            self.coordinator.mark_write_closed();
            return Poll::Ready(Err(grace_expired("write pump")));
        }

        self.coordinator.mark_write_closed();
        match self.write_pump.terminal_error() {
            Some(e) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<S> Drop for EncodeStream<S> {
    fn drop(&mut self) {
        // let a read pump stuck on a silent connection go away with us
        if !self.deadline.is_armed() {
            self.deadline.arm(SHUTDOWN_DEADLINE);
        }
    }
}

async fn compress_pump<S>(
    mut conn_read: ReadHalf<S>,
    mut relay: DuplexStream,
    mut encoder: Encoder,
    mut deadline: ReadDeadline,
) -> PumpExit<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    let report = pump::run(
        Direction::Compress,
        &mut conn_read,
        &mut relay,
        &mut encoder,
        &mut deadline,
    )
    .await;
    // the caller sees end-of-stream once the relay is gone
    drop(relay);
    PumpExit {
        half: conn_read,
        report,
    }
}

async fn decompress_pump<S>(
    mut relay: DuplexStream,
    mut conn_write: WriteHalf<S>,
    mut decoder: Decoder,
) -> PumpExit<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    let report = pump::run(
        Direction::Decompress,
        &mut relay,
        &mut conn_write,
        &mut decoder,
        &mut ReadDeadline::unarmed(),
    )
    .await;
    drop(relay);
    PumpExit {
        half: conn_write,
        report,
    }
}

impl<S> AsyncRead for EncodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.coordinator.check_readable()?;

        let relay = match this.relay_read.as_mut() {
            Some(relay) => relay,
            None => return Poll::Ready(Err(not_connected())),
        };
        let filled = buf.filled().len();
        ready!(Pin::new(relay).poll_read(cx, buf))?;
        if buf.filled().len() > filled || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // the relay ended, report how the read pump ended
        ready!(this.read_pump.poll_join(cx));
        match this.read_pump.terminal_error() {
            Some(e) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<S> AsyncWrite for EncodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.coordinator.check_writable()?;

        match ready!(Pin::new(&mut this.relay_write).poll_write(cx, buf)) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) => {
                // the write pump is gone, prefer its reason over the broken relay
                ready!(this.write_pump.poll_join(cx));
                Poll::Ready(Err(this.write_pump.terminal_error().unwrap_or(e)))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.coordinator.state() {
            ShutdownState::Open => Pin::new(&mut this.relay_write).poll_flush(cx),
            ShutdownState::WriteClosed => Poll::Ready(Ok(())),
            ShutdownState::Closed => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.coordinator.state() {
            ShutdownState::Closed => Poll::Ready(Err(not_connected())),
            ShutdownState::WriteClosed => Poll::Ready(Ok(())),
            ShutdownState::Open => this.poll_close_write(cx),
        }
    }
}
