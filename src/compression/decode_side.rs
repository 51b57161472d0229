use crate::compression::codec::{Decoder, Encoder};
use crate::compression::pump::{copy_error, CHUNK_SIZE};
use crate::compression::shutdown::{
    grace_expired, not_connected, CloseErrors, Coordinator, ShutdownState, CLOSE_GRACE,
};
use crate::config::CodecOptions;
use crate::errors::*;
use bytes::{Buf, Bytes, BytesMut};
use futures::future::poll_fn;
use futures::ready;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time;
use tracing::debug;

/// Decode-side wrapper: the connection carries compressed bytes.
///
/// Reads pull compressed bytes from the connection and decode them on demand.
/// Writes are compressed, flushed and fully written to the connection before
/// they are reported as done.
pub struct DecodeStream<S> {
    conn: Option<S>,
    decoder: Decoder,
    encoder: Encoder,
    raw: Box<[u8]>,
    decoded: BytesMut,
    read_eof: bool,
    read_error: Option<io::Error>,
    /// Encoded bytes not yet accepted by the connection.
    pending: BytesMut,
    /// Caller bytes of a write that returned `Pending` while `pending` drained.
    /// A retry with the same bytes completes that write instead of encoding
    /// them again.
    accepted: Option<Bytes>,
    coordinator: Coordinator,
}

impl<S> DecodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: S, options: &CodecOptions) -> io::Result<DecodeStream<S>> {
        let decoder = Decoder::new(options)?;
        let encoder = Encoder::new(options)?;

        Ok(DecodeStream {
            conn: Some(conn),
            decoder,
            encoder,
            raw: vec![0; CHUNK_SIZE].into_boxed_slice(),
            decoded: BytesMut::new(),
            read_eof: false,
            read_error: None,
            pending: BytesMut::new(),
            accepted: None,
            coordinator: Coordinator::new(),
        })
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.conn.as_ref()
    }

    pub fn state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    /// Writes the final zstd frame trailer and half-closes the connection.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Ends the frame, closes the codecs and closes the connection.
    ///
    /// The trailer write and the half-close are each bounded by
    /// [`CLOSE_GRACE`]. A second call returns `NotOpen`.
    pub async fn close(&mut self) -> Result<()> {
        self.coordinator.check_open()?;
        let mut errors = CloseErrors::default();

        if self.coordinator.state() == ShutdownState::Open {
            self.accepted = None;
            match self.encoder.close(&mut self.pending) {
                Ok(()) => {
                    let drained = time::timeout(CLOSE_GRACE, poll_fn(|cx| self.poll_drain(cx)))
                        .await
                        .unwrap_or_else(|_| Err(grace_expired("final frame write")));
                    if let Err(e) = drained {
                        errors.shutdown(format!("error writing final frame: {}", e));
                    }
                }
                Err(e) => errors.codec(Err(e)),
            }

            if let Some(conn) = self.conn.as_mut() {
                let closed = time::timeout(CLOSE_GRACE, conn.shutdown())
                    .await
                    .unwrap_or_else(|_| Err(grace_expired("connection shutdown")));
                errors.connection(closed);
            }
            self.coordinator.mark_write_closed();
        }

        errors.codec(self.decoder.close());
        self.pending.clear();
        // dropping the connection is the close
        drop(self.conn.take());
        self.coordinator.mark_closed();
        debug!("decode-side stream closed");

        errors.into_result()
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Poll::Ready(Err(not_connected())),
        };

        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut *conn).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Pin::new(conn).poll_flush(cx)
    }

    fn poll_seal(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.encoder.close(&mut self.pending)?;
        ready!(self.poll_drain(cx))?;
        match self.conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl<S> AsyncRead for DecodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.coordinator.check_readable()?;
        if let Some(e) = &this.read_error {
            return Poll::Ready(Err(copy_error(e)));
        }

        loop {
            if !this.decoded.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.decoded.len());
                buf.put_slice(&this.decoded[..n]);
                this.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let conn = match this.conn.as_mut() {
                Some(conn) => conn,
                None => return Poll::Ready(Err(not_connected())),
            };
            let mut raw = ReadBuf::new(&mut this.raw[..]);
            ready!(Pin::new(conn).poll_read(cx, &mut raw))?;
            let n = raw.filled().len();

            if n == 0 {
                this.read_eof = true;
                this.decoder.close()?;
                continue;
            }
            if let Err(e) = this.decoder.decode(&this.raw[..n], &mut this.decoded) {
                // the decoder state can no longer be trusted
                this.read_error = Some(copy_error(&e));
                return Poll::Ready(Err(e));
            }
        }
    }
}

impl<S> AsyncWrite for DecodeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.coordinator.check_writable()?;

        if this.accepted.is_some() {
            if let Err(e) = ready!(this.poll_drain(cx)) {
                this.pending.clear();
                this.accepted = None;
                return Poll::Ready(Err(e));
            }
            match this.accepted.take() {
                Some(previous) if previous[..] == *buf => {
                    return Poll::Ready(Ok(previous.len()));
                }
                Some(previous) => {
                    // the earlier write was abandoned; its bytes are on the wire
                    // but do not count toward this one
                    debug!(abandoned = previous.len(), "finished an abandoned write");
                }
                None => {}
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Err(e) = this.encoder.encode_flush(buf, &mut this.pending) {
            this.pending.clear();
            return Poll::Ready(Err(e));
        }

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => {
                this.pending.clear();
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                this.accepted = Some(Bytes::copy_from_slice(buf));
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.coordinator.check_readable()?;
        this.poll_drain(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.coordinator.state() {
            ShutdownState::Closed => return Poll::Ready(Err(not_connected())),
            ShutdownState::WriteClosed => return Poll::Ready(Ok(())),
            ShutdownState::Open => {}
        }

        this.accepted = None;
        let result = match this.poll_seal(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                ready!(this.coordinator.poll_grace(cx));
                Err(grace_expired("close write"))
            }
        };
        this.coordinator.mark_write_closed();
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::compression::codec::{Decoder, Encoder};
    use crate::compression::decode_side::DecodeStream;
    use crate::compression::shutdown::ShutdownState;
    use crate::config::CodecOptions;
    use crate::errors::ErrorKind;
    use bytes::BytesMut;
    use futures::future::poll_fn;
    use std::io;
    use std::pin::Pin;
    use std::task::Poll;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

    const MESSAGE: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua";

    /// Bytes zstd cannot shrink much, so they stay larger than a tiny pipe.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    /// Polls one write once, leaving it unfinished when the connection is full.
    async fn poll_write_once<S>(stream: &mut DecodeStream<S>, buf: &[u8]) -> Poll<io::Result<usize>>
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        poll_fn(|cx| Poll::Ready(Pin::new(&mut *stream).poll_write(cx, buf))).await
    }

    #[tokio::test]
    async fn read_decodes_from_connection() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();

        let compressed = zstd::encode_all(MESSAGE.as_bytes(), 3).unwrap();
        far.write_all(&compressed).await.unwrap();
        far.shutdown().await.unwrap();

        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, MESSAGE);
    }

    #[tokio::test]
    async fn single_write_is_decodable_by_peer() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();

        let written = stream.write(MESSAGE.as_bytes()).await.unwrap();
        assert_eq!(written, MESSAGE.len());

        // no further writes and no close: the flushed block alone must decode
        let mut decoder = Decoder::new(&CodecOptions::default()).unwrap();
        let mut decoded = BytesMut::new();
        let mut buf = [0; 1024];
        while decoded.len() < MESSAGE.len() {
            let n = tokio::time::timeout(Duration::from_secs(2), far.read(&mut buf))
                .await
                .expect("peer saw no data")
                .unwrap();
            assert!(n > 0);
            decoder.decode(&buf[..n], &mut decoded).unwrap();
        }
        assert_eq!(&decoded[..], MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn malformed_input_fails_every_later_read() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();
        far.write_all(b"plain text where a zstd frame belongs").await.unwrap();

        let mut buf = [0; 64];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn close_write_ends_frame_and_half_closes() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();

        stream.write_all(MESSAGE.as_bytes()).await.unwrap();
        stream.close_write().await.unwrap();
        stream.close_write().await.unwrap();
        assert_eq!(stream.state(), ShutdownState::WriteClosed);
        assert!(stream.write(b"late").await.is_err());

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(zstd::decode_all(&received[..]).unwrap(), MESSAGE.as_bytes());

        // reads still work after the write side is closed
        let mut encoder = Encoder::new(&CodecOptions::default()).unwrap();
        let mut compressed = BytesMut::new();
        encoder.encode_flush(b"reply", &mut compressed).unwrap();
        far.write_all(&compressed).await.unwrap();
        let mut buf = [0; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn close_twice_reports_not_open() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();
        stream.write_all(MESSAGE.as_bytes()).await.unwrap();

        stream.close().await.unwrap();
        let err = stream.close().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotOpen));

        let mut buf = [0; 8];
        assert_eq!(
            stream.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(zstd::decode_all(&received[..]).unwrap(), MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn abandoned_write_does_not_count_toward_next_write() {
        let (near, mut far) = tokio::io::duplex(8);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();
        let abandoned = noise(4096);

        assert!(poll_write_once(&mut stream, &abandoned).await.is_pending());

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            far.read_to_end(&mut received).await.unwrap();
            received
        });

        let n = stream.write(b"y").await.unwrap();
        assert_eq!(n, 1);
        stream.close_write().await.unwrap();

        let received = reader.await.unwrap();
        let decoded = zstd::decode_all(&received[..]).unwrap();
        assert_eq!(decoded.len(), abandoned.len() + 1);
        assert_eq!(&decoded[..abandoned.len()], &abandoned[..]);
        assert_eq!(decoded[abandoned.len()], b'y');
    }

    #[tokio::test]
    async fn retried_write_is_sent_once() {
        let (near, mut far) = tokio::io::duplex(8);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();
        let payload = noise(4096);

        assert!(poll_write_once(&mut stream, &payload).await.is_pending());

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            far.read_to_end(&mut received).await.unwrap();
            received
        });

        stream.write_all(&payload).await.unwrap();
        stream.close_write().await.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(zstd::decode_all(&received[..]).unwrap(), payload);
    }

    #[tokio::test]
    async fn close_write_gives_up_when_connection_never_drains() {
        // the peer never reads, so nothing beyond 16 bytes can leave
        let (near, _far) = tokio::io::duplex(16);
        let mut stream = DecodeStream::new(near, &CodecOptions::default()).unwrap();

        assert!(poll_write_once(&mut stream, &noise(64 * 1024)).await.is_pending());

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(3), stream.close_write())
            .await
            .expect("close_write ignored the grace period")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(stream.state(), ShutdownState::WriteClosed);

        tokio::time::timeout(Duration::from_secs(1), stream.close())
            .await
            .expect("close hung after close_write gave up")
            .unwrap();
        assert_eq!(
            stream.write(b"late").await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
