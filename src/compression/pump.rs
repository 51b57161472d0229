use crate::compression::codec::{Decoder, Encoder};
use crate::compression::deadline::ReadDeadline;
use bytes::BytesMut;
use futures::future::poll_fn;
use futures::ready;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, warn};

/// Bytes read from the source per pump iteration.
pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Direction {
    Compress,
    Decompress,
}

/// Codec step a pump applies to every chunk it moves.
pub(crate) trait Transform: Send {
    fn apply(&mut self, chunk: &[u8], output: &mut BytesMut) -> io::Result<()>;

    /// Called once the source is exhausted or failed.
    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()>;
}

impl Transform for Encoder {
    fn apply(&mut self, chunk: &[u8], output: &mut BytesMut) -> io::Result<()> {
        // flushing every chunk keeps the peer from waiting on zstd's internal buffer
        self.encode_flush(chunk, output)
    }

    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()> {
        self.close(output)
    }
}

impl Transform for Decoder {
    fn apply(&mut self, chunk: &[u8], output: &mut BytesMut) -> io::Result<()> {
        self.decode(chunk, output)
    }

    fn finish(&mut self, _output: &mut BytesMut) -> io::Result<()> {
        self.close()
    }
}

/// What a pump did before it stopped.
#[derive(Debug)]
pub(crate) struct PumpReport {
    /// Terminal status of the transfer itself.
    pub(crate) status: io::Result<()>,
    /// Result of closing the codec.
    pub(crate) codec_close: io::Result<()>,
    /// Whether the sink was shut down after the last write.
    pub(crate) sealed: bool,
    pub(crate) bytes_in: u64,
    pub(crate) bytes_out: u64,
}

/// Moves bytes from `source` through `transform` into `sink` until the source
/// reaches end-of-stream or something fails.
///
/// On end-of-stream the codec is closed, its trailing output written and the
/// sink shut down so the half-close travels on. On error the sink is left as
/// is and the error becomes the pump's terminal status.
pub(crate) async fn run<R, W, T>(
    direction: Direction,
    source: &mut R,
    sink: &mut W,
    transform: &mut T,
    deadline: &mut ReadDeadline,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Transform,
{
    let mut chunk = vec![0; CHUNK_SIZE];
    let mut output = BytesMut::with_capacity(CHUNK_SIZE);
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let status = loop {
        let n = match deadline.read(source, &mut chunk).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        bytes_in += n as u64;

        if let Err(e) = transform.apply(&chunk[..n], &mut output) {
            break Err(e);
        }
        if output.is_empty() {
            continue;
        }
        match write_out(sink, &mut output).await {
            Ok(written) => bytes_out += written,
            Err(e) => break Err(e),
        }
    };

    let codec_close = transform.finish(&mut output);
    let mut sealed = false;
    let status = match status {
        Ok(()) => match seal(sink, &mut output).await {
            Ok(written) => {
                bytes_out += written;
                sealed = true;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match &status {
        Ok(()) => debug!(?direction, bytes_in, bytes_out, "pump finished"),
        Err(e) => debug!(?direction, bytes_in, bytes_out, error = %e, "pump stopped"),
    }

    PumpReport {
        status,
        codec_close,
        sealed,
        bytes_in,
        bytes_out,
    }
}

async fn write_out<W>(sink: &mut W, output: &mut BytesMut) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let len = output.len() as u64;
    sink.write_all(&output[..]).await?;
    sink.flush().await?;
    output.clear();
    Ok(len)
}

async fn seal<W>(sink: &mut W, output: &mut BytesMut) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let written = if output.is_empty() {
        0
    } else {
        write_out(sink, output).await?
    };
    sink.shutdown().await?;
    Ok(written)
}

/// Output of a pump task: the connection half it owned and its report.
pub(crate) struct PumpExit<H> {
    pub(crate) half: H,
    pub(crate) report: PumpReport,
}

/// A pump whose task has completed, been aborted, or panicked.
pub(crate) struct Finished<H> {
    pub(crate) half: Option<H>,
    pub(crate) status: io::Result<()>,
    pub(crate) codec_close: io::Result<()>,
    pub(crate) sealed: bool,
}

impl<H> Finished<H> {
    fn from_join(direction: Direction, joined: Result<PumpExit<H>, JoinError>) -> Finished<H> {
        match joined {
            Ok(exit) => Finished {
                half: Some(exit.half),
                status: exit.report.status,
                codec_close: exit.report.codec_close,
                sealed: exit.report.sealed,
            },
            Err(e) => {
                let status = if e.is_cancelled() {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{:?} pump aborted after the shutdown grace period", direction),
                    )
                } else {
                    warn!(?direction, error = %e, "pump task failed");
                    io::Error::new(io::ErrorKind::Other, format!("{:?} pump failed: {}", direction, e))
                };
                Finished {
                    half: None,
                    status: Err(status),
                    codec_close: Ok(()),
                    sealed: false,
                }
            }
        }
    }
}

enum State<H> {
    Running(JoinHandle<PumpExit<H>>),
    Finished(Finished<H>),
}

/// Handle on a spawned pump task that keeps its outcome once it is known.
pub(crate) struct PumpHandle<H> {
    direction: Direction,
    state: State<H>,
}

impl<H> PumpHandle<H> {
    pub(crate) fn new(direction: Direction, task: JoinHandle<PumpExit<H>>) -> PumpHandle<H> {
        PumpHandle {
            direction,
            state: State::Running(task),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    pub(crate) fn poll_join(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let State::Running(task) = &mut self.state {
            let joined = ready!(Pin::new(task).poll(cx));
            self.state = State::Finished(Finished::from_join(self.direction, joined));
        }
        Poll::Ready(())
    }

    /// Waits for the pump to stop on its own for at most `grace`, then aborts
    /// it. Returns whether it stopped in time.
    pub(crate) async fn join(&mut self, grace: Duration) -> bool {
        let in_time = time::timeout(grace, poll_fn(|cx| self.poll_join(cx)))
            .await
            .is_ok();
        if !in_time {
            warn!(direction = ?self.direction, ?grace, "pump did not stop in time, aborting");
            self.abort();
            poll_fn(|cx| self.poll_join(cx)).await;
        }
        in_time
    }

    pub(crate) fn abort(&self) {
        if let State::Running(task) = &self.state {
            task.abort();
        }
    }

    /// A copy of the terminal error, if the pump has finished with one.
    pub(crate) fn terminal_error(&self) -> Option<io::Error> {
        match &self.state {
            State::Finished(Finished {
                status: Err(e), ..
            }) => Some(copy_error(e)),
            _ => None,
        }
    }

    pub(crate) fn finished_mut(&mut self) -> Option<&mut Finished<H>> {
        match &mut self.state {
            State::Finished(finished) => Some(finished),
            State::Running(_) => None,
        }
    }
}

pub(crate) fn copy_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}
