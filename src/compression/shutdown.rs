use crate::errors::*;
use futures::ready;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{self, Sleep};

/// How long `close` lets a pump blocked in a read keep waiting.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_millis(10);

/// Upper bound on waiting for a direction to drain during `close_write`/`close`.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a wrapped stream. `Closed` can be entered from either state.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ShutdownState {
    Open,
    WriteClosed,
    Closed,
}

/// Tracks the shutdown state of one wrapper and the grace timer of an
/// in-progress close-write.
#[derive(Debug)]
pub(crate) struct Coordinator {
    state: ShutdownState,
    grace: Option<Pin<Box<Sleep>>>,
}

impl Coordinator {
    pub(crate) fn new() -> Coordinator {
        Coordinator {
            state: ShutdownState::Open,
            grace: None,
        }
    }

    pub(crate) fn state(&self) -> ShutdownState {
        self.state
    }

    pub(crate) fn check_readable(&self) -> io::Result<()> {
        match self.state {
            ShutdownState::Closed => Err(not_connected()),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_writable(&self) -> io::Result<()> {
        match self.state {
            ShutdownState::Open => Ok(()),
            ShutdownState::WriteClosed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write side of the compressed stream is closed",
            )),
            ShutdownState::Closed => Err(not_connected()),
        }
    }

    /// Fails with `NotOpen` once the stream has been closed.
    pub(crate) fn check_open(&self) -> Result<()> {
        match self.state {
            ShutdownState::Closed => Err(ErrorKind::NotOpen.into()),
            _ => Ok(()),
        }
    }

    /// Ready once [`CLOSE_GRACE`] has passed since the first call.
    pub(crate) fn poll_grace(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let grace = self
            .grace
            .get_or_insert_with(|| Box::pin(time::sleep(CLOSE_GRACE)));
        ready!(grace.as_mut().poll(cx));
        Poll::Ready(())
    }

    pub(crate) fn mark_write_closed(&mut self) {
        self.grace = None;
        if self.state == ShutdownState::Open {
            self.state = ShutdownState::WriteClosed;
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.grace = None;
        self.state = ShutdownState::Closed;
    }
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "compressed stream is closed")
}

pub(crate) fn grace_expired(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} did not finish within {:?}", what, CLOSE_GRACE),
    )
}

/// Collects the errors seen while closing and picks the one to report.
///
/// A failed close of the underlying connection always wins. Otherwise the
/// first codec or write-direction failure is reported.
#[derive(Debug, Default)]
pub(crate) struct CloseErrors {
    connection: Option<io::Error>,
    other: Option<Error>,
}

impl CloseErrors {
    pub(crate) fn connection(&mut self, result: io::Result<()>) {
        if let Err(e) = result {
            if self.connection.is_none() {
                self.connection = Some(e);
            }
        }
    }

    pub(crate) fn codec(&mut self, result: io::Result<()>) {
        if let Err(e) = result {
            self.record(ErrorKind::Codec(e.to_string()).into());
        }
    }

    pub(crate) fn shutdown(&mut self, msg: String) {
        self.record(ErrorKind::Shutdown(msg).into());
    }

    fn record(&mut self, err: Error) {
        if self.other.is_none() {
            self.other = Some(err);
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if let Some(e) = self.connection {
            return Err(e.into());
        }
        match self.other {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compression::shutdown::{CloseErrors, Coordinator, ShutdownState};
    use crate::errors::ErrorKind;
    use std::io;

    #[test]
    fn state_transitions() {
        let mut coordinator = Coordinator::new();
        assert!(coordinator.check_writable().is_ok());

        coordinator.mark_write_closed();
        assert_eq!(coordinator.state(), ShutdownState::WriteClosed);
        assert!(coordinator.check_readable().is_ok());
        assert_eq!(
            coordinator.check_writable().unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert!(coordinator.check_open().is_ok());

        coordinator.mark_closed();
        coordinator.mark_write_closed();
        assert_eq!(coordinator.state(), ShutdownState::Closed);
        assert_eq!(
            coordinator.check_readable().unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(matches!(
            coordinator.check_open().unwrap_err().kind(),
            ErrorKind::NotOpen
        ));
    }

    #[test]
    fn connection_error_is_never_masked() {
        let mut errors = CloseErrors::default();
        errors.codec(Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame")));
        errors.connection(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));

        let err = errors.into_result().unwrap_err();
        match err.kind() {
            ErrorKind::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn first_codec_error_wins_over_later_ones() {
        let mut errors = CloseErrors::default();
        errors.connection(Ok(()));
        errors.codec(Err(io::Error::new(io::ErrorKind::InvalidData, "first")));
        errors.shutdown("second".to_string());

        let err = errors.into_result().unwrap_err();
        match err.kind() {
            ErrorKind::Codec(msg) => assert!(msg.contains("first")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn no_errors_is_ok() {
        assert!(CloseErrors::default().into_result().is_ok());
    }
}
