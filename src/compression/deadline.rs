use futures::future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Creates a linked deadline setter and the read side that honours it.
pub(crate) fn read_deadline() -> (DeadlineSetter, ReadDeadline) {
    let (tx, rx) = watch::channel(None);
    (
        DeadlineSetter { tx },
        ReadDeadline {
            rx,
            detached: false,
        },
    )
}

/// Arms the read deadline of a pump from outside the pump task.
#[derive(Debug)]
pub(crate) struct DeadlineSetter {
    tx: watch::Sender<Option<Instant>>,
}

impl DeadlineSetter {
    /// Any read still blocked `after` from now fails with `TimedOut`.
    pub(crate) fn arm(&self, after: Duration) {
        // The pump may already be gone, in which case there is nothing to interrupt.
        let _ = self.tx.send(Some(Instant::now() + after));
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Read deadline for connections that have no deadline setter of their own.
///
/// Reads go through [`ReadDeadline::read`], which races the read against the
/// currently armed deadline and picks up a deadline armed while it waits.
#[derive(Debug)]
pub(crate) struct ReadDeadline {
    rx: watch::Receiver<Option<Instant>>,
    detached: bool,
}

impl ReadDeadline {
    /// A deadline nobody can arm.
    pub(crate) fn unarmed() -> ReadDeadline {
        let (_, deadline) = read_deadline();
        deadline
    }

    pub(crate) async fn read<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let armed = *self.rx.borrow_and_update();
            if let Some(at) = armed {
                if at <= Instant::now() {
                    return Err(deadline_exceeded());
                }
            }
            let expired = async move {
                match armed {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                res = reader.read(buf) => return res,
                _ = expired => return Err(deadline_exceeded()),
                changed = self.rx.changed(), if !self.detached => {
                    if changed.is_err() {
                        // setter dropped, the last armed value stays in force
                        self.detached = true;
                    }
                }
            }
        }
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
}
