use crate::error::Error;

use tokio::sync::watch;
use tokio::time::Instant;

use std::future::Future;
use std::time::Duration;

/// Deadline and cancellation signal shared by every loader of a run.
#[derive(Clone, Debug)]
pub struct Context {
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

/// Cancels every [`Context`] derived from the same run.
#[derive(Debug)]
pub struct Canceler {
    send: watch::Sender<bool>,
}

impl Canceler {
    pub fn cancel(&self) {
        let _ = self.send.send(true);
    }
}

impl Context {
    pub fn with_timeout(timeout: Duration) -> (Self, Canceler) {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> (Self, Canceler) {
        let (send, cancel) = watch::channel(false);
        (Context { deadline, cancel }, Canceler { send })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn check(&self) -> Result<(), Error> {
        if *self.cancel.borrow() {
            Err(Error::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(Error::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Drives `f` until it completes, the deadline passes or the run is
    /// cancelled, whichever comes first.
    pub async fn run<T, F: Future<Output = T>>(&self, f: F) -> Result<T, Error> {
        self.check()?;
        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            // A dropped canceler can no longer cancel anything.
            if cancel.wait_for(|c| *c).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            r = f => Ok(r),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded),
            _ = cancelled => Err(Error::Cancelled),
        }
    }
}
