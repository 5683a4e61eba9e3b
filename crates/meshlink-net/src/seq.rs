//! Sequential frame exchange
//!
//! Lets a small protocol be written as a flat list of send/expect steps.
//! The first failing step is recorded with its label and every later step
//! becomes a no-op, so the caller checks for an error once at the end.

use crate::framing::{FrameError, Framer};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Why a step failed
#[derive(Debug, Error)]
pub enum StepFailure {
    /// The frame read did not match the expected bytes
    #[error("not equal")]
    NotEqual { expected: Bytes, actual: Bytes },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A failed step of an exchange, labelled with the step that failed
#[derive(Debug, Error)]
#[error("{step}: {cause}")]
pub struct SeqError {
    pub step: String,
    #[source]
    pub cause: StepFailure,
}

impl SeqError {
    /// True when the peer answered with unexpected bytes rather than failing I/O
    pub fn is_mismatch(&self) -> bool {
        matches!(self.cause, StepFailure::NotEqual { .. })
    }
}

/// Short-circuiting send/expect helper over a [`Framer`].
///
/// Not meant to be shared between tasks; one exchange per stream.
pub struct SeqFramer<S> {
    framer: Framer<S>,
    error: Option<SeqError>,
}

impl<S> SeqFramer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Start an exchange over `framer`
    pub fn new(framer: Framer<S>) -> Self {
        Self {
            framer,
            error: None,
        }
    }

    /// The first failure, if any step failed
    pub fn error(&self) -> Option<&SeqError> {
        self.error.as_ref()
    }

    /// Finish the exchange, yielding the first failure
    pub fn finish(self) -> Result<Framer<S>, SeqError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.framer),
        }
    }

    /// Read a frame and require it to equal `expected` byte for byte
    pub async fn expect_frame(&mut self, expected: &[u8], step: &str) {
        if self.error.is_some() {
            return;
        }

        let result = match self.framer.read_frame().await {
            Ok(actual) if actual.as_ref() == expected => Ok(()),
            Ok(actual) => Err(StepFailure::NotEqual {
                expected: Bytes::copy_from_slice(expected),
                actual,
            }),
            Err(e) => Err(e.into()),
        };
        self.record(result, step);
    }

    /// Write `payload` as one frame
    pub async fn send_frame(&mut self, payload: &[u8], step: &str) {
        if self.error.is_some() {
            return;
        }

        let result = self.framer.write_frame(payload).await.map(|_| ());
        self.record(result.map_err(StepFailure::from), step);
    }

    fn record(&mut self, result: Result<(), StepFailure>, step: &str) {
        if let Err(cause) = result {
            self.error = Some(SeqError {
                step: step.to_owned(),
                cause,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_seq_framer_short_circuits() {
        let (a, b) = duplex(1024);
        // Echo everything written on `a` straight back to it
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(b);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let mut sf = SeqFramer::new(Framer::new(a));
        sf.send_frame(b"hello", "write1").await;
        assert!(sf.error().is_none());

        sf.send_frame(b"hello2", "write2").await;
        assert!(sf.error().is_none());

        sf.expect_frame(b"hello", "check1").await;
        assert!(sf.error().is_none());

        sf.expect_frame(b"hello", "check2").await;
        let err = sf.error().unwrap();
        assert_eq!(err.to_string(), "check2: not equal");
        assert!(err.is_mismatch());

        sf.send_frame(b"ok", "write3").await;
        assert_eq!(sf.error().unwrap().to_string(), "check2: not equal");
        assert_eq!(sf.error().unwrap().step, "check2");
    }

    #[tokio::test]
    async fn test_seq_framer_io_failure_is_not_mismatch() {
        let (a, b) = duplex(1024);
        drop(b);

        let mut sf = SeqFramer::new(Framer::new(a));
        sf.expect_frame(b"hello", "read hello").await;
        sf.send_frame(b"hello2", "write hello2").await;

        let err = sf.finish().err().unwrap();
        assert_eq!(err.step, "read hello");
        assert!(!err.is_mismatch());
        assert!(matches!(err.cause, StepFailure::Frame(FrameError::Closed)));
    }
}
