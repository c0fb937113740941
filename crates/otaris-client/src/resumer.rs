//! Resumable artifact download stream.
//!
//! Artifact downloads are long-running and routinely outlive flaky
//! connections. [`UpdateResumer`] wraps the HTTP body and behaves as a
//! byte stream of exactly `content_length` bytes: whenever the upstream
//! breaks (an error, or an end of stream before all bytes arrived), it
//! waits with exponential backoff and asks its resume function for a new
//! body starting at the current offset via an HTTP range request. Servers
//! that ignore the lower range bound are reconciled by discarding the
//! surplus prefix of the new body.

use std::io::{self, Read};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::ClientResult;

/// Number of attempts before the backoff interval doubles.
const PER_INTERVAL_ATTEMPTS: u32 = 3;

/// Default smallest backoff unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(60);

/// The backoff budget is spent.
#[derive(Debug, Error)]
#[error("tried maximum amount of times")]
pub struct RetriesExhausted;

/// Compute the wait before retry number `tried`.
///
/// Starts with one smallest unit and keeps each interval for three
/// attempts before doubling it. Once the interval reaches `max_interval`,
/// three more attempts are allowed before the budget is spent.
pub fn exponential_backoff(
    tried: u32,
    max_interval: Duration,
    smallest_unit: Duration,
) -> Result<Duration, RetriesExhausted> {
    let mut interval = smallest_unit;
    let mut next_interval = interval;

    let mut count = 0;
    while count <= tried {
        interval = next_interval;
        next_interval *= 2;
        if interval >= max_interval {
            if tried - count >= PER_INTERVAL_ATTEMPTS {
                return Err(RetriesExhausted);
            }
            if max_interval < smallest_unit {
                return Ok(smallest_unit);
            }
            return Ok(max_interval);
        }
        count += PER_INTERVAL_ATTEMPTS;
    }
    Ok(interval)
}

/// A freshly resumed stream as returned by a [`ResumeFn`].
pub struct ResumedStream {
    pub body: Box<dyn Read + Send>,
    /// First byte offset the new body starts at.
    pub first_byte: u64,
    /// Total size reported by the server.
    pub total_size: u64,
}

/// Issues a range request starting at the given offset.
pub type ResumeFn = Box<dyn FnMut(u64) -> ClientResult<ResumedStream> + Send>;

/// Byte stream of exactly `content_length` bytes that survives broken
/// connections.
pub struct UpdateResumer {
    stream: Box<dyn Read + Send>,
    offset: u64,
    content_length: u64,
    retry_attempts: u32,
    max_wait: Duration,
    smallest_unit: Duration,
    resume: ResumeFn,
}

impl std::fmt::Debug for UpdateResumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateResumer")
            .field("offset", &self.offset)
            .field("content_length", &self.content_length)
            .field("retry_attempts", &self.retry_attempts)
            .field("max_wait", &self.max_wait)
            .field("smallest_unit", &self.smallest_unit)
            .finish_non_exhaustive()
    }
}

impl UpdateResumer {
    /// Wrap a response body.
    ///
    /// Nothing must have been read from `stream` yet.
    pub fn new(
        stream: Box<dyn Read + Send>,
        content_length: u64,
        max_wait: Duration,
        resume: ResumeFn,
    ) -> Self {
        Self {
            stream,
            offset: 0,
            content_length,
            retry_attempts: 0,
            max_wait,
            smallest_unit: DEFAULT_BACKOFF_UNIT,
            resume,
        }
    }

    /// Lower the smallest backoff unit, e.g. for tests.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.smallest_unit = unit;
        self
    }

    /// The total number of bytes this stream delivers.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Reconnect at the current offset, sleeping with exponential backoff
    /// between attempts.
    fn recover(&mut self, cause: &io::Error) -> io::Result<()> {
        loop {
            error!("download connection broken: {cause}");
            let wait =
                exponential_backoff(self.retry_attempts, self.max_wait, self.smallest_unit)
                    .map_err(|exhausted| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("cannot resume download: {exhausted}"),
                        )
                    })?;
            info!("resuming download in {wait:?}");
            self.retry_attempts += 1;
            std::thread::sleep(wait);

            info!(
                "attempting to resume artifact download from offset {}",
                self.offset
            );
            let resumed = match (self.resume)(self.offset) {
                Ok(resumed) => resumed,
                Err(report) => {
                    info!("download resume request failed: {report:?}");
                    continue;
                }
            };
            if resumed.first_byte > self.offset {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "server did not return expected range (expected {}, got {})",
                        self.offset, resumed.first_byte
                    ),
                ));
            }
            if resumed.total_size != self.content_length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "server returned inconsistent range header (expected {}, received {})",
                        self.content_length, resumed.total_size
                    ),
                ));
            }
            let mut body = resumed.body;
            let surplus = self.offset - resumed.first_byte;
            if surplus > 0 {
                // The server ignored the lower range bound; realign by
                // discarding the surplus prefix.
                let discarded = io::copy(&mut (&mut body).take(surplus), &mut io::sink())?;
                if discarded != surplus {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "could not resume download, unable to catch up to offset {} \
                             from offset {}",
                            self.offset, resumed.first_byte
                        ),
                    ));
                }
            }
            self.stream = body;
            return Ok(());
        }
    }
}

impl Read for UpdateResumer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.stream.read(buf) {
                Ok(0) if self.offset < self.content_length => {
                    // Premature end of stream.
                    self.recover(&io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of stream",
                    ))?;
                }
                Ok(read) => {
                    self.offset += read as u64;
                    return Ok(read);
                }
                Err(error) => self.recover(&error)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    const UNIT: Duration = Duration::from_millis(1);

    #[test]
    fn test_backoff_schedule() {
        let max = Duration::from_secs(5 * 60);
        let unit = Duration::from_secs(60);
        for tried in 0..3 {
            assert_eq!(exponential_backoff(tried, max, unit).unwrap(), unit);
        }
        for tried in 3..6 {
            assert_eq!(exponential_backoff(tried, max, unit).unwrap(), unit * 2);
        }
        for tried in 6..9 {
            assert_eq!(exponential_backoff(tried, max, unit).unwrap(), unit * 4);
        }
        // The next interval would exceed the maximum and is clamped; three
        // attempts at the cap exhaust the budget.
        for tried in 9..12 {
            assert_eq!(exponential_backoff(tried, max, unit).unwrap(), max);
        }
        assert!(exponential_backoff(12, max, unit).is_err());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let max = Duration::from_secs(16 * 60);
        let unit = Duration::from_secs(60);
        let mut last = Duration::ZERO;
        let mut tried = 0;
        while let Ok(wait) = exponential_backoff(tried, max, unit) {
            assert!(wait >= last);
            assert!(wait <= max);
            last = wait;
            tried += 1;
        }
        assert!(tried > 0);
    }

    #[test]
    fn test_backoff_small_max_interval() {
        let unit = Duration::from_secs(60);
        assert_eq!(
            exponential_backoff(0, Duration::from_secs(1), unit).unwrap(),
            unit
        );
    }

    /// Reader failing with a transient error after a fixed number of bytes.
    struct FlakyReader {
        data: Vec<u8>,
        position: usize,
        fail_at: usize,
        failed: bool,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.failed && self.position >= self.fail_at {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            let end = (self.position + buf.len().min(64)).min(if self.failed {
                self.data.len()
            } else {
                self.fail_at
            });
            let count = end - self.position;
            buf[..count].copy_from_slice(&self.data[self.position..end]);
            self.position = end;
            Ok(count)
        }
    }

    #[test]
    fn test_resume_with_realignment() {
        let data: Vec<u8> = (0..1000u32).map(|value| value as u8).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let resume_calls = calls.clone();
        let resume_data = data.clone();
        let resumer = UpdateResumer::new(
            Box::new(FlakyReader {
                data: data.clone(),
                position: 0,
                fail_at: 600,
                failed: false,
            }),
            1000,
            Duration::from_millis(4),
            Box::new(move |offset| {
                resume_calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(offset, 600);
                // The server ignores the lower bound and restarts at 500.
                Ok(ResumedStream {
                    body: Box::new(Cursor::new(resume_data[500..].to_vec())),
                    first_byte: 500,
                    total_size: 1000,
                })
            }),
        )
        .with_backoff_unit(UNIT);

        let mut resumer = resumer;
        let mut output = Vec::new();
        resumer.read_to_end(&mut output).unwrap();
        assert_eq!(output, data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_ahead_of_offset_is_terminal() {
        let mut resumer = UpdateResumer::new(
            Box::new(FlakyReader {
                data: vec![0; 100],
                position: 0,
                fail_at: 10,
                failed: false,
            }),
            100,
            Duration::from_millis(4),
            Box::new(|_| {
                Ok(ResumedStream {
                    body: Box::new(Cursor::new(Vec::new())),
                    first_byte: 50,
                    total_size: 100,
                })
            }),
        )
        .with_backoff_unit(UNIT);
        let mut output = Vec::new();
        let error = resumer.read_to_end(&mut output).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert_eq!(output.len(), 10);
    }

    #[test]
    fn test_discard_shortfall_is_terminal() {
        // The server restarts at offset 0 but the new body ends before
        // the surplus prefix has been discarded.
        let mut resumer = UpdateResumer::new(
            Box::new(FlakyReader {
                data: vec![0; 100],
                position: 0,
                fail_at: 10,
                failed: false,
            }),
            100,
            Duration::from_millis(4),
            Box::new(|_| {
                Ok(ResumedStream {
                    body: Box::new(Cursor::new(vec![0; 5])),
                    first_byte: 0,
                    total_size: 100,
                })
            }),
        )
        .with_backoff_unit(UNIT);
        let error = resumer.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_inconsistent_total_size_is_terminal() {
        let mut resumer = UpdateResumer::new(
            Box::new(FlakyReader {
                data: vec![0; 100],
                position: 0,
                fail_at: 10,
                failed: false,
            }),
            100,
            Duration::from_millis(4),
            Box::new(|offset| {
                Ok(ResumedStream {
                    body: Box::new(Cursor::new(Vec::new())),
                    first_byte: offset,
                    total_size: 99,
                })
            }),
        )
        .with_backoff_unit(UNIT);
        let error = resumer.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_budget_exhaustion_is_terminal() {
        let mut resumer = UpdateResumer::new(
            Box::new(Cursor::new(vec![0; 10])),
            100,
            Duration::from_millis(2),
            Box::new(|_| Err(reportify::whatever("connection refused"))),
        )
        .with_backoff_unit(UNIT);
        let error = resumer.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_short_stream_triggers_resume() {
        // The upstream ends cleanly but early; the resumer treats this as
        // an outage and continues from the offset.
        let mut resumer = UpdateResumer::new(
            Box::new(Cursor::new(vec![1; 40])),
            100,
            Duration::from_millis(4),
            Box::new(|offset| {
                assert_eq!(offset, 40);
                Ok(ResumedStream {
                    body: Box::new(Cursor::new(vec![2; 60])),
                    first_byte: 40,
                    total_size: 100,
                })
            }),
        )
        .with_backoff_unit(UNIT);
        let mut output = Vec::new();
        resumer.read_to_end(&mut output).unwrap();
        assert_eq!(output.len(), 100);
        assert_eq!(&output[..40], &[1; 40][..]);
        assert_eq!(&output[40..], &[2; 60][..]);
    }
}
