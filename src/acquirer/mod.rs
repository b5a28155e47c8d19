//! Segment acquisition: rendezvous with the producer, size, map.
//!
//! The backing object is created by an external producer (the XTSC
//! simulator), possibly after the emulator starts. [`SegmentAcquirer`]
//! therefore polls for it: a bounded number of non-blocking open attempts
//! with a pause between them. Once open, the object is resized to exactly
//! the region size and mapped read/write, shared.
//!
//! Both the open and the pause are injectable ([`SegmentOpener`],
//! [`Sleeper`]) so a rendezvous can be simulated without wall-clock delay.
//!
//! # Example
//!
//! ```rust,ignore
//! use xtsc_shm::acquirer::{RendezvousConfig, SegmentAcquirer};
//!
//! let mut acquirer = SegmentAcquirer::new(RendezvousConfig::default());
//! // Opens "/SharedRAM_L.<XTSC_PID>" (or "/SharedRAM_L"), waiting up to ~10s
//! let segment = acquirer.acquire("SharedRAM_L", 0x10_0000)?;
//! ```

mod opener;

pub use opener::{MemfdDirectory, PosixShmOpener, SegmentOpener};

use crate::defaults;
use crate::error::{Error, Result};
use crate::memory::SharedMemorySegment;
use crate::observability::{record_rendezvous_attempt, record_rendezvous_wait, span_rendezvous};
use rustix::fd::OwnedFd;
use std::time::{Duration, Instant};

/// Pause between two rendezvous attempts.
pub trait Sleeper: Send {
    /// Block for `duration`.
    fn sleep(&mut self, duration: Duration);
}

impl<F> Sleeper for F
where
    F: FnMut(Duration) + Send,
{
    fn sleep(&mut self, duration: Duration) {
        self(duration)
    }
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Where the producer's process token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Read this environment variable at acquire time; unset or empty means no token.
    Env(String),
    /// Always use this token.
    Fixed(String),
    /// Never suffix the base name.
    None,
}

impl TokenSource {
    /// Current token, if any.
    pub fn resolve(&self) -> Option<String> {
        match self {
            TokenSource::Env(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
            TokenSource::Fixed(token) => Some(token.clone()),
            TokenSource::None => None,
        }
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        TokenSource::Env(defaults::TOKEN_ENV_VAR.to_string())
    }
}

/// Effective object name: `base.token`, or `base` without a token.
pub fn effective_name(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("{base}.{token}"),
        None => base.to_string(),
    }
}

/// Rendezvous budget and naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Number of open attempts (at least one is always made).
    pub attempts: u32,
    /// Pause between two attempts.
    pub interval: Duration,
    /// Source of the producer token appended to object names.
    pub token: TokenSource,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            attempts: defaults::RENDEZVOUS_ATTEMPTS,
            interval: defaults::RENDEZVOUS_INTERVAL,
            token: TokenSource::default(),
        }
    }
}

impl RendezvousConfig {
    /// Set the number of open attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the pause between attempts.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the token source.
    pub fn with_token(mut self, token: TokenSource) -> Self {
        self.token = token;
        self
    }

    /// Upper bound on the time spent sleeping during one rendezvous.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts.max(1).saturating_sub(1)
    }
}

/// Opens, sizes and maps producer-created shared memory objects.
pub struct SegmentAcquirer {
    config: RendezvousConfig,
    opener: Box<dyn SegmentOpener>,
    sleeper: Box<dyn Sleeper>,
}

impl SegmentAcquirer {
    /// Acquirer over POSIX shared memory, sleeping the calling thread.
    pub fn new(config: RendezvousConfig) -> Self {
        Self::with_opener(config, PosixShmOpener)
    }

    /// Acquirer with a custom opener.
    pub fn with_opener(config: RendezvousConfig, opener: impl SegmentOpener + 'static) -> Self {
        Self {
            config,
            opener: Box::new(opener),
            sleeper: Box::new(ThreadSleeper),
        }
    }

    /// Replace the sleeper.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// The rendezvous configuration.
    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    /// Effective object name for `base`, resolving the token now.
    pub fn object_name(&self, base: &str) -> String {
        effective_name(base, self.config.token.resolve().as_deref())
    }

    /// Wait for `base` to appear, resize it to `size` and map it.
    ///
    /// # Errors
    ///
    /// - [`Error::RendezvousTimeout`] if the object never appears
    /// - [`Error::Segment`] if opening fails for a reason other than
    ///   absence, or if `ftruncate` / `mmap` fail
    pub fn acquire(&mut self, base: &str, size: usize) -> Result<SharedMemorySegment> {
        let name = self.object_name(base);
        let _span = span_rendezvous(&name).entered();

        let fd = self.rendezvous(&name)?;
        SharedMemorySegment::map(fd, &name, size)
    }

    fn rendezvous(&mut self, name: &str) -> Result<OwnedFd> {
        let attempts = self.config.attempts.max(1);
        let started = Instant::now();

        for attempt in 1..=attempts {
            record_rendezvous_attempt(name);
            if let Some(fd) = self.opener.try_open(name)? {
                record_rendezvous_wait(name, started.elapsed());
                tracing::debug!(name = %name, attempt, "producer object opened");
                return Ok(fd);
            }

            if attempt < attempts {
                tracing::warn!(name = %name, attempt, attempts, "waiting for {name}...");
                self.sleeper.sleep(self.config.interval);
            }
        }

        Err(Error::RendezvousTimeout {
            name: name.to_string(),
            attempts,
        })
    }
}

impl std::fmt::Debug for SegmentAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentAcquirer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
