// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Position-tracked feeds of journal records.
//!
//! The tail loop only needs a handful of operations from a source: jump to the tail,
//! step back over the boundary record, block until something new shows up, and walk
//! forward over what arrived. All of them may block, so the tail loop always calls
//! them from tokio's blocking pool. The one thing that must work from another thread
//! is waking a pending [`LogSource::wait`], which is what [`Interrupter`] is for.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::record::LogRecord;

pub mod journalctl;

pub use journalctl::JournalctlSource;

/// Why [`LogSource::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// At least one record is ready for [`LogSource::next_record`].
    NewData,
    /// [`Interrupter::interrupt`] was called.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open log source: {0}")]
    Open(#[source] std::io::Error),

    #[error("log source is not positioned; call seek_tail first")]
    NotPositioned,

    #[error("log source closed")]
    Closed,

    #[error("log source worker failed: {0}")]
    Worker(String),
}

/// Wakes a blocked [`LogSource::wait`] from any thread.
#[derive(Clone)]
pub struct Interrupter(Arc<dyn Fn() + Send + Sync>);

impl Interrupter {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn interrupt(&self) {
        (self.0)();
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupter")
    }
}

pub trait LogSource: Send + 'static {
    /// Positions the cursor after the newest record. Nothing older is ever returned.
    fn seek_tail(&mut self) -> Result<(), SourceError>;

    /// Steps back onto the record at the tail boundary and consumes it, if one is
    /// pending. Called once after [`LogSource::seek_tail`] so that record is not
    /// reported as new by the first wait.
    fn previous(&mut self) -> Result<Option<LogRecord>, SourceError>;

    /// Blocks, with no timeout, until new records are available or the source is
    /// interrupted.
    fn wait(&mut self) -> Result<Wakeup, SourceError>;

    /// Next record after the cursor, or `None` once everything available has been
    /// consumed. Never blocks waiting for new data.
    fn next_record(&mut self) -> Result<Option<LogRecord>, SourceError>;

    fn interrupter(&self) -> Interrupter;

    /// Releases the underlying handle. Must be safe to call more than once.
    fn close(&mut self);
}
