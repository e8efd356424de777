// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tail loop and per-cycle fan-out.
//!
//! # Architecture
//!
//! ```text
//!   LogSource (blocking pool)
//!       │  wait + drain
//!       v
//!   ┌─────────────┐
//!   │  TailLoop   │  one drain cycle per wake-up
//!   └──────┬──────┘
//!          │ Vec<LogRecord>
//!          v
//!   ┌─────────────┐
//!   │ Dispatcher  │  filter, then one task per record (JoinSet)
//!   └──────┬──────┘
//!          │
//!          v
//!   Enricher ──> Forwarder      (per task, concurrently)
//! ```
//!
//! The dispatcher joins every task of a cycle before the tail loop waits again, so at
//! most one cycle's worth of records is in flight. Tasks are launched in source order
//! but may complete in any order.
//!
//! # Shutdown
//!
//! Cancelling the token wakes the blocked wait through the source's [`Interrupter`]
//! and stops the loop. Tasks already launched for the current cycle are joined
//! first; each is bounded by the delivery timeout.

use std::ops::AddAssign;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryError, DeliveryOutcome, Forwarder};
use crate::enricher::{EnrichError, Enricher};
use crate::filter::OriginFilter;
use crate::record::LogRecord;
use crate::source::{LogSource, SourceError, Wakeup};

/// Why a single record was dropped.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to enrich record {index}: {source}")]
    Enrichment {
        index: usize,
        #[source]
        source: EnrichError,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// What happened to the records of one drain cycle.
///
/// Every matched record lands in exactly one outcome counter, so once a cycle is
/// joined `finished() == matched`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records read from the source.
    pub seen: usize,
    /// Records that passed the filter and got a task.
    pub matched: usize,
    pub delivered: usize,
    /// Delivery was a no-op because the connection pool was closed.
    pub skipped: usize,
    pub rejected: usize,
    pub connection_failures: usize,
    pub enrichment_failures: usize,
    /// Tasks that panicked or were aborted.
    pub panicked: usize,
}

impl CycleReport {
    /// Number of launched tasks that have finished, one way or another.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.delivered
            + self.skipped
            + self.rejected
            + self.connection_failures
            + self.enrichment_failures
            + self.panicked
    }

    fn record(&mut self, result: &Result<DeliveryOutcome, ForwardError>) {
        match result {
            Ok(DeliveryOutcome::Delivered) => self.delivered += 1,
            Ok(DeliveryOutcome::Skipped) => self.skipped += 1,
            Err(ForwardError::Delivery(DeliveryError::Rejected { .. })) => self.rejected += 1,
            Err(ForwardError::Delivery(DeliveryError::Connection(_))) => {
                self.connection_failures += 1;
            }
            Err(e @ ForwardError::Enrichment { .. }) => {
                warn!("DISPATCHER | Dropping record: {e}");
                self.enrichment_failures += 1;
            }
        }
    }
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.seen += other.seen;
        self.matched += other.matched;
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.rejected += other.rejected;
        self.connection_failures += other.connection_failures;
        self.enrichment_failures += other.enrichment_failures;
        self.panicked += other.panicked;
    }
}

/// Filters a drained batch and runs enrichment + delivery for each match.
#[derive(Clone)]
pub struct Dispatcher {
    filter: Arc<OriginFilter>,
    enricher: Enricher,
    forwarder: Arc<dyn Forwarder>,
    limiter: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(filter: OriginFilter, enricher: Enricher, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            filter: Arc::new(filter),
            enricher,
            forwarder,
            limiter: None,
        }
    }

    /// Caps the number of record tasks running at once. `None` is unbounded.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: Option<usize>) -> Self {
        self.limiter = max_in_flight.map(|max| Arc::new(Semaphore::new(max)));
        self
    }

    /// Runs one drain cycle and returns once every launched task has finished.
    ///
    /// Records that fail the origin filter are dropped without a task. Every other
    /// record gets its own task on a [`JoinSet`]; tasks start in source order and may
    /// finish in any order.
    ///
    /// # Arguments
    ///
    /// * `records` - The batch drained after one wake-up, in source order
    ///
    /// # Returns
    ///
    /// A [`CycleReport`] with one outcome counted per matched record. A failing or
    /// panicking task is counted and never aborts its siblings.
    pub async fn dispatch(&self, records: Vec<LogRecord>) -> CycleReport {
        let mut report = CycleReport {
            seen: records.len(),
            ..CycleReport::default()
        };
        let mut set = JoinSet::new();

        for (index, record) in records.into_iter().enumerate() {
            if !self.filter.matches(&record) {
                continue;
            }
            report.matched += 1;

            // Decision: acquire before spawning so launch order stays source order
            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        error!("DISPATCHER | In-flight limiter closed: {e}");
                        None
                    }
                },
                None => None,
            };

            let enricher = self.enricher.clone();
            let forwarder = Arc::clone(&self.forwarder);
            set.spawn(async move {
                let result = forward(&enricher, forwarder.as_ref(), index, record).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => report.record(&result),
                Err(e) => {
                    error!("DISPATCHER | Record task failed: {e}");
                    report.panicked += 1;
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("filter", &self.filter)
            .field("limited", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

async fn forward(
    enricher: &Enricher,
    forwarder: &dyn Forwarder,
    index: usize,
    record: LogRecord,
) -> Result<DeliveryOutcome, ForwardError> {
    let payload = enricher
        .enrich(index, record)
        .await
        .map_err(|source| ForwardError::Enrichment { index, source })?;
    Ok(forwarder.deliver(payload).await?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Starting,
    WaitForActivity,
    DrainAndDispatch,
    Stopping,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailSummary {
    /// Drain cycles that dispatched at least one record batch.
    pub cycles: u64,
    pub totals: CycleReport,
}

/// The source handed back by [`TailLoop::run`] together with how the run ended.
///
/// `source` is `None` only when the blocking worker holding it panicked; the source
/// was dropped (and therefore released) on that worker.
pub struct TailOutcome<S> {
    pub source: Option<S>,
    pub result: Result<TailSummary, SourceError>,
}

enum Drained {
    Records(Vec<LogRecord>),
    Interrupted,
}

pub struct TailLoop {
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: TailState,
    summary: TailSummary,
}

impl TailLoop {
    pub fn new(dispatcher: Dispatcher, cancel: CancellationToken) -> Self {
        Self {
            dispatcher,
            cancel,
            state: TailState::Starting,
            summary: TailSummary::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> TailState {
        self.state
    }

    /// Tails `source` until cancelled or until the source fails.
    ///
    /// The source is moved onto the blocking pool for every call into it and handed
    /// back at the end so the caller can release it.
    ///
    /// # Arguments
    ///
    /// * `source` - An unpositioned source; `run` seeks it to the tail first
    ///
    /// # Returns
    ///
    /// A [`TailOutcome`] carrying the source back along with either the run's
    /// [`TailSummary`] (cancelled) or the [`SourceError`] that ended it.
    pub async fn run<S: LogSource>(&mut self, source: S) -> TailOutcome<S> {
        self.state = TailState::Starting;
        let interrupter = source.interrupter();

        let start = on_worker(source, |source: &mut S| {
            source.seek_tail()?;
            source.previous()
        })
        .await;
        let mut source = match start {
            Ok((source, Ok(boundary))) => {
                if boundary.is_some() {
                    debug!("DISPATCHER | Discarded record at the journal tail boundary");
                }
                info!("DISPATCHER | Tailing journal");
                source
            }
            Ok((source, Err(e))) => return self.stop(Some(source), Err(e)),
            Err(e) => return self.stop(None, Err(e)),
        };

        loop {
            if self.cancel.is_cancelled() {
                return self.stop(Some(source), Ok(()));
            }

            self.state = TailState::WaitForActivity;
            let mut worker = tokio::task::spawn_blocking(move || {
                let drained = wait_and_drain(&mut source);
                (source, drained)
            });
            let joined = tokio::select! {
                joined = &mut worker => joined,
                () = self.cancel.cancelled() => {
                    debug!("DISPATCHER | Shutdown requested, waking journal wait");
                    interrupter.interrupt();
                    worker.await
                }
            };

            let (returned, drained) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    return self.stop(None, Err(SourceError::Worker(e.to_string())));
                }
            };
            source = returned;

            let records = match drained {
                Ok(Drained::Records(records)) => records,
                Ok(Drained::Interrupted) => continue,
                Err(e) => return self.stop(Some(source), Err(e)),
            };
            if self.cancel.is_cancelled() {
                debug!(
                    "DISPATCHER | Shutdown requested, not dispatching {} drained records",
                    records.len()
                );
                return self.stop(Some(source), Ok(()));
            }

            self.state = TailState::DrainAndDispatch;
            let report = self.dispatcher.dispatch(records).await;
            self.summary.cycles += 1;
            self.summary.totals += report;
            debug!(
                "DISPATCHER | Cycle {}: {} new records, {} matched, {} delivered",
                self.summary.cycles, report.seen, report.matched, report.delivered
            );
        }
    }

    fn stop<S>(&mut self, source: Option<S>, result: Result<(), SourceError>) -> TailOutcome<S> {
        self.state = TailState::Stopping;
        let result = result.map(|()| self.summary);
        if let Err(e) = &result {
            error!("DISPATCHER | Journal tailing stopped: {e}");
        }
        TailOutcome { source, result }
    }
}

fn wait_and_drain<S: LogSource>(source: &mut S) -> Result<Drained, SourceError> {
    if source.wait()? == Wakeup::Interrupted {
        return Ok(Drained::Interrupted);
    }
    let mut records = Vec::new();
    while let Some(record) = source.next_record()? {
        records.push(record);
    }
    Ok(Drained::Records(records))
}

/// Runs `f` against the source on the blocking pool and hands the source back.
pub(crate) async fn on_worker<S, T, F>(source: S, f: F) -> Result<(S, T), SourceError>
where
    S: LogSource,
    T: Send + 'static,
    F: FnOnce(&mut S) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut source = source;
        let out = f(&mut source);
        (source, out)
    })
    .await
    .map_err(|e| SourceError::Worker(e.to_string()))
}
