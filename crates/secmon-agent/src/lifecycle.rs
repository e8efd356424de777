// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup and teardown of the agent.
//!
//! [`Agent::run`] opens the connection pool, hands the log source to the tail loop
//! and, however the loop ends, releases the source and then the pool. Each is
//! released exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::delivery::DeliveryClient;
use crate::dispatcher::{Dispatcher, TailLoop, TailSummary};
use crate::enricher::Enricher;
use crate::error::AgentError;
use crate::filter::OriginFilter;
use crate::http::ConnectionPool;
use crate::identity::{IdentityDirectory, IdentityResolver};
use crate::source::{LogSource, SourceError};

pub struct Agent<S> {
    config: Arc<Config>,
    source: Option<S>,
    directory: Arc<dyn IdentityDirectory>,
    cancel: CancellationToken,
    pool: Option<Arc<ConnectionPool>>,
}

impl<S: LogSource> Agent<S> {
    pub fn new(
        config: Arc<Config>,
        source: S,
        directory: Arc<dyn IdentityDirectory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            source: Some(source),
            directory,
            cancel,
            pool: None,
        }
    }

    /// The pool opened by [`Agent::run`], if it got that far.
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Runs until the cancellation token fires or the source fails.
    ///
    /// The source is consumed by the first call; calling again returns
    /// [`SourceError::Closed`].
    pub async fn run(&mut self) -> Result<TailSummary, AgentError> {
        let Some(mut source) = self.source.take() else {
            return Err(AgentError::Source(SourceError::Closed));
        };

        let pool = match ConnectionPool::open(&self.config) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                error!("LIFECYCLE | Failed to open HTTP session: {e}");
                source.close();
                return Err(AgentError::Session(e));
            }
        };
        self.pool = Some(Arc::clone(&pool));

        let forwarder = DeliveryClient::new(
            Arc::clone(&pool),
            self.config.collector_url.clone(),
            self.config.request_timeout,
        );
        let dispatcher = Dispatcher::new(
            OriginFilter::new(self.config.syslog_identifiers.iter().cloned()),
            Enricher::new(IdentityResolver::new(Arc::clone(&self.directory))),
            Arc::new(forwarder),
        )
        .with_max_in_flight(self.config.max_in_flight);

        info!(
            "LIFECYCLE | Forwarding {} syslog identifiers to {}",
            self.config.syslog_identifiers.len(),
            self.config.collector_url
        );
        let mut tail = TailLoop::new(dispatcher, self.cancel.clone());
        let outcome = tail.run(source).await;

        if let Some(mut source) = outcome.source {
            source.close();
            debug!("LIFECYCLE | Log source released");
        }
        if pool.close() {
            debug!("LIFECYCLE | Connection pool released");
        }

        let summary = outcome.result?;
        let totals = summary.totals;
        info!(
            "LIFECYCLE | Stopped after {} cycles: {} records seen, {} matched, {} delivered, {} rejected, {} connection failures",
            summary.cycles,
            totals.seen,
            totals.matched,
            totals.delivered,
            totals.rejected,
            totals.connection_failures
        );
        Ok(summary)
    }
}
