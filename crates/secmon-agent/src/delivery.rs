// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-shot delivery of enriched payloads to the collector.
//!
//! Delivery is best effort: one POST per payload, no buffering and no retry. The
//! outcome is logged here and returned to the dispatcher for accounting only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::http::ConnectionPool;
use crate::record::EnrichedPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The collector answered 200.
    Delivered,
    /// No live connection pool; nothing was sent.
    Skipped,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection refused, DNS failure, timeout and friends.
    #[error("connection error: {0}")]
    Connection(#[source] reqwest::Error),

    /// The collector answered with something other than 200.
    #[error("collector rejected payload with status {status}")]
    Rejected { status: StatusCode, body: String },
}

/// Sends one payload somewhere.
///
/// The dispatcher holds a `dyn Forwarder` so tests can swap the HTTP client for a
/// recording stub.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Delivers `payload` once.
    ///
    /// # Arguments
    ///
    /// * `payload` - The enriched record, consumed by the call
    ///
    /// # Returns
    ///
    /// * `Ok(DeliveryOutcome::Delivered)` - The collector accepted the payload
    /// * `Ok(DeliveryOutcome::Skipped)` - Nothing could be sent because the session is gone
    /// * `Err(DeliveryError)` - The payload was sent and lost; it is not retried
    async fn deliver(&self, payload: EnrichedPayload) -> Result<DeliveryOutcome, DeliveryError>;
}

/// [`Forwarder`] that POSTs JSON to the collector through a shared [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    pool: Arc<ConnectionPool>,
    endpoint: String,
    timeout: Duration,
}

impl DeliveryClient {
    /// # Arguments
    ///
    /// * `pool` - Session shared with the lifecycle controller, which closes it
    /// * `endpoint` - Full collector URL, path included
    /// * `timeout` - Per-request limit covering connect, send and response
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, endpoint: String, timeout: Duration) -> Self {
        Self {
            pool,
            endpoint,
            timeout,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        client: reqwest::Client,
        payload: &EnrichedPayload,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let response = client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(payload)
            .send()
            .await
            .map_err(DeliveryError::Connection)?;

        let status = response.status();
        // Decision: only an exact 200 counts; any other 2xx is a rejection
        if status == StatusCode::OK {
            return Ok(DeliveryOutcome::Delivered);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected { status, body })
    }
}

#[async_trait]
impl Forwarder for DeliveryClient {
    async fn deliver(&self, payload: EnrichedPayload) -> Result<DeliveryOutcome, DeliveryError> {
        let Some(client) = self.pool.client() else {
            debug!("DELIVERY | Connection pool is closed, skipping payload");
            return Ok(DeliveryOutcome::Skipped);
        };

        let origin = payload.origin().unwrap_or_default().to_string();
        let time = Instant::now();
        let result = self.send(client, &payload).await;
        let elapsed = time.elapsed().as_millis();

        match &result {
            Ok(_) => info!("DELIVERY | Sent {origin} record in {elapsed} ms"),
            Err(DeliveryError::Rejected { status, body }) => {
                error!("DELIVERY | Collector rejected {origin} record: {status} {body:?}");
            }
            Err(DeliveryError::Connection(e)) => {
                error!("DELIVERY | Failed to reach collector after {elapsed} ms: {e}");
            }
        }
        result
    }
}
