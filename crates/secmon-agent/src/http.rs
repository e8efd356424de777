// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP session shared by every delivery task.
//!
//! [`ConnectionPool`] wraps a single `reqwest::Client` (which is itself a pool of
//! keep-alive connections). Delivery tasks only ever borrow a clone of the client;
//! opening and closing are reserved to the lifecycle controller, and each happens at
//! most once per pool.

use core::time::Duration;
use std::error::Error;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, error};

use crate::config::Config;

#[derive(Debug, Default)]
pub struct ConnectionPool {
    client: RwLock<Option<reqwest::Client>>,
}

impl ConnectionPool {
    /// Builds the shared client from `config`.
    ///
    /// The client uses rustls, applies `config.request_timeout` to every request and
    /// keeps idle connections for 270 seconds.
    ///
    /// # Arguments
    ///
    /// * `config` - Agent configuration; only the timeout and HTTPS proxy are read
    ///
    /// # Returns
    ///
    /// * `Ok(ConnectionPool)` - An open pool
    /// * `Err` - If no client could be built, even without a proxy
    ///
    /// # Errors
    ///
    /// An unparsable proxy is not an error. It is logged and the client falls back to
    /// a direct connection.
    pub fn open(config: &Config) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = match build_client(config, true) {
            Ok(client) => client,
            Err(e) => {
                error!(
                    "HTTP | Unable to parse proxy configuration: {}, falling back to direct connection",
                    e
                );
                build_client(config, false)?
            }
        };
        debug!("HTTP | Connection pool opened");
        Ok(Self::from_client(client))
    }

    /// Wraps an already built client in an open pool.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    /// A pool that was never opened. Deliveries through it are skipped.
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    /// A handle on the live client.
    ///
    /// # Returns
    ///
    /// * `Some(client)` - A clone sharing the pool's connections
    /// * `None` - Once the pool has been closed or if it was never opened
    #[must_use]
    pub fn client(&self) -> Option<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drops the client.
    ///
    /// Requests already in flight hold their own clone and finish normally. New
    /// deliveries see a closed pool and are skipped.
    ///
    /// # Returns
    ///
    /// * `true` - For the one call that actually closed the pool
    /// * `false` - If it was already closed
    pub fn close(&self) -> bool {
        let closed = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            debug!("HTTP | Connection pool closed");
        }
        closed
    }
}

fn build_client(
    config: &Config,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error + Send + Sync>> {
    let mut client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        // detect collectors that went away without closing the socket
        .tcp_keepalive(Some(Duration::from_secs(120)));

    // Decision: the proxy only applies to https:// collectors, plain http goes direct
    if allow_proxy {
        if let Some(https_uri) = &config.proxy_https {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}
