// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use secmon_agent::config::Config;
use secmon_agent::identity::SystemDirectory;
use secmon_agent::logger::Formatter;
use secmon_agent::source::JournalctlSource;
use secmon_agent::{Agent, AgentError};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("SECMON_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = match EnvFilter::try_new(&env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid SECMON_LOG_LEVEL {log_level:?}: {e}, falling back to info");
            EnvFilter::new("h2=off,hyper=off,rustls=off,info")
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", AgentError::from(e));
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    let source = JournalctlSource::new(&config);
    let mut agent = Agent::new(config, source, Arc::new(SystemDirectory), cancel);
    match agent.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Agent stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn wait_for_shutdown(cancel: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            error!("Failed to listen for SIGTERM: {e}");
            None
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
        },
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}
