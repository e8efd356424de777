// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

use thiserror::Error;

use crate::config::ConfigError;
use crate::source::SourceError;

/// Errors that stop the agent. Per-record failures never surface here.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open HTTP session: {0}")]
    Session(#[source] Box<dyn Error + Send + Sync>),

    #[error(transparent)]
    Source(#[from] SourceError),
}
