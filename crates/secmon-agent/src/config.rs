// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup configuration read from `SECMON_*` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::filter::DEFAULT_SYSLOG_IDENTIFIERS;

pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost:3001/api/logs/storage";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_JOURNALCTL_PATH: &str = "journalctl";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid URL: {value}")]
    InvalidUrl { name: &'static str, value: String },

    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("SECMON_SYSLOG_IDENTIFIERS is set but contains no identifiers")]
    EmptyAllowList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub collector_url: String,
    /// Origin tags that are forwarded; everything else is dropped.
    pub syslog_identifiers: Vec<String>,
    /// Total timeout of one delivery attempt.
    pub request_timeout: Duration,
    /// Cap on concurrently running record tasks within one drain cycle.
    /// `None` fans out one task per record with no limit.
    pub max_in_flight: Option<usize>,
    pub proxy_https: Option<String>,
    pub journalctl_path: String,
    /// Read journal files from this directory instead of the system journal.
    pub journal_directory: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            syslog_identifiers: DEFAULT_SYSLOG_IDENTIFIERS
                .iter()
                .map(ToString::to_string)
                .collect(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_in_flight: None,
            proxy_https: None,
            journalctl_path: DEFAULT_JOURNALCTL_PATH.to_string(),
            journal_directory: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Ok(url) = env::var("SECMON_COLLECTOR_URL") {
            if reqwest::Url::parse(&url).is_err() {
                return Err(ConfigError::InvalidUrl {
                    name: "SECMON_COLLECTOR_URL",
                    value: url,
                });
            }
            config.collector_url = url;
        }

        if let Ok(identifiers) = env::var("SECMON_SYSLOG_IDENTIFIERS") {
            config.syslog_identifiers = parse_identifiers(&identifiers);
            if config.syslog_identifiers.is_empty() {
                return Err(ConfigError::EmptyAllowList);
            }
        }

        if let Some(secs) = positive_number::<u64>("SECMON_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        config.max_in_flight = positive_number("SECMON_MAX_IN_FLIGHT")?;

        config.proxy_https = env::var("SECMON_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        if let Ok(path) = env::var("SECMON_JOURNALCTL_PATH") {
            config.journalctl_path = path;
        }
        config.journal_directory = env::var("SECMON_JOURNAL_DIRECTORY")
            .ok()
            .filter(|dir| !dir.trim().is_empty());

        Ok(config)
    }
}

/// Comma and whitespace separated, like `DD_TAGS`.
fn parse_identifiers(raw: &str) -> Vec<String> {
    raw.replace(',', " ")
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

fn positive_number<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Ok(value) = env::var(name) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(n) if n != T::default() => Ok(Some(n)),
        _ => Err(ConfigError::InvalidNumber { name, value }),
    }
}
