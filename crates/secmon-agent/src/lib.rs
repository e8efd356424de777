// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # secmon-agent
//!
//! Tails the systemd journal for security-relevant entries and forwards each one to
//! a collector over HTTP.
//!
//! ## Pipeline
//!
//! - [`source`]: the journal feed, positioned at its tail on startup
//! - [`filter`]: allow-list on `SYSLOG_IDENTIFIER`
//! - [`enricher`] and [`identity`]: stringify fields, add `UserName` / `GroupName`
//! - [`delivery`] and [`http`]: one JSON POST per record, no retry
//! - [`dispatcher`]: one task per record, joined per drain cycle
//! - [`lifecycle`]: startup and ordered teardown

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod enricher;
pub mod error;
pub mod filter;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod logger;
pub mod record;
pub mod source;

pub use error::AgentError;
pub use lifecycle::Agent;
