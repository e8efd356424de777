// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use crate::record::LogRecord;

/// Origin tags of the subsystems the agent forwards by default: session management,
/// privilege elevation and account lifecycle tools.
pub const DEFAULT_SYSLOG_IDENTIFIERS: &[&str] = &[
    "su",
    "sudo",
    "login",
    "systemd-logind",
    "lightdm",
    "sshd",
    "useradd",
    "usermod",
    "userdel",
    "adduser",
    "deluser",
    "groupadd",
    "groupmod",
    "groupdel",
    "addgroup",
    "delgroup",
];

/// Allow-list predicate over a record's origin tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginFilter {
    allowed: HashSet<String>,
}

impl OriginFilter {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: identifiers.into_iter().map(Into::into).collect(),
        }
    }

    /// Records without an origin tag never match.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        record
            .origin()
            .is_some_and(|origin| self.allowed.contains(origin))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl Default for OriginFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SYSLOG_IDENTIFIERS.iter().copied())
    }
}
