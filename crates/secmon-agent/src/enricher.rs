// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a [`LogRecord`] into an [`EnrichedPayload`].
//!
//! Every field is rendered as a string (the collector only stores text) and the
//! resolved owner names are appended under [`USER_NAME_FIELD`] and
//! [`GROUP_NAME_FIELD`]. Id parsing or lookup problems never fail enrichment; they
//! surface as [`crate::identity::UNKNOWN`] in the payload.
//!
//! A record that already carries `UserName` or `GroupName` is dropped with
//! [`EnrichError::ReservedField`] instead of having the field overwritten. journald
//! field names are upper case, so this never triggers for journalctl output; it keeps a
//! source from shipping identity fields the agent did not resolve itself.

use thiserror::Error;
use tracing::debug;

use crate::identity::IdentityResolver;
use crate::record::{stringify, EnrichedPayload, LogRecord, GROUP_NAME_FIELD, USER_NAME_FIELD};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnrichError {
    /// The record already carries a field the enricher would synthesize.
    #[error("record already contains reserved field {0}")]
    ReservedField(&'static str),
}

#[derive(Debug, Clone)]
pub struct Enricher {
    resolver: IdentityResolver,
}

impl Enricher {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self { resolver }
    }

    /// `index` is the record's position in its drain cycle and is only used for
    /// diagnostics.
    pub async fn enrich(
        &self,
        index: usize,
        record: LogRecord,
    ) -> Result<EnrichedPayload, EnrichError> {
        for reserved in [USER_NAME_FIELD, GROUP_NAME_FIELD] {
            if record.contains(reserved) {
                return Err(EnrichError::ReservedField(reserved));
            }
        }

        let identity = self.resolver.resolve(record.uid(), record.gid()).await;

        let mut payload = EnrichedPayload::with_capacity(record.len() + 2);
        for (name, value) in record {
            let text = stringify(&value);
            payload.insert(name, text);
        }

        debug!(
            index,
            user = %identity.user,
            group = %identity.group,
            "ENRICHER | Processed record"
        );

        payload.insert(USER_NAME_FIELD.to_string(), identity.user);
        payload.insert(GROUP_NAME_FIELD.to_string(), identity.group);
        Ok(payload)
    }
}
