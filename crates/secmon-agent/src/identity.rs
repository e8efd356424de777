// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Numeric user/group id to name resolution.
//!
//! Directory lookups go through libc's passwd/group functions, which may hit NSS
//! backends (LDAP, sssd) and block for a long time. [`IdentityResolver`] therefore
//! runs every lookup on tokio's blocking pool and never reports a failure: anything
//! that does not resolve becomes [`UNKNOWN`].

use std::sync::Arc;

use nix::unistd::{Gid, Group, Uid, User};
use tracing::debug;

/// Name used when an id is missing, malformed or has no directory entry.
pub const UNKNOWN: &str = "unknown";

/// Synchronous, possibly slow, id to name lookup.
pub trait IdentityDirectory: Send + Sync + 'static {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// The host's passwd and group databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDirectory;

impl IdentityDirectory for SystemDirectory {
    fn user_name(&self, uid: u32) -> Option<String> {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(user) => user.map(|u| u.name),
            Err(e) => {
                debug!("IDENTITY | passwd lookup for uid {uid} failed: {e}");
                None
            }
        }
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        match Group::from_gid(Gid::from_raw(gid)) {
            Ok(group) => group.map(|g| g.name),
            Err(e) => {
                debug!("IDENTITY | group lookup for gid {gid} failed: {e}");
                None
            }
        }
    }
}

/// Resolved names for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub group: String,
}

#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<dyn IdentityDirectory>,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    pub async fn user_name(&self, uid: Option<u32>) -> String {
        let Some(uid) = uid else {
            return UNKNOWN.to_string();
        };
        let directory = Arc::clone(&self.directory);
        lookup(move || directory.user_name(uid)).await
    }

    pub async fn group_name(&self, gid: Option<u32>) -> String {
        let Some(gid) = gid else {
            return UNKNOWN.to_string();
        };
        let directory = Arc::clone(&self.directory);
        lookup(move || directory.group_name(gid)).await
    }

    /// Resolves both ids concurrently; returns once both lookups are done.
    pub async fn resolve(&self, uid: Option<u32>, gid: Option<u32>) -> Identity {
        let (user, group) = tokio::join!(self.user_name(uid), self.group_name(gid));
        Identity { user, group }
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

async fn lookup<F>(f: F) -> String
where
    F: FnOnce() -> Option<String> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Some(name)) => name,
        Ok(None) => UNKNOWN.to_string(),
        Err(e) => {
            debug!("IDENTITY | lookup task did not complete: {e}");
            UNKNOWN.to_string()
        }
    }
}
