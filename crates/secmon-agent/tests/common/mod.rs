// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use secmon_agent::identity::IdentityDirectory;
use secmon_agent::record::{LogRecord, GID_FIELD, ORIGIN_FIELD, UID_FIELD};
use secmon_agent::source::{Interrupter, LogSource, SourceError, Wakeup};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub const COLLECTOR_PATH: &str = "/api/logs/storage";

pub fn record(origin: &str, uid: &str, gid: &str, message: &str) -> LogRecord {
    LogRecord::new()
        .with_field(ORIGIN_FIELD, origin)
        .with_field(UID_FIELD, uid)
        .with_field(GID_FIELD, gid)
        .with_field("MESSAGE", message)
}

/// Hands out pre-arranged batches, one per wait.
///
/// Once the batches run out the source reports itself idle and then either blocks
/// until interrupted or, with [`ScriptedSource::closing`], fails with
/// [`SourceError::Closed`] as a journal whose reader went away would.
pub struct ScriptedSource {
    boundary: Option<LogRecord>,
    batches: VecDeque<Vec<LogRecord>>,
    pending: VecDeque<LogRecord>,
    positioned: bool,
    close_when_exhausted: bool,
    interrupt_tx: mpsc::Sender<()>,
    interrupt_rx: mpsc::Receiver<()>,
    idle: UnboundedSender<()>,
    closes: Arc<AtomicUsize>,
}

/// The test's view of a [`ScriptedSource`] after it has been handed to the agent.
pub struct ScriptHandle {
    pub idle: UnboundedReceiver<()>,
    closes: Arc<AtomicUsize>,
}

impl ScriptHandle {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Resolves once every batch has been drained and dispatched.
    pub async fn until_idle(&mut self) {
        tokio::time::timeout(Duration::from_secs(10), self.idle.recv())
            .await
            .expect("source never went idle")
            .expect("source dropped");
    }
}

impl ScriptedSource {
    pub fn new(batches: Vec<Vec<LogRecord>>) -> (Self, ScriptHandle) {
        let (interrupt_tx, interrupt_rx) = mpsc::channel();
        let (idle_tx, idle_rx) = unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let source = Self {
            boundary: None,
            batches: batches.into(),
            pending: VecDeque::new(),
            positioned: false,
            close_when_exhausted: false,
            interrupt_tx,
            interrupt_rx,
            idle: idle_tx,
            closes: Arc::clone(&closes),
        };
        let script = ScriptHandle {
            idle: idle_rx,
            closes,
        };
        (source, script)
    }

    /// A record sitting at the tail position when the agent starts.
    pub fn with_boundary(mut self, record: LogRecord) -> Self {
        self.boundary = Some(record);
        self
    }

    pub fn closing(mut self) -> Self {
        self.close_when_exhausted = true;
        self
    }
}

impl LogSource for ScriptedSource {
    fn seek_tail(&mut self) -> Result<(), SourceError> {
        self.positioned = true;
        Ok(())
    }

    fn previous(&mut self) -> Result<Option<LogRecord>, SourceError> {
        if !self.positioned {
            return Err(SourceError::NotPositioned);
        }
        Ok(self.boundary.take())
    }

    fn wait(&mut self) -> Result<Wakeup, SourceError> {
        if !self.positioned {
            return Err(SourceError::NotPositioned);
        }
        // the boundary record is still pending if nobody stepped over it
        if let Some(boundary) = self.boundary.take() {
            self.pending.push_back(boundary);
            return Ok(Wakeup::NewData);
        }
        if let Some(batch) = self.batches.pop_front() {
            self.pending.extend(batch);
            return Ok(Wakeup::NewData);
        }
        let _ = self.idle.send(());
        if self.close_when_exhausted {
            return Err(SourceError::Closed);
        }
        match self.interrupt_rx.recv() {
            Ok(()) => Ok(Wakeup::Interrupted),
            Err(_) => Err(SourceError::Closed),
        }
    }

    fn next_record(&mut self) -> Result<Option<LogRecord>, SourceError> {
        Ok(self.pending.pop_front())
    }

    fn interrupter(&self) -> Interrupter {
        let tx = self.interrupt_tx.clone();
        Interrupter::new(move || {
            let _ = tx.send(());
        })
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed uid/gid tables. 0 is `root` in both.
pub struct StaticDirectory {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self {
            users: HashMap::from([(0, "root".to_string()), (1000, "alice".to_string())]),
            groups: HashMap::from([(0, "root".to_string()), (1000, "staff".to_string())]),
        }
    }
}

impl IdentityDirectory for StaticDirectory {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.get(&uid).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups.get(&gid).cloned()
    }
}

/// Announces every user lookup and then takes `delay` to answer it.
pub struct SlowDirectory {
    pub delay: Duration,
    pub started: UnboundedSender<u32>,
}

impl IdentityDirectory for SlowDirectory {
    fn user_name(&self, uid: u32) -> Option<String> {
        let _ = self.started.send(uid);
        std::thread::sleep(self.delay);
        (uid == 0).then(|| "root".to_string())
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        (gid == 0).then(|| "root".to_string())
    }
}
