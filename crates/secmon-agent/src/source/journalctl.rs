// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`LogSource`] backed by `journalctl --follow --output=json`.
//!
//! A reader thread parses journalctl's stdout (one JSON object per line) and pushes
//! records into a bounded channel. When the channel is full the reader blocks, which
//! in turn leaves journalctl blocked on its pipe, so a slow drain cycle holds back the
//! journal instead of buffering it in memory.
//!
//! [`JournalctlSource::wait`] blocks on that channel. The [`Interrupter`] raises a flag
//! that `wait` checks first and then tries to push a wake-up into the same channel. If
//! the channel is full the push is dropped: `wait` cannot block on a full channel.
//!
//! Every reader thread tags its messages with the generation of the journalctl process
//! it reads from, so output of a process replaced by [`LogSource::seek_tail`] is ignored.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::config::Config;
use crate::record::LogRecord;
use crate::source::{Interrupter, LogSource, SourceError, Wakeup};

/// Parsed entries buffered between the reader thread and the tail loop.
const ENTRY_CHANNEL_BUFFER_SIZE: usize = 1024;

enum Message {
    Record(u64, LogRecord),
    Eof(u64),
    Interrupt,
}

pub struct JournalctlSource {
    program: String,
    args: Vec<String>,
    tx: SyncSender<Message>,
    rx: Receiver<Message>,
    interrupted: Arc<AtomicBool>,
    generation: u64,
    child: Option<Child>,
    pending: VecDeque<LogRecord>,
    eof: bool,
}

impl JournalctlSource {
    /// Follows the system journal, or `config.journal_directory` when set.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut args = vec![
            "--follow".to_string(),
            "--output=json".to_string(),
            // start after the newest entry
            "--lines=0".to_string(),
            "--no-pager".to_string(),
        ];
        if let Some(directory) = &config.journal_directory {
            args.push(format!("--directory={directory}"));
        }
        Self::with_command(config.journalctl_path.clone(), args)
    }

    /// Runs `program` with exactly `args`. Its stdout must be journal JSON lines.
    pub fn with_command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::sync_channel(ENTRY_CHANNEL_BUFFER_SIZE);
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            tx,
            rx,
            interrupted: Arc::new(AtomicBool::new(false)),
            generation: 0,
            child: None,
            pending: VecDeque::new(),
            eof: false,
        }
    }

    fn spawn(&mut self) -> Result<(), SourceError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(SourceError::Open)?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Open(std::io::Error::other(
                "journalctl stdout was not captured",
            )));
        };

        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        if let Err(e) = thread::Builder::new()
            .name("journal-reader".to_string())
            .spawn(move || read_entries(stdout, &tx, generation))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Open(e));
        }

        debug!(
            "JOURNAL | Started {} (pid {}) {:?}",
            self.program,
            child.id(),
            self.args
        );
        self.child = Some(child);
        Ok(())
    }

    fn stop_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("JOURNAL | journalctl already exited: {e}");
            }
            let _ = child.wait();
        }
    }

    fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

impl LogSource for JournalctlSource {
    fn seek_tail(&mut self) -> Result<(), SourceError> {
        self.stop_child();
        // anything still queued belongs to the previous process
        while self.rx.try_recv().is_ok() {}
        self.pending.clear();
        self.eof = false;
        self.spawn()
    }

    /// `--lines=0` already starts journalctl after the newest entry, so there is no
    /// boundary record to step over.
    fn previous(&mut self) -> Result<Option<LogRecord>, SourceError> {
        if self.child.is_none() {
            return Err(SourceError::NotPositioned);
        }
        Ok(None)
    }

    fn wait(&mut self) -> Result<Wakeup, SourceError> {
        if self.child.is_none() && !self.eof {
            return Err(SourceError::NotPositioned);
        }
        if self.take_interrupt() {
            return Ok(Wakeup::Interrupted);
        }
        if !self.pending.is_empty() {
            return Ok(Wakeup::NewData);
        }
        if self.eof {
            return Err(SourceError::Closed);
        }
        loop {
            match self.rx.recv() {
                Ok(Message::Record(generation, record)) if generation == self.generation => {
                    self.pending.push_back(record);
                    return Ok(Wakeup::NewData);
                }
                Ok(Message::Eof(generation)) if generation == self.generation => {
                    self.eof = true;
                    return Err(SourceError::Closed);
                }
                Ok(Message::Interrupt) => {
                    // the flag may already have been consumed by an earlier wait
                    if self.take_interrupt() {
                        return Ok(Wakeup::Interrupted);
                    }
                }
                Ok(Message::Record(..) | Message::Eof(_)) => {}
                Err(_) => {
                    self.eof = true;
                    return Err(SourceError::Closed);
                }
            }
        }
    }

    /// Stops yielding records once an interrupt is pending; the next
    /// [`JournalctlSource::wait`] reports it.
    fn next_record(&mut self) -> Result<Option<LogRecord>, SourceError> {
        if let Some(record) = self.pending.pop_front() {
            return Ok(Some(record));
        }
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.rx.try_recv() {
                Ok(Message::Record(generation, record)) if generation == self.generation => {
                    return Ok(Some(record));
                }
                Ok(Message::Eof(generation)) if generation == self.generation => {
                    self.eof = true;
                    return Ok(None);
                }
                Ok(_) => {}
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }

    fn interrupter(&self) -> Interrupter {
        let tx = self.tx.clone();
        let interrupted = Arc::clone(&self.interrupted);
        Interrupter::new(move || {
            interrupted.store(true, Ordering::SeqCst);
            let _ = tx.try_send(Message::Interrupt);
        })
    }

    fn close(&mut self) {
        if self.child.is_some() {
            debug!("JOURNAL | Stopping {}", self.program);
        }
        self.stop_child();
        self.pending.clear();
    }
}

impl Drop for JournalctlSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_entries(stdout: ChildStdout, tx: &SyncSender<Message>, generation: u64) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("JOURNAL | Failed to read journalctl output: {e}");
                break;
            }
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LogRecord>(&line) {
            Ok(record) => {
                if tx.send(Message::Record(generation, record)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("JOURNAL | Skipping malformed journal entry: {e}"),
        }
    }
    debug!("JOURNAL | journalctl output ended");
    let _ = tx.send(Message::Eof(generation));
}
