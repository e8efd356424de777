// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

use common::{record, ScriptedSource, SlowDirectory, StaticDirectory, COLLECTOR_PATH};
use secmon_agent::config::Config;
use secmon_agent::delivery::{DeliveryClient, DeliveryError, DeliveryOutcome, Forwarder};
use secmon_agent::dispatcher::{Dispatcher, TailLoop, TailState, TailSummary};
use secmon_agent::enricher::Enricher;
use secmon_agent::filter::OriginFilter;
use secmon_agent::http::ConnectionPool;
use secmon_agent::identity::{IdentityDirectory, IdentityResolver};
use secmon_agent::record::EnrichedPayload;
use secmon_agent::source::SourceError;
use secmon_agent::{Agent, AgentError};

type Running = tokio::task::JoinHandle<(Agent<ScriptedSource>, Result<TailSummary, AgentError>)>;

fn config_for(server: &Server) -> Arc<Config> {
    Arc::new(Config {
        collector_url: format!("{}{COLLECTOR_PATH}", server.url()),
        ..Config::default()
    })
}

fn start(
    config: Arc<Config>,
    source: ScriptedSource,
    directory: Arc<dyn IdentityDirectory>,
    cancel: &CancellationToken,
) -> Running {
    let mut agent = Agent::new(config, source, directory, cancel.clone());
    tokio::spawn(async move {
        let result = agent.run().await;
        (agent, result)
    })
}

#[tokio::test]
async fn test_sshd_record_is_posted_with_identity_names() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({
            "SYSLOG_IDENTIFIER": "sshd",
            "_UID": "0",
            "_GID": "0",
            "MESSAGE": "Accepted",
            "UserName": "root",
            "GroupName": "root"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let boundary = server
        .mock("POST", COLLECTOR_PATH)
        .match_body(Matcher::PartialJson(json!({"MESSAGE": "already there"})))
        .expect(0)
        .create_async()
        .await;

    let (source, mut script) =
        ScriptedSource::new(vec![vec![record("sshd", "0", "0", "Accepted")]]);
    let source = source.with_boundary(record("sshd", "0", "0", "already there"));
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (_, result) = handle.await.unwrap();

    let summary = result.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.totals.delivered, 1);
    mock.assert_async().await;
    boundary.assert_async().await;
}

#[tokio::test]
async fn test_records_outside_allow_list_make_no_calls() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .expect(0)
        .create_async()
        .await;

    let (source, mut script) = ScriptedSource::new(vec![vec![
        record("cron", "0", "0", "(root) CMD (run-parts /etc/cron.hourly)"),
        record("kernel", "0", "0", "eth0: link up"),
    ]]);
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (_, result) = handle.await.unwrap();

    let totals = result.unwrap().totals;
    assert_eq!(totals.seen, 2);
    assert_eq!(totals.matched, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unresolvable_uid_is_delivered_as_unknown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .match_body(Matcher::PartialJson(json!({
            "SYSLOG_IDENTIFIER": "sudo",
            "_UID": "999999",
            "UserName": "unknown",
            "GroupName": "staff"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (source, mut script) =
        ScriptedSource::new(vec![vec![record("sudo", "999999", "1000", "auth failure")]]);
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (_, result) = handle.await.unwrap();

    assert_eq!(result.unwrap().totals.delivered, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_every_cycle_is_dispatched() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    let (source, mut script) = ScriptedSource::new(vec![
        vec![
            record("sshd", "1000", "1000", "Accepted publickey"),
            record("cron", "0", "0", "tick"),
        ],
        vec![
            record("sudo", "1000", "0", "COMMAND=/bin/ls"),
            record("su", "0", "0", "session opened"),
        ],
    ]);
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (_, result) = handle.await.unwrap();

    let summary = result.unwrap();
    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.totals.seen, 4);
    assert_eq!(summary.totals.matched, 3);
    assert_eq!(summary.totals.delivered, 3);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rejections_are_counted_and_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let (source, mut script) = ScriptedSource::new(vec![vec![
        record("sshd", "0", "0", "Failed password"),
        record("sshd", "0", "0", "Failed password"),
    ]]);
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (_, result) = handle.await.unwrap();

    let totals = result.unwrap().totals;
    assert_eq!(totals.rejected, 2);
    assert_eq!(totals.delivered, 0);
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_mid_cycle_releases_source_and_pool_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let (started_tx, mut started_rx) = unbounded_channel();
    let directory = SlowDirectory {
        delay: Duration::from_millis(300),
        started: started_tx,
    };
    let (source, script) = ScriptedSource::new(vec![vec![
        record("sshd", "0", "0", "Accepted"),
        record("sudo", "0", "0", "session opened"),
    ]]);
    let cancel = CancellationToken::new();
    let handle = start(config_for(&server), source, Arc::new(directory), &cancel);

    // a record task is running when shutdown is requested
    started_rx.recv().await.unwrap();
    cancel.cancel();
    let (agent, result) = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("agent did not stop")
        .unwrap();

    let summary = result.unwrap();
    // tasks already launched run to completion
    assert_eq!(summary.totals.delivered, 2);
    assert_eq!(script.closes(), 1);
    let pool = agent.pool().unwrap();
    assert!(!pool.is_open());
    assert!(!pool.close());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_cancel_while_idle_stops_promptly() {
    let server = Server::new_async().await;
    let (source, mut script) = ScriptedSource::new(Vec::new());
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source,
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    script.until_idle().await;
    cancel.cancel();
    let (agent, result) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("blocked wait was not interrupted")
        .unwrap();

    assert_eq!(result.unwrap().cycles, 0);
    assert_eq!(script.closes(), 1);
    assert!(!agent.pool().unwrap().is_open());
}

#[tokio::test]
async fn test_source_closing_stops_agent_after_teardown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (source, script) =
        ScriptedSource::new(vec![vec![record("login", "0", "0", "ROOT LOGIN")]]);
    let cancel = CancellationToken::new();
    let handle = start(
        config_for(&server),
        source.closing(),
        Arc::new(StaticDirectory::default()),
        &cancel,
    );

    let (agent, result) = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("agent did not stop")
        .unwrap();

    assert!(matches!(result, Err(AgentError::Source(SourceError::Closed))));
    assert_eq!(script.closes(), 1);
    assert!(!agent.pool().unwrap().is_open());
    mock.assert_async().await;
}

/// Sends `su` records to a dead endpoint and everything else to the collector.
struct ByOrigin {
    dead: DeliveryClient,
    collector: DeliveryClient,
}

#[async_trait]
impl Forwarder for ByOrigin {
    async fn deliver(&self, payload: EnrichedPayload) -> Result<DeliveryOutcome, DeliveryError> {
        if payload.origin() == Some("su") {
            self.dead.deliver(payload).await
        } else {
            self.collector.deliver(payload).await
        }
    }
}

#[tokio::test]
async fn test_failed_delivery_does_not_affect_sibling() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", COLLECTOR_PATH)
        .match_body(Matcher::PartialJson(json!({"SYSLOG_IDENTIFIER": "sshd"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dead_addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let pool = Arc::new(ConnectionPool::open(&Config::default()).unwrap());
    let forwarder = ByOrigin {
        dead: DeliveryClient::new(
            Arc::clone(&pool),
            format!("http://{dead_addr}{COLLECTOR_PATH}"),
            Duration::from_secs(10),
        ),
        collector: DeliveryClient::new(
            Arc::clone(&pool),
            format!("{}{COLLECTOR_PATH}", server.url()),
            Duration::from_secs(10),
        ),
    };
    let dispatcher = Dispatcher::new(
        OriginFilter::default(),
        Enricher::new(IdentityResolver::new(Arc::new(StaticDirectory::default()))),
        Arc::new(forwarder),
    );

    let (source, mut script) = ScriptedSource::new(vec![vec![
        record("su", "0", "0", "FAILED SU"),
        record("sshd", "0", "0", "Accepted"),
    ]]);
    let cancel = CancellationToken::new();
    let mut tail = TailLoop::new(dispatcher, cancel.clone());
    let run = tokio::spawn(async move {
        let outcome = tail.run(source).await;
        (tail.state(), outcome)
    });

    script.until_idle().await;
    cancel.cancel();
    let (state, outcome) = run.await.unwrap();

    assert_eq!(state, TailState::Stopping);
    assert!(outcome.source.is_some());
    let totals = outcome.result.unwrap().totals;
    assert_eq!(totals.connection_failures, 1);
    assert_eq!(totals.delivered, 1);
    mock.assert_async().await;
    pool.close();
}
