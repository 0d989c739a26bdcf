//! Unit tests for tunnel establishment.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use tokio::time::Instant;

use super::*;
use crate::test_support::{
    FailingCheck, LaunchRecord, ScriptedBroker, ScriptedLauncher, ScriptedRunner, SignalEvent,
    TunnelBehaviour, TunnelLaunch,
};

fn target() -> BladeTarget {
    BladeTarget {
        blade_type: String::from("compute"),
        instance: 1,
        hostname: String::from("compute-002"),
        remote_port: 22,
    }
}

fn build_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp/bladelink-tunnel-tests")
}

fn scratch_dir() -> (TempDir, Utf8PathBuf) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
    (tmp, path)
}

/// Collects formatted tracing output for assertions.
#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn retries_until_the_broker_listens() {
    let broker = ScriptedBroker::new(TunnelBehaviour::Listen);
    broker.push(TunnelBehaviour::ExitEarly(1));
    broker.push(TunnelBehaviour::ExitEarly(255));

    let connection = BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
        .await
        .expect("third launch should connect");

    assert!(connection.is_connected());
    let launches = broker.launches();
    assert_eq!(launches.len(), 3);
    let ports: HashSet<u16> = launches
        .iter()
        .map(|launch| launch.request.local_port)
        .collect();
    assert_eq!(ports.len(), 3, "each attempt should use a fresh port");
    let last_port = launches.last().map(|launch| launch.request.local_port);
    assert_eq!(connection.local_port(), last_port);
    assert_eq!(
        connection.local_endpoint().map(|addr| addr.ip()),
        Some(LOCAL_IP)
    );
    assert_eq!(
        connection.logs().out,
        Utf8PathBuf::from("/tmp/bladelink-tunnel-tests/logs/connection-compute-002-port-22-out.txt")
    );
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_the_reconnect_budget() {
    let broker = ScriptedBroker::new(TunnelBehaviour::Refuse);
    let started = Instant::now();

    let err = BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
        .await
        .expect_err("a broker that never listens should time out");

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(600) && elapsed < Duration::from_secs(601),
        "elapsed {elapsed:?}"
    );
    let launches = broker.launches();
    assert_eq!(launches.len(), 10);
    assert!(
        launches
            .iter()
            .all(|launch| launch.signal_events() == vec![SignalEvent::Killed]),
        "every abandoned broker should be killed"
    );
    match err {
        BladeError::ConnectionTimeout {
            hostname,
            remote_port,
            local_port,
            ..
        } => {
            assert_eq!(hostname, "compute-002");
            assert_eq!(remote_port, 22);
            assert_eq!(
                Some(local_port),
                launches.last().map(|launch| launch.request.local_port)
            );
        }
        other => panic!("expected a connection timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn early_exits_pause_between_relaunches() {
    let broker = ScriptedBroker::new(TunnelBehaviour::ExitEarly(1));
    let policy = ConnectPolicy {
        reconnects: 3,
        ..ConnectPolicy::default()
    };
    let started = Instant::now();

    BladeConnection::connect(target(), &broker, &build_dir(), policy)
        .await
        .expect_err("a broker that always exits should time out");

    assert_eq!(broker.launches().len(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let broker = ScriptedBroker::default();
    let mut connection =
        BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
            .await
            .expect("listening broker should connect");

    connection.disconnect();
    connection.disconnect();

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.local_port(), None);
    assert_eq!(connection.local_endpoint(), None);
    let launches = broker.launches();
    let signals = launches
        .first()
        .map(TunnelLaunch::signal_events)
        .unwrap_or_default();
    assert_eq!(signals, vec![SignalEvent::Killed]);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_connection_kills_the_broker() {
    let broker = ScriptedBroker::default();
    let connection =
        BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
            .await
            .expect("listening broker should connect");

    drop(connection);

    let signals = broker
        .launches()
        .first()
        .map(TunnelLaunch::signal_events)
        .unwrap_or_default();
    assert_eq!(signals, vec![SignalEvent::Killed]);
}

#[test]
fn iap_broker_builds_the_tunnel_command() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_output(Some(0), "vtds-1234\n", "");
    let launcher = Arc::new(ScriptedLauncher::default());
    static CACHE: ProjectIdCache = ProjectIdCache::new();
    let broker = IapTunnelBroker::new("gcloud", "hpe-vtds", "us-central1-a")
        .with_runner(runner.clone())
        .with_launcher(launcher.clone())
        .with_cache(&CACHE)
        .with_build_dir(build_dir());
    let request = TunnelRequest {
        hostname: String::from("compute-001"),
        remote_port: 22,
        local_ip: LOCAL_IP,
        local_port: 41_000,
        logs: LogPaths::new(&build_dir(), "connection-compute-001-port-22"),
    };

    let launched = broker.launch(&request).expect("launch should succeed");

    let expected = "gcloud compute --project=vtds-1234 start-iap-tunnel --zone=us-central1-a \
                    --local-host-port=127.0.0.1:41000 compute-001 22";
    assert_eq!(launched.command, expected);
    let launches = launcher.launches();
    assert_eq!(
        launches.first().map(LaunchRecord::command_string),
        Some(String::from(expected))
    );
    assert_eq!(launches.first().map(|launch| launch.logs.clone()), Some(request.logs));
}

#[tokio::test]
async fn unlaunchable_broker_is_a_fault_without_retries() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_output(Some(0), "vtds-1234\n", "");
    let launcher = Arc::new(ScriptedLauncher::default());
    launcher.push_spawn_failure("gcloud: not found");
    static CACHE: ProjectIdCache = ProjectIdCache::new();
    let broker = IapTunnelBroker::new("gcloud", "hpe-vtds", "us-central1-a")
        .with_runner(runner)
        .with_launcher(launcher.clone())
        .with_cache(&CACHE)
        .with_build_dir(build_dir());

    let err = BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
        .await
        .expect_err("spawn failure should surface");

    assert!(matches!(err, BladeError::ConnectionFault { .. }), "got {err:?}");
    assert!(err.to_string().contains("gcloud: not found"), "got {err}");
    assert_eq!(launcher.launches().len(), 0);
}

#[tokio::test]
async fn failed_project_lookup_names_the_target_and_its_logs() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_output(Some(1), "", "ERROR: permission denied\n");
    let launcher = Arc::new(ScriptedLauncher::default());
    static CACHE: ProjectIdCache = ProjectIdCache::new();
    let (_tmp, build) = scratch_dir();
    let broker = IapTunnelBroker::new("gcloud", "hpe-vtds", "us-central1-a")
        .with_runner(runner)
        .with_launcher(launcher.clone())
        .with_cache(&CACHE)
        .with_build_dir(build.clone());

    let err = BladeConnection::connect(target(), &broker, &build, ConnectPolicy::default())
        .await
        .expect_err("lookup failure should surface");

    assert!(matches!(err, BladeError::ConnectionFault { .. }), "got {err:?}");
    let message = err.to_string();
    assert!(message.contains("'compute-002' port 22"), "got {message}");
    assert!(message.contains("hpe-vtds"), "got {message}");
    let logs = err
        .logs()
        .cloned()
        .unwrap_or_else(|| panic!("lookup failure should carry log paths"));
    assert_eq!(logs, crate::project::lookup_logs(&build));
    assert!(message.contains(logs.err.as_str()), "got {message}");
    let stderr = std::fs::read_to_string(&logs.err)
        .unwrap_or_else(|err| panic!("lookup stderr should be recorded: {err}"));
    assert_eq!(stderr, "ERROR: permission denied\n");
    assert_eq!(launcher.launches().len(), 0);
    assert!(CACHE.cached().is_none());
}

#[tokio::test(start_paused = true)]
async fn check_errors_other_than_refusal_are_faults() {
    let broker = ScriptedBroker::new(TunnelBehaviour::Refuse);
    let check = FailingCheck(io::ErrorKind::PermissionDenied);

    let err = BladeConnection::connect_with_check(
        target(),
        &broker,
        &build_dir(),
        ConnectPolicy::default(),
        &check,
    )
    .await
    .expect_err("a denied check should not be retried");

    assert!(matches!(err, BladeError::ConnectionFault { .. }), "got {err:?}");
    assert!(err.to_string().contains("checking local port"), "got {err}");
    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(
        launches.first().map(TunnelLaunch::signal_events),
        Some(vec![SignalEvent::Killed])
    );
}

#[tokio::test(start_paused = true)]
async fn unqueryable_broker_is_a_fault_after_one_launch() {
    let broker = ScriptedBroker::new(TunnelBehaviour::Unqueryable);

    let err = BladeConnection::connect(target(), &broker, &build_dir(), ConnectPolicy::default())
        .await
        .expect_err("a broker whose status cannot be read should fail");

    assert!(matches!(err, BladeError::ConnectionFault { .. }), "got {err:?}");
    assert!(err.to_string().contains("cannot query tunnel command"), "got {err}");
    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(
        launches.first().map(TunnelLaunch::signal_events),
        Some(vec![SignalEvent::Killed])
    );
}

#[tokio::test(start_paused = true)]
async fn early_exit_warnings_say_whether_another_attempt_follows() {
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let log = log.clone();
            move || log.clone()
        })
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);
    let broker = ScriptedBroker::new(TunnelBehaviour::ExitEarly(255));
    let policy = ConnectPolicy {
        reconnects: 2,
        ..ConnectPolicy::default()
    };

    BladeConnection::connect(target(), &broker, &build_dir(), policy)
        .await
        .expect_err("a broker that always exits should time out");

    let output = log.contents();
    let retrying = output
        .lines()
        .find(|line| line.contains("exited early, retrying"))
        .unwrap_or_else(|| panic!("no retrying warning in:\n{output}"));
    assert!(retrying.contains("reconnects_left=1"), "got {retrying}");
    assert!(retrying.contains("code=255"), "got {retrying}");
    let failing = output
        .lines()
        .find(|line| line.contains("exited early, failing"))
        .unwrap_or_else(|| panic!("no failing warning in:\n{output}"));
    assert!(
        failing.contains("logs/connection-compute-002-port-22-err.txt"),
        "got {failing}"
    );
}
