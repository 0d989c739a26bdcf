//! Unit tests for process supervision.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use tokio::time::Instant;

use super::*;
use crate::error::BladeError;
use crate::test_support::{ProcessScript, ScriptedProcess, SignalEvent};

fn logs() -> LogPaths {
    LogPaths::new(&Utf8PathBuf::from("/tmp/bladelink-test"), "wait")
}

fn signals(process: &ScriptedProcess) -> Vec<SignalEvent> {
    process
        .signals()
        .lock()
        .map(|events| events.clone())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn waits_past_several_cycles_for_a_slow_process() {
    let mut process = ScriptedProcess::start(ProcessScript::exits(0, Duration::from_secs(12)));
    let started = Instant::now();

    let code = wait_for_process(&mut process, "command 'sleep 12'", &logs(), WaitOptions::default())
        .await
        .expect("process should exit cleanly");

    assert_eq!(code, 0);
    assert_eq!(started.elapsed(), Duration::from_secs(12));
    assert!(signals(&process).is_empty());
}

#[rstest]
#[case::checked(true)]
#[case::unchecked(false)]
#[tokio::test(start_paused = true)]
async fn non_zero_exit_fails_only_when_checked(#[case] check: bool) {
    let mut process = ScriptedProcess::start(ProcessScript::exits(3, Duration::from_secs(1)));

    let result = wait_for_process(
        &mut process,
        "command 'false'",
        &logs(),
        WaitOptions::default().with_check(check),
    )
    .await;

    if check {
        let err = result.expect_err("checked wait should fail");
        let rendered = err.to_string();
        assert!(
            rendered.contains("command 'false' terminated with a non-zero exit status '3'"),
            "unexpected error: {rendered}"
        );
        assert!(rendered.contains("wait-err.txt"), "missing logs: {rendered}");
    } else {
        assert_eq!(result.expect("unchecked wait should succeed"), 3);
    }
}

#[tokio::test(start_paused = true)]
async fn stubborn_process_is_terminated_then_killed() {
    let mut process =
        ScriptedProcess::start(ProcessScript::runs_forever().ignoring_terminate());
    let started = Instant::now();

    let err = wait_for_process(
        &mut process,
        "command 'hang'",
        &logs(),
        WaitOptions::default()
            .with_timeout(Some(Duration::from_secs(10)))
            .with_check(false),
    )
    .await
    .expect_err("timed out wait should fail");

    assert!(matches!(err, BladeError::RemoteOperation { .. }), "got {err:?}");
    assert!(
        err.to_string()
            .contains("command 'hang' timed out after 10 seconds and did not terminate"),
        "unexpected error: {err}"
    );
    assert_eq!(
        signals(&process),
        vec![SignalEvent::Terminated, SignalEvent::Killed]
    );
    assert_eq!(started.elapsed(), Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn terminated_process_still_reports_a_timeout() {
    let mut process = ScriptedProcess::start(ProcessScript::runs_forever());

    let err = wait_for_process(
        &mut process,
        "command 'hang'",
        &logs(),
        WaitOptions::default()
            .with_timeout(Some(Duration::from_secs(5)))
            .with_check(false),
    )
    .await
    .expect_err("timed out wait should fail");

    assert!(
        err.to_string()
            .contains("timed out after 5 seconds and was terminated"),
        "unexpected error: {err}"
    );
    assert_eq!(signals(&process), vec![SignalEvent::Terminated]);
}

#[tokio::test]
async fn tokio_launcher_writes_logs_and_reports_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let build_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir: {}", path.display()));
    let logs = LogPaths::new(&build_dir, "shell");

    let mut process = TokioProcessLauncher
        .spawn(
            "sh",
            &[
                OsString::from("-c"),
                OsString::from("echo out; echo err >&2; exit 3"),
            ],
            &logs,
        )
        .expect("sh should spawn");
    let code = wait_for_process(
        process.as_mut(),
        "command 'sh'",
        &logs,
        WaitOptions::default().with_check(false),
    )
    .await
    .expect("wait should succeed");

    assert_eq!(code, 3);
    let out = std::fs::read_to_string(&logs.out).expect("stdout log should exist");
    let err = std::fs::read_to_string(&logs.err).expect("stderr log should exist");
    assert_eq!(out, "out\n");
    assert_eq!(err, "err\n");
}

#[tokio::test]
async fn tokio_launcher_terminate_maps_signal_to_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let build_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir: {}", path.display()));
    let logs = LogPaths::new(&build_dir, "sleeper");

    let mut process = TokioProcessLauncher
        .spawn("sleep", &[OsString::from("30")], &logs)
        .expect("sleep should spawn");
    process.terminate().expect("terminate should deliver");
    let code = process.wait().await.expect("wait should succeed");

    assert_eq!(code, 143);
    process.kill().expect("killing a reaped process is a no-op");
}
