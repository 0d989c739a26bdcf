//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{Instant, sleep_until};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::error::BladeError;
use crate::logs::LogPaths;
use crate::process::{ProcessFuture, ProcessHandle, ProcessLauncher};
use crate::tunnel::{
    CheckFuture, LaunchedTunnel, ReadinessCheck, TunnelBroker, TunnelRequest, render_command_line,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Text fed on standard input, if any.
    pub input: Option<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        render_command_line(&self.program, &self.args)
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            input: input.map(str::to_owned),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, None)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &str,
    ) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, Some(input))
    }
}

/// Signals delivered to a scripted process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// SIGTERM was sent.
    Terminated,
    /// SIGKILL was sent while the process was still running.
    Killed,
}

/// How a scripted process behaves once started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessScript {
    /// Exit code reported on normal completion.
    pub exit_code: i32,
    /// Time until the process exits by itself; `None` runs until signalled.
    pub runtime: Option<Duration>,
    /// Whether SIGTERM stops the process.
    pub honours_terminate: bool,
}

impl ProcessScript {
    /// A process that exits with `code` after `runtime`.
    #[must_use]
    pub const fn exits(code: i32, runtime: Duration) -> Self {
        Self {
            exit_code: code,
            runtime: Some(runtime),
            honours_terminate: true,
        }
    }

    /// A process that runs until it is signalled.
    #[must_use]
    pub const fn runs_forever() -> Self {
        Self {
            exit_code: 0,
            runtime: None,
            honours_terminate: true,
        }
    }

    /// Makes the process ignore SIGTERM.
    #[must_use]
    pub const fn ignoring_terminate(mut self) -> Self {
        self.honours_terminate = false;
        self
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

/// Process double driven by the tokio clock.
///
/// Pair it with a paused runtime (`start_paused = true`) to exercise
/// timeouts without real waiting.
#[derive(Debug)]
pub struct ScriptedProcess {
    pid: u32,
    exit_code: i32,
    finish_at: Option<Instant>,
    honours_terminate: bool,
    signals: Arc<Mutex<Vec<SignalEvent>>>,
}

impl ScriptedProcess {
    /// Starts a process following `script` at the current tokio instant.
    #[must_use]
    pub fn start(script: ProcessScript) -> Self {
        Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            exit_code: script.exit_code,
            finish_at: script.runtime.map(|runtime| Instant::now() + runtime),
            honours_terminate: script.honours_terminate,
            signals: Arc::default(),
        }
    }

    /// Shared log of signals this process receives.
    #[must_use]
    pub fn signals(&self) -> Arc<Mutex<Vec<SignalEvent>>> {
        Arc::clone(&self.signals)
    }

    fn finished(&self) -> bool {
        self.finish_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl ProcessHandle for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        (!self.finished()).then_some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.finished().then_some(self.exit_code))
    }

    fn wait(&mut self) -> ProcessFuture<'_, io::Result<i32>> {
        Box::pin(async move {
            match self.finish_at {
                Some(at) => {
                    sleep_until(at).await;
                    Ok(self.exit_code)
                }
                None => std::future::pending().await,
            }
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        locked(&self.signals).push(SignalEvent::Terminated);
        if self.honours_terminate && !self.finished() {
            self.finish_at = Some(Instant::now());
            self.exit_code = 143;
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.finished() {
            return Ok(());
        }
        locked(&self.signals).push(SignalEvent::Killed);
        self.finish_at = Some(Instant::now());
        self.exit_code = 137;
        Ok(())
    }
}

/// One process started through [`ScriptedLauncher`].
#[derive(Clone, Debug)]
pub struct LaunchRecord {
    /// Program name.
    pub program: String,
    /// Program arguments.
    pub args: Vec<OsString>,
    /// Log files the process was given.
    pub logs: LogPaths,
    /// Signals the process has received.
    pub signals: Arc<Mutex<Vec<SignalEvent>>>,
}

impl LaunchRecord {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        render_command_line(&self.program, &self.args)
    }

    /// Snapshot of delivered signals.
    #[must_use]
    pub fn signal_events(&self) -> Vec<SignalEvent> {
        locked(&self.signals).clone()
    }
}

/// Launcher that starts [`ScriptedProcess`] doubles.
///
/// Scripts queued with [`ScriptedLauncher::push`] are consumed in launch
/// order; once the queue is empty every launch uses the fallback script.
#[derive(Clone, Debug)]
pub struct ScriptedLauncher {
    scripts: Arc<Mutex<VecDeque<Result<ProcessScript, String>>>>,
    fallback: ProcessScript,
    launches: Arc<Mutex<Vec<LaunchRecord>>>,
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new(ProcessScript::exits(0, Duration::from_secs(1)))
    }
}

impl ScriptedLauncher {
    /// Creates a launcher whose unscripted launches follow `fallback`.
    #[must_use]
    pub fn new(fallback: ProcessScript) -> Self {
        Self {
            scripts: Arc::default(),
            fallback,
            launches: Arc::default(),
        }
    }

    /// Queues the behaviour of the next launch.
    pub fn push(&self, script: ProcessScript) {
        locked(&self.scripts).push_back(Ok(script));
    }

    /// Makes the next launch fail to spawn with `message`.
    pub fn push_spawn_failure(&self, message: impl Into<String>) {
        locked(&self.scripts).push_back(Err(message.into()));
    }

    /// Returns a snapshot of every launch so far.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRecord> {
        locked(&self.launches).clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        logs: &LogPaths,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let script = locked(&self.scripts)
            .pop_front()
            .unwrap_or(Ok(self.fallback))
            .map_err(|message| io::Error::new(io::ErrorKind::NotFound, message))?;
        let process = ScriptedProcess::start(script);
        locked(&self.launches).push(LaunchRecord {
            program: program.to_owned(),
            args: args.to_vec(),
            logs: logs.clone(),
            signals: process.signals(),
        });
        Ok(Box::new(process))
    }
}

/// How a scripted tunnel broker behaves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelBehaviour {
    /// The broker exits immediately with the given code.
    ExitEarly(i32),
    /// The broker stays up but never accepts connections.
    Refuse,
    /// The broker listens on the requested local port.
    Listen,
    /// The broker stays up but querying its status fails.
    Unqueryable,
}

/// One tunnel started through [`ScriptedBroker`].
#[derive(Clone, Debug)]
pub struct TunnelLaunch {
    /// The request the broker received.
    pub request: TunnelRequest,
    /// Signals the broker process has received.
    pub signals: Arc<Mutex<Vec<SignalEvent>>>,
}

impl TunnelLaunch {
    /// Snapshot of delivered signals.
    #[must_use]
    pub fn signal_events(&self) -> Vec<SignalEvent> {
        locked(&self.signals).clone()
    }
}

/// Tunnel broker double that opens real loopback listeners.
#[derive(Clone, Debug)]
pub struct ScriptedBroker {
    behaviours: Arc<Mutex<VecDeque<TunnelBehaviour>>>,
    fallback: TunnelBehaviour,
    launches: Arc<Mutex<Vec<TunnelLaunch>>>,
}

impl Default for ScriptedBroker {
    fn default() -> Self {
        Self::new(TunnelBehaviour::Listen)
    }
}

impl ScriptedBroker {
    /// Creates a broker whose unscripted launches follow `fallback`.
    #[must_use]
    pub fn new(fallback: TunnelBehaviour) -> Self {
        Self {
            behaviours: Arc::default(),
            fallback,
            launches: Arc::default(),
        }
    }

    /// Queues the behaviour of the next launch.
    pub fn push(&self, behaviour: TunnelBehaviour) {
        locked(&self.behaviours).push_back(behaviour);
    }

    /// Returns a snapshot of every launch so far.
    #[must_use]
    pub fn launches(&self) -> Vec<TunnelLaunch> {
        locked(&self.launches).clone()
    }
}

impl TunnelBroker for ScriptedBroker {
    fn launch(&self, request: &TunnelRequest) -> Result<LaunchedTunnel, BladeError> {
        let behaviour = locked(&self.behaviours)
            .pop_front()
            .unwrap_or(self.fallback);
        let (process, listener) = match behaviour {
            TunnelBehaviour::ExitEarly(code) => {
                (ScriptedProcess::start(ProcessScript::exits(code, Duration::ZERO)), None)
            }
            TunnelBehaviour::Refuse | TunnelBehaviour::Unqueryable => {
                (ScriptedProcess::start(ProcessScript::runs_forever()), None)
            }
            TunnelBehaviour::Listen => {
                let listener = TcpListener::bind((request.local_ip, request.local_port))
                    .map_err(|err| BladeError::ConnectionFault {
                        hostname: request.hostname.clone(),
                        remote_port: request.remote_port,
                        local_ip: request.local_ip,
                        message: format!("scripted broker could not listen - {err}"),
                        logs: request.logs.clone(),
                    })?;
                (
                    ScriptedProcess::start(ProcessScript::runs_forever()),
                    Some(listener),
                )
            }
        };
        locked(&self.launches).push(TunnelLaunch {
            request: request.clone(),
            signals: process.signals(),
        });
        Ok(LaunchedTunnel {
            process: Box::new(ListeningProcess {
                process,
                listener,
                unqueryable: behaviour == TunnelBehaviour::Unqueryable,
            }),
            command: format!(
                "scripted-tunnel {}:{} {} {}",
                request.local_ip, request.local_port, request.hostname, request.remote_port
            ),
        })
    }
}

#[derive(Debug)]
struct ListeningProcess {
    process: ScriptedProcess,
    listener: Option<TcpListener>,
    unqueryable: bool,
}

impl ProcessHandle for ListeningProcess {
    fn id(&self) -> Option<u32> {
        self.process.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.unqueryable {
            return Err(io::Error::other("scripted broker status is unavailable"));
        }
        self.process.try_wait()
    }

    fn wait(&mut self) -> ProcessFuture<'_, io::Result<i32>> {
        self.process.wait()
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.listener = None;
        self.process.terminate()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.listener = None;
        self.process.kill()
    }
}

/// Readiness check that always fails with one error kind.
#[derive(Clone, Copy, Debug)]
pub struct FailingCheck(pub io::ErrorKind);

impl ReadinessCheck for FailingCheck {
    fn check(&self, addr: SocketAddr) -> CheckFuture<'_> {
        let kind = self.0;
        Box::pin(async move { Err(io::Error::new(kind, format!("scripted check of {addr}"))) })
    }
}

/// Minimal provider configuration used across tests.
///
/// Declares two `host-blade` instances with hostname suffixes, three
/// `compute` instances with an SSH key secret, and a pure base class that
/// must never be connected to.
#[must_use]
pub fn sample_provider_json() -> String {
    String::from(
        r#"{
  "organization": { "name": "hpe" },
  "project": { "base_name": "vtds", "zone": "us-central1-a" },
  "virtual_blades": {
    "base-blade": {
      "pure_base_class": true,
      "count": 4,
      "hostname": "base"
    },
    "compute": {
      "count": 3,
      "hostname": "compute",
      "hostname_suffix_separator": "-",
      "ssh_key_secret": "compute-ssh-key",
      "blade_interconnect": {
        "subnetwork": "cluster-net",
        "ip_addrs": ["10.1.0.10", "10.1.0.11", "10.1.0.12"]
      }
    },
    "host-blade": {
      "count": 2,
      "hostname": "host-blade",
      "hostname_suffix_separator": "-",
      "ssh_key_secret": "host-ssh-key"
    }
  },
  "blade_interconnects": {
    "base-net": { "pure_base_class": true },
    "cluster-net": {
      "network_name": "cluster-network",
      "ipv4_cidr": "10.1.0.0/16"
    }
  },
  "secrets": {
    "compute-ssh-key": {
      "name": "compute-ssh-key",
      "labels": { "tier": "blade" },
      "annotations": { "owner": "vtds" }
    },
    "host-ssh-key": { "name": "host-ssh-key" }
  }
}"#,
    )
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
