//! Units running as child processes.
//!
//! The coordinator listens on an ephemeral loopback port and passes its
//! address to the child in `TESTRUN_CONTROL_ADDR`. The child connects back and
//! both sides exchange newline-delimited JSON. Standard output and error stay
//! on the child's pipes and are forwarded as output chunks.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use testrun_core::{
    FromUnit, StateChange, TestFile, ToUnit, TransportKind, WorkerExit, WorkerFailure,
    WorkerOptions,
};

use super::session::Session;
use super::{open_session, Transport, WorkerEvent, WorkerHandle, DEFAULT_OUTBOUND_CAPACITY};
use crate::error::TransportError;
use crate::wire::{self, CONTROL_ADDR_ENV, TEST_FILE_ENV, WORKER_ID_ENV};

/// How long output pipes and the control connection may outlive the process.
const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// How long to look for a connection the unit opened just before exiting.
const LATE_ACCEPT_GRACE: Duration = Duration::from_millis(250);

/// Launches each unit as a child process running `program args... <file>`.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    /// Path to the unit executable.
    program: PathBuf,

    /// Arguments placed before the test file path.
    args: Vec<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,

    /// Working directory for the child (optional).
    current_dir: Option<PathBuf>,

    outbound_capacity: usize,
    output_grace: Duration,
}

impl ProcessTransport {
    /// Create a transport for the given unit executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            current_dir: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            output_grace: DEFAULT_OUTPUT_GRACE,
        }
    }

    /// Add an argument placed before the test file path.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments placed before the test file path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Set the working directory of every unit.
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the capacity of the coordinator-to-unit channel.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Set how long output may keep arriving after the process exited.
    pub fn with_output_grace(mut self, grace: Duration) -> Self {
        self.output_grace = grace;
        self
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn spawn(
        &self,
        file: &TestFile,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let control_addr = listener.local_addr()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(file.path())
            .env(CONTROL_ADDR_ENV, control_addr.to_string())
            .env(WORKER_ID_ENV, options.worker_id.as_str())
            .env(TEST_FILE_ENV, file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, program = %self.program.display(), "Failed to spawn unit process");
            e
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Protocol("Failed to get stderr".to_string()))?;

        let (handle, session, to_unit) = open_session(file, options, self.outbound_capacity);
        info!(
            worker_id = %handle.id(),
            file = %file,
            pid = ?child.id(),
            control_addr = %control_addr,
            "Spawned unit process"
        );

        let pipes = Pipes { stdout, stderr };
        tokio::spawn(supervise(child, listener, pipes, session, to_unit, self.output_grace));
        Ok(handle)
    }
}

struct Pipes {
    stdout: ChildStdout,
    stderr: ChildStderr,
}

async fn supervise(
    mut child: Child,
    listener: TcpListener,
    pipes: Pipes,
    mut session: Session,
    to_unit: mpsc::Receiver<ToUnit>,
    output_grace: Duration,
) {
    let force_exit = session.force_exit_token();
    let output = [
        forward_output(pipes.stdout, session.events(), false),
        forward_output(pipes.stderr, session.events(), true),
    ];

    let mut status: Option<io::Result<ExitStatus>> = None;
    let mut forced = false;
    let mut transport_error = None;
    let mut control_error = None;

    let mut control: Option<TcpStream> = tokio::select! {
        biased;
        _ = force_exit.cancelled() => {
            forced = true;
            kill(&mut child);
            None
        }
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                debug!(worker_id = %session.worker_id(), peer = %peer, "Unit connected");
                Some(stream)
            }
            Err(e) => {
                error!(worker_id = %session.worker_id(), error = %e, "Failed to accept unit connection");
                transport_error = Some(format!("control connection failed: {e}"));
                kill(&mut child);
                None
            }
        },
        result = child.wait() => {
            status = Some(result);
            None
        }
    };

    // A unit that connected, reported and exited before we got to accept
    // left its connection queued on the listener.
    if control.is_none() && status.is_some() && !forced {
        let late = tokio::time::timeout(LATE_ACCEPT_GRACE, listener.accept()).await;
        if let Ok(Ok((stream, peer))) = late {
            debug!(worker_id = %session.worker_id(), peer = %peer, "Unit connected before exiting");
            control = Some(stream);
        }
    }
    drop(listener);

    match control {
        Some(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            let (read, write) = stream.into_split();
            let writer = tokio::spawn(wire::write_loop(write, to_unit));
            let mut lines = BufReader::new(read).lines();
            let mut eof = false;
            let mut deadline = status.as_ref().map(|_| Instant::now() + output_grace);

            while !eof || status.is_none() {
                tokio::select! {
                    message = wire::next_message::<_, FromUnit>(&mut lines), if !eof => match message {
                        Ok(Some(message)) => session.handle(message),
                        Ok(None) => eof = true,
                        Err(e) => {
                            warn!(worker_id = %session.worker_id(), error = %e, "Control connection failed");
                            control_error = Some(format!("control connection failed: {e}"));
                            eof = true;
                        }
                    },
                    result = child.wait(), if status.is_none() => {
                        status = Some(result);
                        deadline = Some(Instant::now() + output_grace);
                    }
                    _ = force_exit.cancelled(), if !forced => {
                        forced = true;
                        kill(&mut child);
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        warn!(worker_id = %session.worker_id(), "Control connection outlived the unit process");
                        eof = true;
                    }
                }
            }
            writer.abort();
        }
        None => {
            drop(to_unit);
            if status.is_none() {
                status = Some(child.wait().await);
            }
        }
    }

    for mut reader in output {
        if tokio::time::timeout(output_grace, &mut reader).await.is_err() {
            warn!(worker_id = %session.worker_id(), "Output pipe outlived the unit process");
            reader.abort();
        }
    }

    let exit = if forced {
        WorkerExit::ForcedExit
    } else if let Some(cause) = transport_error {
        WorkerFailure::TransportError { cause }.into()
    } else {
        match (classify(status), control_error) {
            // The process exiting cleanly does not make up for a broken control stream.
            (WorkerExit::Finished, Some(cause)) => WorkerFailure::TransportError { cause }.into(),
            (exit, _) => exit,
        }
    };
    session.finish(exit);
}

fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill unit process");
    }
}

fn forward_output<R>(mut reader: R, events: mpsc::UnboundedSender<WorkerEvent>, stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break, // EOF
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let change = if stderr {
                        StateChange::WorkerStderr { chunk }
                    } else {
                        StateChange::WorkerStdout { chunk }
                    };
                    if events.send(WorkerEvent::StateChange(change)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, stderr, "Error reading unit output");
                    break;
                }
            }
        }
    })
}

fn classify(status: Option<io::Result<ExitStatus>>) -> WorkerExit {
    match status {
        Some(Ok(status)) if status.success() => WorkerExit::Finished,
        Some(Ok(status)) => match status.code() {
            Some(code) => WorkerFailure::NonzeroExit { code }.into(),
            None => WorkerFailure::Signal {
                name: signal_name(&status),
            }
            .into(),
        },
        Some(Err(e)) => WorkerFailure::TransportError {
            cause: format!("failed to wait for unit process: {e}"),
        }
        .into(),
        None => WorkerFailure::TransportError {
            cause: "unit process exit status unavailable".to_string(),
        }
        .into(),
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(1) => "SIGHUP".to_string(),
        Some(2) => "SIGINT".to_string(),
        Some(3) => "SIGQUIT".to_string(),
        Some(4) => "SIGILL".to_string(),
        Some(6) => "SIGABRT".to_string(),
        Some(8) => "SIGFPE".to_string(),
        Some(9) => "SIGKILL".to_string(),
        Some(11) => "SIGSEGV".to_string(),
        Some(13) => "SIGPIPE".to_string(),
        Some(14) => "SIGALRM".to_string(),
        Some(15) => "SIGTERM".to_string(),
        Some(n) => format!("signal {n}"),
        None => "unknown".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> String {
    "unknown".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use testrun_core::WorkerId;

    fn options(file: &TestFile) -> WorkerOptions {
        WorkerOptions {
            worker_id: WorkerId::generate(),
            file: file.clone(),
            kind: TransportKind::Process,
            fail_fast: false,
            extra: serde_json::Value::Null,
        }
    }

    async fn collect(handle: &mut WorkerHandle) -> Vec<StateChange> {
        let mut events = handle.take_events().unwrap();
        let mut changes = Vec::new();
        while let Some(event) = events.recv().await {
            if let WorkerEvent::StateChange(change) = event {
                changes.push(change);
            }
        }
        changes
    }

    #[test]
    fn test_transport_builder() {
        let transport = ProcessTransport::new("node")
            .with_arg("--test")
            .with_args(["--a", "--b"])
            .with_env("NODE_ENV", "test")
            .with_current_dir("/tmp")
            .with_outbound_capacity(8);

        assert_eq!(transport.program, PathBuf::from("node"));
        assert_eq!(transport.args, vec!["--test", "--a", "--b"]);
        assert_eq!(transport.env_vars.len(), 1);
        assert_eq!(transport.current_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(transport.kind(), TransportKind::Process);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_connecting() {
        let transport = ProcessTransport::new("sh").with_args(["-c", "echo hello; exit 3", "sh"]);
        let file = TestFile::new("/tmp/exit.test").unwrap();
        let mut handle = transport.spawn(&file, options(&file)).await.unwrap();

        let changes = collect(&mut handle).await;
        let stdout: Vec<u8> = changes
            .iter()
            .filter_map(|change| match change {
                StateChange::WorkerStdout { chunk } => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(stdout, b"hello\n");
        assert_eq!(
            changes.last(),
            Some(&StateChange::WorkerFailed {
                failure: WorkerFailure::NonzeroExit { code: 3 }
            })
        );
        assert!(handle.wait().await.is_failure());
    }

    #[tokio::test]
    async fn test_forced_exit_kills_process() {
        let transport = ProcessTransport::new("sleep").with_arg("30");
        let file = TestFile::new("/tmp/slow.test").unwrap();
        let mut handle = transport.spawn(&file, options(&file)).await.unwrap();

        handle.exit();
        let changes = collect(&mut handle).await;
        assert_eq!(
            changes.last(),
            Some(&StateChange::WorkerFinished { forced_exit: true })
        );
        assert_eq!(handle.wait().await, WorkerExit::ForcedExit);
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_program() {
        let transport = ProcessTransport::new("/nonexistent/testrun-unit");
        let file = TestFile::new("/tmp/a.test").unwrap();
        let result = transport.spawn(&file, options(&file)).await;
        assert!(matches!(result, Err(TransportError::Spawn(_))));
    }

    #[test]
    fn test_classify_signal() {
        use std::os::unix::process::ExitStatusExt;

        let killed = ExitStatus::from_raw(9);
        assert_eq!(
            classify(Some(Ok(killed))),
            WorkerExit::from(WorkerFailure::Signal {
                name: "SIGKILL".to_string()
            })
        );
        assert_eq!(classify(Some(Ok(ExitStatus::from_raw(0)))), WorkerExit::Finished);
        assert!(classify(None).is_failure());
    }

    /// Shell unit that talks to the coordinator over bash's `/dev/tcp`.
    fn bash_unit(body: &str) -> ProcessTransport {
        let script = format!(
            "exec 3<>/dev/tcp/${{{addr}%:*}}/${{{addr}##*:}} || exit 9\n{body}",
            addr = CONTROL_ADDR_ENV,
        );
        ProcessTransport::new("bash").with_args(["-c".to_string(), script, "unit".to_string()])
    }

    #[tokio::test]
    async fn test_report_from_unit_that_exited_before_accept() {
        let transport = bash_unit(concat!(
            r#"printf '%s\n' '{"type":"starting"}' >&3"#,
            "\n",
            r#"printf '%s\n' '{"type":"state-change","change":{"type":"test-passed","title":"adds","duration_ms":1}}' >&3"#,
            "\nexit 0",
        ));
        let file = TestFile::new("/tmp/quick.test").unwrap();
        let mut handle = transport.spawn(&file, options(&file)).await.unwrap();

        // Keep the runtime busy so the unit is long gone before the supervisor first runs.
        std::thread::sleep(Duration::from_millis(500));

        let changes = collect(&mut handle).await;
        assert!(changes.contains(&StateChange::TestPassed {
            title: "adds".to_string(),
            duration_ms: Some(1),
        }));
        assert_eq!(
            changes.last(),
            Some(&StateChange::WorkerFinished { forced_exit: false })
        );
        assert_eq!(handle.wait().await, WorkerExit::Finished);
    }

    #[tokio::test]
    async fn test_unreadable_control_stream_is_a_transport_error() {
        let transport = bash_unit("printf '\\xff\\xfe\\n' >&3\nexit 0");
        let file = TestFile::new("/tmp/garbled.test").unwrap();
        let mut handle = transport.spawn(&file, options(&file)).await.unwrap();

        let changes = collect(&mut handle).await;
        assert!(matches!(
            changes.last(),
            Some(StateChange::WorkerFailed {
                failure: WorkerFailure::TransportError { .. }
            })
        ));
        assert!(handle.wait().await.is_failure());
    }

    /// Body of the unit process spawned by `test_process_unit_lifecycle`.
    /// Does nothing when run as an ordinary test.
    #[tokio::test]
    async fn test_unit_process_child() {
        if std::env::var_os(CONTROL_ADDR_ENV).is_none() {
            return;
        }
        crate::unit::serve_from_env(|unit: crate::unit::Unit| async move {
            let options = unit.options().await.unwrap();
            assert_eq!(options.kind, TransportKind::Process);
            unit.emit(StateChange::TestPassed {
                title: options.file.to_string(),
                duration_ms: Some(2),
            });
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_process_unit_lifecycle() {
        let test_binary = std::env::current_exe().unwrap();
        let transport = ProcessTransport::new(test_binary).with_args([
            "--exact",
            "transport::process::tests::test_unit_process_child",
            "--nocapture",
            "--test-threads=1",
        ]);
        let file = TestFile::new("/tmp/lifecycle.test").unwrap();
        let mut handle = transport.spawn(&file, options(&file)).await.unwrap();

        let changes: Vec<StateChange> = collect(&mut handle)
            .await
            .into_iter()
            .filter(|change| {
                !matches!(
                    change,
                    StateChange::WorkerStdout { .. } | StateChange::WorkerStderr { .. }
                )
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                StateChange::TestPassed {
                    title: file.to_string(),
                    duration_ms: Some(2),
                },
                StateChange::WorkerFinished { forced_exit: false },
            ]
        );
        assert_eq!(handle.wait().await, WorkerExit::Finished);
    }
}
