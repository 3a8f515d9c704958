use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long to wait for the pipe readers after the child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    /// Combined stdout and stderr. `None` when the command timed out.
    pub output: Option<String>,
    pub timed_out: bool,
}

impl CommandOutcome {
    fn timed_out() -> Self {
        Self {
            success: false,
            output: None,
            timed_out: true,
        }
    }

    fn failed(msg: String) -> Self {
        Self {
            success: false,
            output: Some(msg),
            timed_out: false,
        }
    }

    pub fn text(&self) -> &str {
        self.output.as_deref().unwrap_or("")
    }
}

/// Runs `<program> [base args] [-s <serial>] <command> [args]` as a child
/// process with a hard wall-clock deadline.
///
/// Each call gets its own OS process, so a wedged transport can be killed and
/// reaped without touching the caller. The child is polled every
/// `poll_interval`; stdout and stderr are drained on helper threads so a
/// chatty child cannot block on a full pipe.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    base_args: Vec<String>,
    serial: Option<String>,
    poll_interval: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            serial: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_base_args(mut self, args: &[String]) -> Self {
        self.base_args = args.to_vec();
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn build(&self, command: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.arg(command);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    pub fn execute(&self, command: &str, args: &[&str], timeout: Duration) -> CommandOutcome {
        debug!(
            program = %self.program.display(),
            serial = self.serial.as_deref().unwrap_or(""),
            command,
            ?args,
            timeout_secs = timeout.as_secs(),
            "starting device command"
        );

        let child = match self.build(command, args).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command, error = %err, "device command could not be spawned");
                return CommandOutcome::failed(format!(
                    "spawning {}: {err}",
                    self.program.display()
                ));
            }
        };

        let outcome = wait_with_timeout(child, timeout, self.poll_interval);
        if outcome.timed_out {
            warn!(command, timeout_secs = timeout.as_secs(), "device command timed out");
        } else {
            debug!(command, success = outcome.success, "device command terminated");
        }
        outcome
    }

    /// Like [`execute`](Self::execute), but a timeout terminates this process
    /// so the supervisor can restart it against a device that looks wedged.
    pub fn execute_or_exit(&self, command: &str, args: &[&str], timeout: Duration) -> CommandOutcome {
        let outcome = self.execute(command, args, timeout);
        if outcome.timed_out {
            error!(command, "device command timed out with quit-on-fail set, exiting");
            std::process::exit(1);
        }
        outcome
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn wait_with_timeout(mut child: Child, timeout: Duration, poll: Duration) -> CommandOutcome {
    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut combined = stdout_rx.recv_timeout(DRAIN_GRACE).unwrap_or_default();
                combined.extend(stderr_rx.recv_timeout(DRAIN_GRACE).unwrap_or_default());
                return CommandOutcome {
                    success: status.success(),
                    output: Some(String::from_utf8_lossy(&combined).into_owned()),
                    timed_out: false,
                };
            }
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return CommandOutcome::failed(format!("try_wait: {err}"));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            let _ = child.kill();
            // Reap so no zombie is left behind; the readers are abandoned if a
            // grandchild still holds the pipes open.
            let _ = child.wait();
            return CommandOutcome::timed_out();
        }

        std::thread::sleep(poll.min(deadline - now));
    }
}
