use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// How a job ended, plus whatever it wrote while running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl JobExit {
    fn from_status(status: ExitStatus) -> Self {
        JobExit {
            code: status.code(),
            success: status.success(),
            ..Default::default()
        }
    }
}

/// A launched external process as seen by the dispatcher.
pub trait Job {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<JobExit>>;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process outright and reap it.
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts the external tool for one command.
pub trait Launcher {
    type Job: Job;

    fn launch(&self, command: &str) -> io::Result<Self::Job>;
}

/// Runs `<program> -p <command>` in a fixed working directory.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    working_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            working_dir: working_dir.into(),
        }
    }
}

impl Launcher for ProcessLauncher {
    type Job = ProcessJob;

    fn launch(&self, command: &str) -> io::Result<ProcessJob> {
        let mut child = Command::new(&self.program)
            .arg("-p")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Ok(ProcessJob {
            child,
            stdout,
            stderr,
        })
    }
}

/// Read a pipe to the end on a background thread so the child never blocks
/// on a full pipe buffer.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Longest a reaped job's reader thread is given to hit end-of-file.
const OUTPUT_SETTLE: Duration = Duration::from_millis(200);

/// Collect captured output once the reader thread is done. A grandchild
/// holding the pipe open keeps the thread alive past `OUTPUT_SETTLE`; it is
/// then left detached and the output dropped.
fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let deadline = Instant::now() + OUTPUT_SETTLE;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if handle.is_finished() {
        handle.join().unwrap_or_default()
    } else {
        String::new()
    }
}

#[derive(Debug)]
pub struct ProcessJob {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl Job for ProcessJob {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let mut exit = JobExit::from_status(status);
        exit.stdout = collect(self.stdout.take());
        exit.stderr = collect(self.stderr.take());
        Ok(Some(exit))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Run `<program> --version` and report whether it exits successfully
/// within `timeout`.
pub fn tool_available(program: &str, timeout: Duration) -> bool {
    let mut child = match Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!(program, error = %err, "tool probe failed to start");
            return false;
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) => {
                debug!(program, "tool probe timed out");
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
            Err(err) => {
                debug!(program, error = %err, "tool probe wait failed");
                return false;
            }
        }
    }
}
