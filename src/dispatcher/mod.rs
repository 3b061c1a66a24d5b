use crate::config::Config;
use crate::job::{Job, JobExit, Launcher};
use crate::processed::ProcessedSet;
use crate::queue::{CommandEntry, CommandId, CommandQueue};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single sleep while waiting, so a stop request or a job exit is
/// noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// How long a job gets to exit after SIGTERM before it is killed.
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Time source for the poll loop.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A launched command that has not been seen to exit yet.
#[derive(Debug)]
pub struct RunningJob<J> {
    pub id: CommandId,
    pub command: String,
    pub started: Instant,
    job: J,
}

/// What one poll cycle did.
#[derive(Debug, Default, PartialEq)]
pub struct CycleReport {
    /// Jobs reaped at the start of the cycle.
    pub finished: Vec<(CommandId, JobExit)>,
    pub launched: Vec<CommandId>,
    /// Commands whose launch failed; they stay pending.
    pub failed: Vec<CommandId>,
    /// Pending commands left for a later cycle because no slot was free.
    pub deferred: usize,
}

/// Polls the command queue and runs pending commands through a [`Launcher`],
/// at most `max_concurrent` at a time, in queue order.
pub struct Dispatcher<L: Launcher, C: Clock = SystemClock> {
    queue: CommandQueue,
    processed: ProcessedSet,
    launcher: L,
    clock: C,
    max_concurrent: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
    running: Vec<RunningJob<L::Job>>,
    launch_failures: HashMap<CommandId, u32>,
}

impl<L: Launcher, C: Clock> Dispatcher<L, C> {
    /// Build a dispatcher from `config`, loading the processed set from disk
    /// (an unreadable file starts empty).
    pub fn new(config: &Config, launcher: L, clock: C) -> Self {
        Self {
            queue: CommandQueue::new(&config.queue_file),
            processed: ProcessedSet::load(&config.processed_file),
            launcher,
            clock,
            max_concurrent: config.max_concurrent.max(1),
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
            running: Vec::new(),
            launch_failures: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn running(&self) -> &[RunningJob<L::Job>] {
        &self.running
    }

    #[cfg(test)]
    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    /// Queue entries not yet launched, oldest first.
    pub fn pending_commands(&self) -> Vec<CommandEntry> {
        self.queue.pending(&self.processed)
    }

    /// Run until `stop` is set (or after one cycle with `once`), then shut
    /// down running jobs. An error from a cycle ends the loop and is returned
    /// after shutdown.
    pub fn run(&mut self, stop: &AtomicBool, once: bool) -> Result<()> {
        info!(
            queue = %self.queue.path().display(),
            processed = %self.processed.path().display(),
            already_processed = self.processed.len(),
            max_concurrent = self.max_concurrent,
            poll_interval = %humantime::format_duration(self.poll_interval),
            "starting command monitor"
        );

        let outcome = loop {
            if stop.load(Ordering::SeqCst) {
                info!("shutdown requested");
                break Ok(());
            }
            match self.poll_once() {
                Ok(report) => debug!(
                    finished = report.finished.len(),
                    launched = report.launched.len(),
                    failed = report.failed.len(),
                    deferred = report.deferred,
                    running = self.running.len(),
                    "poll cycle complete"
                ),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "monitor error, stopping");
                    break Err(err);
                }
            }
            if once {
                break Ok(());
            }
            self.sleep_until_next_poll(stop);
        };

        self.shutdown();
        info!("monitor stopped");
        outcome
    }

    /// One reap/admit/launch cycle.
    pub fn poll_once(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport {
            finished: self.reap()?,
            ..Default::default()
        };

        let mut slots = self.max_concurrent.saturating_sub(self.running.len());
        let pending = self.pending_commands();

        for (index, entry) in pending.iter().enumerate() {
            let id = entry.id();
            // Duplicate identities in one queue are the same command.
            if self.processed.contains(&id) {
                continue;
            }
            if slots == 0 {
                report.deferred = pending[index..]
                    .iter()
                    .filter(|e| !self.processed.contains(&e.id()))
                    .count();
                info!(
                    running = self.running.len(),
                    deferred = report.deferred,
                    "max concurrent jobs reached, waiting"
                );
                break;
            }
            if self.launch(entry, id.clone()) {
                slots -= 1;
                report.launched.push(id);
            } else {
                report.failed.push(id);
            }
        }

        Ok(report)
    }

    /// Start one command. On success the command is recorded as processed
    /// right away, before it finishes.
    fn launch(&mut self, entry: &CommandEntry, id: CommandId) -> bool {
        info!(command_id = %id, command = %entry.command, "executing command");
        match self.launcher.launch(&entry.command) {
            Ok(job) => {
                info!(command_id = %id, pid = ?job.pid(), "started external tool");
                self.launch_failures.remove(&id);
                self.running.push(RunningJob {
                    id: id.clone(),
                    command: entry.command.clone(),
                    started: self.clock.now(),
                    job,
                });
                if let Err(err) = self.processed.mark_processed(&id) {
                    error!(command_id = %id, error = %err, "failed to save processed commands");
                }
                true
            }
            Err(err) => {
                let attempts = self.launch_failures.entry(id.clone()).or_insert(0);
                *attempts += 1;
                if err.kind() == std::io::ErrorKind::NotFound {
                    error!(
                        command_id = %id,
                        attempts = *attempts,
                        error = %err,
                        "tool or working directory not found, make sure the tool is installed and on PATH"
                    );
                } else {
                    error!(command_id = %id, attempts = *attempts, error = %err, "failed to launch command");
                }
                false
            }
        }
    }

    /// Drop every job whose process has exited, returning their exits.
    fn reap(&mut self) -> Result<Vec<(CommandId, JobExit)>> {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < self.running.len() {
            let running = &mut self.running[index];
            let exit = running
                .job
                .try_wait()
                .with_context(|| format!("checking status of command {}", running.id))?;
            match exit {
                Some(exit) => {
                    let done = self.running.remove(index);
                    log_exit(&done.id, self.clock.now() - done.started, &exit);
                    finished.push((done.id, exit));
                }
                None => index += 1,
            }
        }
        Ok(finished)
    }

    fn sleep_until_next_poll(&self, stop: &AtomicBool) {
        let deadline = self.deadline_after(self.poll_interval);
        while !stop.load(Ordering::SeqCst) {
            let now = self.clock.now();
            match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => self.clock.sleep((deadline - now).min(SLEEP_SLICE)),
                None => self.clock.sleep(SLEEP_SLICE),
            }
        }
    }

    /// `None` when `duration` runs past what `Instant` can represent, which
    /// callers treat as no deadline at all.
    fn deadline_after(&self, duration: Duration) -> Option<Instant> {
        self.clock.now().checked_add(duration)
    }

    /// Wait up to the grace period for each running job, terminating the
    /// ones that outlive it.
    pub fn shutdown(&mut self) {
        for mut running in std::mem::take(&mut self.running) {
            info!(command_id = %running.id, command = %running.command, "waiting for command to complete");
            match self.wait_for_exit(&mut running.job, self.shutdown_grace) {
                Ok(Some(exit)) => {
                    log_exit(&running.id, self.clock.now() - running.started, &exit);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(command_id = %running.id, error = %err, "status check failed");
                }
            }

            warn!(command_id = %running.id, "command timed out, terminating");
            if let Err(err) = running.job.terminate() {
                warn!(command_id = %running.id, error = %err, "failed to terminate");
            }
            match self.wait_for_exit(&mut running.job, TERMINATE_WAIT) {
                Ok(Some(exit)) => {
                    log_exit(&running.id, self.clock.now() - running.started, &exit);
                }
                _ => {
                    warn!(command_id = %running.id, "command ignored termination, killing");
                    if let Err(err) = running.job.kill() {
                        error!(command_id = %running.id, error = %err, "failed to kill");
                    }
                }
            }
        }
    }

    fn wait_for_exit(&self, job: &mut L::Job, timeout: Duration) -> std::io::Result<Option<JobExit>> {
        let deadline = self.deadline_after(timeout);
        loop {
            if let Some(exit) = job.try_wait()? {
                return Ok(Some(exit));
            }
            let now = self.clock.now();
            match deadline {
                Some(deadline) if now >= deadline => return Ok(None),
                Some(deadline) => self.clock.sleep((deadline - now).min(SLEEP_SLICE)),
                None => self.clock.sleep(SLEEP_SLICE),
            }
        }
    }
}

fn log_exit(id: &CommandId, elapsed: Duration, exit: &JobExit) {
    let elapsed = humantime::format_duration(Duration::from_secs(elapsed.as_secs()));
    match exit.code {
        Some(code) => info!(command_id = %id, exit_code = code, %elapsed, "command finished"),
        None => info!(command_id = %id, %elapsed, "command finished by signal"),
    }
    if !exit.stdout.is_empty() {
        debug!(command_id = %id, stdout = %exit.stdout.trim_end(), "command output");
    }
    if !exit.success && !exit.stderr.is_empty() {
        warn!(command_id = %id, stderr = %exit.stderr.trim_end(), "command error output");
    }
}
