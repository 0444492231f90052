//! Calendar scheduling of recurring backup jobs.
//!
//! A [Scheduler] fires jobs at 04:00 local time of its zone, following the
//! [Periodicity] of each job. Every invocation is isolated: a failing or
//! panicking run is logged and the job keeps its schedule. A tick arriving
//! while the previous run of the same job is still in flight is skipped.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod periodicity;

pub use periodicity::{Periodicity, UnknownPeriodicity, FIRE_HOUR};

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// [Clock] reading the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lifecycle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the next firing.
    Scheduled,
    /// A run is in flight.
    Running,
    /// Cancelled through [JobHandle::stop].
    Stopped,
}

#[derive(Debug)]
pub struct Scheduler<C = SystemClock> {
    tz: Tz,
    clock: Arc<C>,
}

impl Scheduler<SystemClock> {
    pub fn new(tz: Tz) -> Self {
        Self::with_clock(tz, SystemClock)
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(tz: Tz, clock: C) -> Self {
        Self {
            tz,
            clock: Arc::new(clock),
        }
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// Registers `job` to run at every firing of `periodicity`.
    ///
    /// The job is scheduled immediately. It keeps firing until the returned
    /// [JobHandle] is stopped.
    pub fn schedule<F, Fut, E>(
        &self,
        name: impl Into<String>,
        periodicity: Periodicity,
        job: F,
    ) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(false));

        let ticker = Ticker {
            name: name.clone(),
            periodicity,
            tz: self.tz,
            clock: Arc::clone(&self.clock),
            running: Arc::clone(&running),
        };
        let task = tokio::spawn(ticker.run(job, stop_rx));

        log::info!(target: "scheduler", "Scheduled {periodicity} job `{name}` ({})", self.tz);

        JobHandle {
            name,
            stop_tx,
            running,
            task,
        }
    }
}

/// Handle to a scheduled job.
///
/// Dropping the handle leaves the job running.
#[derive(Debug)]
pub struct JobHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        if self.task.is_finished() || *self.stop_tx.borrow() {
            JobState::Stopped
        } else if self.running.load(Ordering::SeqCst) {
            JobState::Running
        } else {
            JobState::Scheduled
        }
    }

    /// Cancels all future firings and waits for an in-flight run to end.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!(target: "scheduler", "Job `{}` did not shut down cleanly: {e}", self.name);
        }
        log::info!(target: "scheduler", "Stopped job `{}`", self.name);
    }
}

struct Ticker<C> {
    name: String,
    periodicity: Periodicity,
    tz: Tz,
    clock: Arc<C>,
    running: Arc<AtomicBool>,
}

impl<C: Clock> Ticker<C> {
    async fn run<F, Fut, E>(self, job: F, mut stop_rx: watch::Receiver<bool>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut last_fire: Option<DateTime<Tz>> = None;
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            let now = self.clock.now().with_timezone(&self.tz);
            // never fire twice for the same period when woken slightly early
            let from = match last_fire {
                Some(last) if last >= now => last,
                _ => now,
            };
            let next = self.periodicity.next_fire(&from);
            let wait = (next - now).to_std().unwrap_or_default();
            log::debug!(target: "scheduler", "Job `{}` fires next at {next}", self.name);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stopped(&mut stop_rx) => break,
            }
            last_fire = Some(next);

            if self.running.swap(true, Ordering::SeqCst) {
                log::warn!(
                    target: "scheduler",
                    "Skipping {} run of `{}` at {next}: previous run still in progress",
                    self.periodicity,
                    self.name
                );
                continue;
            }

            in_flight = Some(self.fire(job()));
        }

        if let Some(run) = in_flight {
            if !run.is_finished() {
                log::info!(target: "scheduler", "Waiting for in-flight run of `{}`", self.name);
            }
            let _ = run.await;
        }
    }

    fn fire<Fut, E>(&self, run: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let guard = RunningGuard(Arc::clone(&self.running));
        let name = self.name.clone();
        let periodicity = self.periodicity;
        log::info!(target: "scheduler", "Running {periodicity} job `{name}`");

        tokio::spawn(async move {
            let _guard = guard;
            match tokio::spawn(run).await {
                Ok(Ok(())) => {
                    log::info!(target: "scheduler", "Finished {periodicity} job `{name}`")
                }
                Ok(Err(e)) => {
                    log::error!(target: "scheduler", "Error executing {periodicity} cron job `{name}`: {e}")
                }
                Err(e) => {
                    log::error!(target: "scheduler", "The {periodicity} cron job `{name}` panicked: {e}")
                }
            }
        })
    }
}

/// Resolves once a stop is requested.
///
/// A dropped [JobHandle] closes the channel, the job then runs forever.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let closed = stop_rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Clears the running flag of a job once its run ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
