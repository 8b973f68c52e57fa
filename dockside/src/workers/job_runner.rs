//! Interval job runner
//!
//! Every registered job runs in its own task: run the body, sleep the
//! interval, repeat. Pause, resume and stop are flags checked at the top of
//! each iteration, so a body already running is never interrupted.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info};

/// Delay between two checks of a paused job
pub const PAUSE_BACKOFF: Duration = Duration::from_secs(1);

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle event of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { name: String },
    Finished { name: String, duration: Duration },
    Stopped { name: String },
}

struct Job {
    name: String,
    interval: Duration,
    body: JobFn,
    paused: AtomicBool,
    stopped: AtomicBool,
    total_runs: AtomicU64,
    last_run_micros: AtomicU64,
    wake: Notify,
}

/// Control handle of a registered job
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn interval(&self) -> Duration {
        self.job.interval
    }

    pub fn pause(&self) {
        self.job.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.job.paused.store(false, Ordering::SeqCst);
    }

    /// Stop the job for good. A paused job is released so it can exit.
    pub fn stop(&self) {
        self.job.stopped.store(true, Ordering::SeqCst);
        self.job.paused.store(false, Ordering::SeqCst);
        self.job.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.job.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.job.stopped.load(Ordering::SeqCst)
    }

    pub fn total_runs(&self) -> u64 {
        self.job.total_runs.load(Ordering::SeqCst)
    }

    pub fn last_run_duration(&self) -> Duration {
        Duration::from_micros(self.job.last_run_micros.load(Ordering::SeqCst))
    }
}

/// Runs named jobs on fixed intervals
pub struct IntervalJobRunner {
    jobs: Mutex<Vec<Arc<Job>>>,
    events: broadcast::Sender<JobEvent>,
    pause_backoff: Duration,
}

impl Default for IntervalJobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalJobRunner {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            jobs: Mutex::new(Vec::new()),
            events,
            pause_backoff: PAUSE_BACKOFF,
        }
    }

    pub fn with_pause_backoff(mut self, backoff: Duration) -> Self {
        self.pause_backoff = backoff;
        self
    }

    /// Register a job. Names are not checked for uniqueness.
    pub fn add<F, Fut>(&self, name: impl Into<String>, interval: Duration, body: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Arc::new(Job {
            name: name.into(),
            interval,
            body: Arc::new(move || body().boxed()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            total_runs: AtomicU64::new(0),
            last_run_micros: AtomicU64::new(0),
            wake: Notify::new(),
        });
        debug!("Registered job {} every {:?}", job.name, interval);
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        JobHandle { job }
    }

    /// Last job registered under `name`
    pub fn get_job(&self, name: &str) -> Option<JobHandle> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter()
            .rev()
            .find(|job| job.name == name)
            .map(|job| JobHandle { job: job.clone() })
    }

    pub fn jobs(&self) -> Vec<JobHandle> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter().map(|job| JobHandle { job: job.clone() }).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop every registered job
    pub fn stop_all(&self) {
        for job in self.jobs() {
            job.stop();
        }
    }

    /// Run every registered job until all of them are stopped
    pub async fn start(&self) {
        let jobs: Vec<Arc<Job>> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        info!("Starting {} job(s)", jobs.len());

        let handles = jobs.into_iter().map(|job| {
            let events = self.events.clone();
            let backoff = self.pause_backoff;
            tokio::spawn(job_loop(job, events, backoff))
        });

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Job task failed: {}", e);
            }
        }
        info!("All jobs stopped");
    }
}

fn emit(events: &broadcast::Sender<JobEvent>, event: JobEvent) {
    debug!("Job event: {:?}", event);
    // no subscribers is fine
    let _ = events.send(event);
}

async fn job_loop(job: Arc<Job>, events: broadcast::Sender<JobEvent>, backoff: Duration) {
    loop {
        if job.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(backoff).await;
            continue;
        }
        if job.stopped.load(Ordering::SeqCst) {
            info!("Job {} stopped", job.name);
            emit(&events, JobEvent::Stopped { name: job.name.clone() });
            return;
        }

        let started = Instant::now();
        emit(&events, JobEvent::Started { name: job.name.clone() });
        (job.body)().await;
        job.total_runs.fetch_add(1, Ordering::SeqCst);
        let duration = started.elapsed();
        emit(
            &events,
            JobEvent::Finished {
                name: job.name.clone(),
                duration,
            },
        );
        job.last_run_micros
            .store(duration.as_micros() as u64, Ordering::SeqCst);

        tokio::select! {
            _ = tokio::time::sleep(job.interval) => {}
            _ = job.wake.notified() => {}
        }
    }
}
