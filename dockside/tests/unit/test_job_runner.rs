//! Interval job runner tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use dockside::workers::job_runner::{IntervalJobRunner, JobEvent, JobHandle};

fn counting_job(
    runner: &IntervalJobRunner,
    name: &str,
    interval: Duration,
) -> (Arc<AtomicUsize>, JobHandle) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = {
        let count = count.clone();
        runner.add(name, interval, move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    (count, handle)
}

fn drain(events: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_job_runs_until_stopped() {
    let runner = Arc::new(IntervalJobRunner::new());
    let (count, job) = counting_job(&runner, "tick", Duration::from_millis(20));
    let mut events = runner.subscribe();

    let running = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    job.stop();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();

    let runs = count.load(Ordering::SeqCst);
    assert!(runs >= 2, "only {runs} runs");
    assert_eq!(job.total_runs() as usize, runs);

    let events = drain(&mut events);
    let started = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Started { .. }))
        .count();
    let finished = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Finished { .. }))
        .count();
    let stopped = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Stopped { name } if name == "tick"))
        .count();
    assert_eq!(started, runs);
    assert_eq!(finished, runs);
    assert_eq!(stopped, 1);
    assert_eq!(events.last(), Some(&JobEvent::Stopped { name: "tick".to_string() }));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let runner = Arc::new(IntervalJobRunner::new().with_pause_backoff(Duration::from_millis(10)));
    let (count, job) = counting_job(&runner, "tick", Duration::from_millis(10));
    let running = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    job.pause();
    assert!(job.is_paused());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let paused_at = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), paused_at);

    job.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(count.load(Ordering::SeqCst) > paused_at);

    runner.stop_all();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stop_releases_paused_job() {
    let runner = Arc::new(IntervalJobRunner::new().with_pause_backoff(Duration::from_millis(10)));
    let (_count, job) = counting_job(&runner, "paused", Duration::from_millis(10));
    job.pause();
    let mut events = runner.subscribe();

    let running = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    job.stop();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.total_runs(), 0);
    assert_eq!(
        drain(&mut events),
        vec![JobEvent::Stopped { name: "paused".to_string() }]
    );
}

#[tokio::test]
async fn test_stop_interrupts_long_interval() {
    let runner = Arc::new(IntervalJobRunner::new());
    let (count, _job) = counting_job(&runner, "slow", Duration::from_secs(3600));
    let running = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.stop_all();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_jobs_run_independently() {
    let runner = Arc::new(IntervalJobRunner::new());
    let (fast, fast_job) = counting_job(&runner, "fast", Duration::from_millis(10));
    let (slow, _slow_job) = counting_job(&runner, "slow", Duration::from_secs(3600));
    let running = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fast.load(Ordering::SeqCst) > 2);
    assert_eq!(slow.load(Ordering::SeqCst), 1);

    // one stopped job leaves the other running
    fast_job.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());

    runner.stop_all();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runner.jobs().len(), 2);
}
