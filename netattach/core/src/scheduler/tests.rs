use super::*;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Reports(Mutex<Vec<String>>);

impl ErrorSink for Reports {
    fn report(&self, error: Error) {
        self.0.lock().push(error.kind().to_string());
    }
}

struct Runner {
    trigger: Trigger,
    metrics: Metrics,
    runs: Arc<Mutex<Vec<Duration>>>,
    reports: Arc<Reports>,
    signal: drain::Signal,
    task: JoinHandle<()>,
}

fn params(min: u64, max: u64, burst: u32) -> Params {
    Params {
        min_period: Duration::from_secs(min),
        max_period: Duration::from_secs(max),
        burst: NonZeroU32::new(burst).unwrap(),
    }
}

/// Spawns a runner whose work records the time of each run, relative to the runner's start.
fn spawn(params: Params) -> Runner {
    spawn_with(params, |_| Ok(()))
}

fn spawn_with(
    params: Params,
    mut result: impl FnMut(usize) -> anyhow::Result<()> + Send + 'static,
) -> Runner {
    let metrics = Metrics::default();
    let runner = BoundedFrequency::new("test-runner", params, metrics.clone()).unwrap();
    let trigger = runner.trigger();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let reports = Arc::new(Reports::default());
    let (signal, shutdown) = drain::channel();

    let start = Instant::now();
    let task = tokio::spawn({
        let runs = runs.clone();
        let reports = reports.clone();
        runner.run(
            move || {
                let res = {
                    let mut runs = runs.lock();
                    runs.push(Instant::now() - start);
                    result(runs.len())
                };
                async move { res }
            },
            reports,
            shutdown,
        )
    });

    Runner {
        trigger,
        metrics,
        runs,
        reports,
        signal,
        task,
    }
}

fn secs(ss: &[u64]) -> Vec<Duration> {
    ss.iter().copied().map(Duration::from_secs).collect()
}

async fn sleep_until(runner_start: Instant, secs: u64) {
    time::sleep_until(runner_start + Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn coalesces_requests_within_min_period() {
    let start = Instant::now();
    let runner = spawn(params(5, 10, 2));

    runner.trigger.request_run();
    for t in 1..=3 {
        sleep_until(start, t).await;
        runner.trigger.request_run();
    }

    sleep_until(start, 12).await;
    assert_eq!(*runner.runs.lock(), secs(&[0, 5]));
    assert_eq!(runner.metrics.requests(), 4);
    assert_eq!(runner.metrics.runs(), 2);
}

#[tokio::test(start_paused = true)]
async fn runs_at_max_period_without_requests() {
    let start = Instant::now();
    let runner = spawn(params(5, 10, 2));

    sleep_until(start, 9).await;
    assert!(runner.runs.lock().is_empty());

    sleep_until(start, 15).await;
    assert_eq!(*runner.runs.lock(), secs(&[10]));

    sleep_until(start, 25).await;
    assert_eq!(*runner.runs.lock(), secs(&[10, 20]));
}

#[tokio::test(start_paused = true)]
async fn max_period_is_measured_from_the_last_run() {
    let start = Instant::now();
    let runner = spawn(params(5, 10, 1));

    sleep_until(start, 7).await;
    runner.trigger.request_run();

    sleep_until(start, 16).await;
    assert_eq!(*runner.runs.lock(), secs(&[7]));

    sleep_until(start, 18).await;
    assert_eq!(*runner.runs.lock(), secs(&[7, 17]));
}

#[tokio::test(start_paused = true)]
async fn spaces_frequent_requests_by_min_period() {
    let start = Instant::now();
    let runner = spawn(params(5, 100, 1));

    let mut requests = 0;
    while Instant::now() < start + Duration::from_secs(30) {
        runner.trigger.request_run();
        requests += 1;
        time::sleep(Duration::from_millis(500)).await;
    }

    // The last request is still pending.
    sleep_until(start, 31).await;
    let runs = runner.runs.lock().clone();
    assert!(runs.len() < requests, "{} runs for {requests} requests", runs.len());
    assert_eq!(runs, secs(&[0, 5, 10, 15, 20, 25, 30]));
    for pair in runs.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(5));
    }
}

#[tokio::test(start_paused = true)]
async fn bursts_after_idle() {
    let start = Instant::now();
    let runner = spawn(params(5, 60, 3));

    // Let the bucket fill.
    sleep_until(start, 20).await;
    for _ in 0..4 {
        runner.trigger.request_run();
        time::sleep(Duration::from_millis(1)).await;
    }

    sleep_until(start, 24).await;
    let burst = runner.runs.lock().clone();
    assert_eq!(burst.len(), 3, "{burst:?}");
    assert!(burst.iter().all(|t| *t < Duration::from_millis(20_010)));

    // The request beyond the burst waits for a full period.
    sleep_until(start, 26).await;
    assert_eq!(runner.runs.lock().len(), 4);
    assert_eq!(runner.runs.lock()[3], Duration::from_secs(25));
}

#[tokio::test(start_paused = true)]
async fn does_not_burst_at_startup() {
    let start = Instant::now();
    let runner = spawn(params(5, 60, 3));

    runner.trigger.request_run();
    time::sleep(Duration::from_millis(1)).await;
    runner.trigger.request_run();

    sleep_until(start, 6).await;
    assert_eq!(*runner.runs.lock(), secs(&[0, 5]));
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_run_are_not_lost() {
    let start = Instant::now();
    let runner =
        BoundedFrequency::new("test-runner", params(1, 60, 1), Metrics::default()).unwrap();
    let trigger = runner.trigger();
    let (_signal, shutdown) = drain::channel();
    let runs = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn({
        let runs = runs.clone();
        runner.run(
            move || {
                runs.lock().push(Instant::now() - start);
                async {
                    time::sleep(Duration::from_secs(3)).await;
                    Ok::<_, anyhow::Error>(())
                }
            },
            Arc::new(Reports::default()),
            shutdown,
        )
    });

    trigger.request_run();
    sleep_until(start, 1).await;
    // Arrives while the first run is in progress.
    trigger.request_run();
    trigger.request_run();

    sleep_until(start, 10).await;
    assert_eq!(*runs.lock(), secs(&[0, 3]));
}

#[tokio::test(start_paused = true)]
async fn failed_runs_are_reported_and_retried_on_schedule() {
    let start = Instant::now();
    let runner = spawn_with(params(5, 10, 1), |n| {
        if n == 1 {
            anyhow::bail!("boom");
        }
        Ok(())
    });

    runner.trigger.request_run();
    sleep_until(start, 1).await;
    assert_eq!(*runner.reports.0.lock(), vec!["sync_failed".to_string()]);
    assert_eq!(runner.metrics.failures(), 1);

    sleep_until(start, 11).await;
    assert_eq!(*runner.runs.lock(), secs(&[0, 10]));
    assert_eq!(runner.reports.0.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_an_inflight_run() {
    let start = Instant::now();
    let runner =
        BoundedFrequency::new("test-runner", params(1, 60, 1), Metrics::default()).unwrap();
    let trigger = runner.trigger();
    let (signal, shutdown) = drain::channel();
    let completed = Arc::new(Mutex::new(false));

    let task = tokio::spawn({
        let completed = completed.clone();
        runner.run(
            move || {
                let completed = completed.clone();
                async move {
                    time::sleep(Duration::from_secs(100)).await;
                    *completed.lock() = true;
                    Ok::<_, anyhow::Error>(())
                }
            },
            Arc::new(Reports::default()),
            shutdown,
        )
    });

    trigger.request_run();
    sleep_until(start, 1).await;
    signal.drain().await;
    task.await.unwrap();
    assert!(!*completed.lock());
    assert!(Instant::now() < start + Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_runner() {
    let runner = spawn(params(5, 10, 1));
    runner.signal.drain().await;
    runner.task.await.unwrap();
    assert!(runner.runs.lock().is_empty());
    assert!(runner.reports.0.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_coalesce_into_one_run() {
    let runner = spawn(Params {
        min_period: Duration::from_secs(1),
        max_period: Duration::from_secs(60),
        burst: NonZeroU32::new(1).unwrap(),
    });

    runner.trigger.request_run();
    while runner.runs.lock().is_empty() {
        time::sleep(Duration::from_millis(5)).await;
    }

    // The bucket is empty, so these all wait on the same deferred run.
    let callers = (0..8)
        .map(|_| {
            let trigger = runner.trigger.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    trigger.request_run();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect::<Vec<_>>();
    for caller in callers {
        caller.await.unwrap();
    }
    assert_eq!(runner.runs.lock().len(), 1);
    assert_eq!(runner.metrics.requests(), 801);

    time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(runner.runs.lock().len(), 2);
    assert_eq!(runner.metrics.runs(), 2);
}

#[test]
fn rejects_invalid_params() {
    assert_eq!(params(0, 0, 1).validate(), Err(InvalidParams::ZeroMaxPeriod));
    assert_eq!(
        params(10, 5, 1).validate(),
        Err(InvalidParams::MinExceedsMax {
            min: Duration::from_secs(10),
            max: Duration::from_secs(5),
        })
    );
    assert_eq!(params(0, 5, 1).validate(), Ok(()));
}

#[test]
fn rejects_periods_that_overflow() {
    assert_eq!(
        params(1, 20_000_000_000, 1).validate(),
        Err(InvalidParams::MaxOutOfRange(Duration::from_secs(20_000_000_000)))
    );

    let huge = params(10_000_000_000, 10_000_000_000, 4_000_000_000);
    assert_eq!(
        huge.validate(),
        Err(InvalidParams::BurstOutOfRange {
            min: Duration::from_secs(10_000_000_000),
            burst: huge.burst,
        })
    );
    assert!(BoundedFrequency::new("test-runner", huge, Metrics::default()).is_err());
}

#[tokio::test(start_paused = true)]
async fn zero_min_period_does_not_space_runs() {
    let start = Instant::now();
    let runner = spawn(params(0, 60, 1));

    for _ in 0..3 {
        runner.trigger.request_run();
        time::sleep(Duration::from_millis(1)).await;
    }

    sleep_until(start, 1).await;
    assert_eq!(runner.runs.lock().len(), 3);
}
