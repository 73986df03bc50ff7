use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use workheap::{
    Call, CallTable, Callable, Config, FailurePolicy, InLoopWorker, ListConsumer, LoadMonitor,
    Output, ProcessWorker, Series, Status, TaskError, TaskOutput, TaskRef, TaskScheduler,
    TaskSpec, ThreadWorker, Worker, WorkerServer,
};

const GUARD: Duration = Duration::from_secs(5);

fn square() -> Callable {
    Callable::new("square", |a, _| {
        let x = a[0].as_i64().unwrap_or_default();
        Ok(Output::value(x * x))
    })
}

fn count() -> Callable {
    Callable::new("count", |a, _| {
        let n = a[0].as_i64().unwrap_or_default();
        Ok(Output::sequence((1..=n).map(Value::from)))
    })
}

fn boom() -> Callable {
    Callable::new("fail", |_, _| Err(anyhow::anyhow!("boom")))
}

fn scheduler(cfg: Config, workers: Vec<Arc<dyn Worker>>) -> TaskScheduler {
    workers
        .into_iter()
        .fold(TaskScheduler::builder(cfg), |b, w| b.with_worker(w))
        .build()
        .unwrap()
}

fn in_loop() -> Vec<Arc<dyn Worker>> {
    vec![Arc::new(InLoopWorker::new("loop"))]
}

/// Answers every call after `delay`, counting calls.
struct Slow {
    delay: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl Worker for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self, _task: TaskRef) -> Status {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Status::Value(json!("late"))
    }

    async fn stop(&self) {}

    async fn crash(&self) -> Vec<TaskRef> {
        Vec::new()
    }
}

/// Drops the first call, answers the rest.
struct Flaky {
    calls: AtomicU32,
}

#[async_trait]
impl Worker for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, _task: TaskRef) -> Status {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Status::Disconnected,
            _ => Status::Value(json!("reconnected")),
        }
    }

    async fn stop(&self) {}

    async fn crash(&self) -> Vec<TaskRef> {
        Vec::new()
    }
}

/// Replays `script` one status per call, then times out forever.
struct Scripted {
    script: Mutex<Vec<Status>>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(script: Vec<Status>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().rev().collect()),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Worker for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, _task: TaskRef) -> Status {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop().unwrap_or(Status::TimedOut)
    }

    async fn stop(&self) {}

    async fn crash(&self) -> Vec<TaskRef> {
        Vec::new()
    }
}

/// Never finishes a call nor stops until crashed.
#[derive(Default)]
struct Stuck {
    held: Mutex<Vec<TaskRef>>,
    crashed: CancellationToken,
}

#[async_trait]
impl Worker for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn run(&self, task: TaskRef) -> Status {
        self.held.lock().unwrap().push(task);
        self.crashed.cancelled().await;
        Status::Disconnected
    }

    async fn stop(&self) {
        std::future::pending::<()>().await
    }

    async fn crash(&self) -> Vec<TaskRef> {
        self.crashed.cancel();
        std::mem::take(&mut *self.held.lock().unwrap())
    }
}

#[tokio::test]
async fn square_of_five() {
    let sched = scheduler(Config::default(), in_loop());
    let out = timeout(GUARD, sched.submit(TaskSpec::new(Call::new(square()).arg(5))).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.into_value(), Some(json!(25)));
    assert!(sched.shutdown().await.is_empty());
}

#[tokio::test]
async fn generator_drains_in_order() {
    let sched = scheduler(Config::default(), in_loop());
    let out = sched
        .submit(TaskSpec::new(Call::new(count()).arg(3)))
        .unwrap()
        .await
        .unwrap();
    let mut seq = out.into_sequence().unwrap();
    assert_eq!(seq.next().await, Some(json!(1)));
    assert_eq!(seq.next().await, Some(json!(2)));
    assert_eq!(seq.next().await, Some(json!(3)));
    assert_eq!(seq.next().await, None);
    assert!(seq.is_done());
    drop(seq);
    timeout(GUARD, sched.shutdown()).await.unwrap();
}

#[tokio::test]
async fn call_error_stops_scheduler_within_grace() {
    let cfg = Config {
        stop_grace: Duration::from_millis(50),
        ..Config::default()
    };
    let sched = scheduler(cfg, in_loop());
    let out = sched.submit(TaskSpec::new(Call::new(boom()))).unwrap().await;
    assert!(matches!(out, Ok(TaskOutput::Error(ref text)) if text == "fail: boom"));

    timeout(GUARD, sched.stopped()).await.unwrap();
    assert!(!sched.is_running());
    assert!(matches!(
        sched.submit(TaskSpec::new(Call::new(square()).arg(1))),
        Err(TaskError::NotRunning)
    ));
}

#[tokio::test]
async fn warn_mode_keeps_running() {
    let cfg = Config {
        failure: FailurePolicy::Warn,
        stop_grace: Duration::from_millis(10),
        ..Config::default()
    };
    let sched = scheduler(cfg, in_loop());
    let out = sched.submit(TaskSpec::new(Call::new(boom()))).unwrap().await;
    assert!(matches!(out, Ok(TaskOutput::Error(ref text)) if text.contains("boom")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sched.is_running());
    let out = sched
        .submit(TaskSpec::new(Call::new(square()).arg(3)))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out.into_value(), Some(json!(9)));
    sched.shutdown().await;
}

#[tokio::test]
async fn return_mode_surfaces_typed_failure() {
    let cfg = Config {
        failure: FailurePolicy::Return,
        ..Config::default()
    };
    let sched = scheduler(cfg, in_loop());
    let err = sched
        .submit(TaskSpec::new(Call::new(boom())))
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TaskError::Call {
            text: "fail: boom".into()
        }
    );
    assert!(sched.is_running());
    sched.shutdown().await;
}

#[tokio::test]
async fn timeout_retries_exactly_once() {
    let slow = Arc::new(Slow {
        delay: Duration::from_millis(100),
        calls: AtomicU32::new(0),
    });
    let sched = scheduler(Config::default(), vec![slow.clone()]);
    let err = timeout(
        GUARD,
        sched
            .submit(TaskSpec::new(Call::new(square()).arg(2)).with_timeout(Duration::from_millis(20)))
            .unwrap(),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert_eq!(err, TaskError::Timeout { attempts: 2 });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    sched.shutdown().await;
}

#[tokio::test]
async fn config_timeout_applies_without_an_explicit_one() {
    let slow = Arc::new(Slow {
        delay: Duration::from_millis(100),
        calls: AtomicU32::new(0),
    });
    let cfg = Config {
        timeout: Duration::from_millis(20),
        ..Config::default()
    };
    let sched = scheduler(cfg, vec![slow.clone()]);
    let fut = sched.submit(TaskSpec::new(Call::new(square()).arg(2))).unwrap();
    let err = timeout(GUARD, fut).await.unwrap().unwrap_err();
    assert_eq!(err, TaskError::Timeout { attempts: 2 });
    sched.shutdown().await;
}

#[tokio::test]
async fn worker_timeouts_give_up_after_two_tries() {
    let worker = Arc::new(Scripted::new(Vec::new()));
    let sched = scheduler(Config::default(), vec![worker.clone()]);
    let fut = sched.submit(TaskSpec::new(Call::new(square()).arg(2))).unwrap();
    let err = timeout(GUARD, fut).await.unwrap().unwrap_err();

    assert_eq!(err, TaskError::Timeout { attempts: 2 });
    assert_eq!(err.to_string(), "timed out after 2 tries, gave up");
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    sched.shutdown().await;
}

#[tokio::test]
async fn disconnect_does_not_count_as_a_timeout() {
    let worker = Arc::new(Scripted::new(vec![Status::Disconnected]));
    let sched = scheduler(Config::default(), vec![worker.clone()]);
    let fut = sched.submit(TaskSpec::new(Call::new(square()).arg(2))).unwrap();
    let err = timeout(GUARD, fut).await.unwrap().unwrap_err();

    assert_eq!(err, TaskError::Timeout { attempts: 2 });
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    sched.shutdown().await;
}

#[tokio::test]
async fn per_task_policy_overrides_stop() {
    let cfg = Config {
        failure: FailurePolicy::Stop,
        stop_grace: Duration::from_millis(10),
        ..Config::default()
    };
    let sched = scheduler(cfg, in_loop());
    let err = sched
        .submit(TaskSpec::new(Call::new(boom())).with_failure_policy(FailurePolicy::Return))
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TaskError::Call {
            text: "fail: boom".into()
        }
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sched.is_running());
    sched.shutdown().await;
}

#[tokio::test]
async fn disconnect_is_retried() {
    let flaky = Arc::new(Flaky {
        calls: AtomicU32::new(0),
    });
    let sched = scheduler(Config::default(), vec![flaky.clone()]);
    let out = sched
        .submit(TaskSpec::new(Call::new(square()).arg(2)))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out.into_value(), Some(json!("reconnected")));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    sched.shutdown().await;
}

fn recorder(log: Arc<Mutex<Vec<String>>>) -> Callable {
    Callable::new("record", move |a, _| {
        log.lock()
            .unwrap()
            .push(a[0].as_str().unwrap_or_default().to_string());
        Ok(Output::none())
    })
}

#[tokio::test]
async fn niceness_halves_service_rate() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(Config::default(), in_loop());
    let mut pending = Vec::new();
    for _ in 0..20 {
        for (series, nice) in [("a", 0), ("b", 10)] {
            let spec = TaskSpec::new(Call::new(recorder(log.clone())).arg(series))
                .with_series(series)
                .with_niceness(nice);
            pending.push(sched.submit(spec).unwrap());
        }
    }
    for fut in pending {
        assert!(timeout(GUARD, fut).await.unwrap().unwrap().is_none());
    }

    let order = log.lock().unwrap().clone();
    let first: Vec<&String> = order.iter().take(30).collect();
    let a = first.iter().filter(|s| s.as_str() == "a").count();
    let b = first.iter().filter(|s| s.as_str() == "b").count();
    assert!(a >= 18, "series a got {a} of 30");
    assert!(b <= 12, "series b got {b} of 30");
    sched.shutdown().await;
}

#[tokio::test]
async fn series_is_fifo() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(Config::default(), in_loop());
    let pending: Vec<_> = (0..10)
        .map(|i| {
            let spec = TaskSpec::new(Call::new(recorder(log.clone())).arg(format!("t{i}")))
                .with_series("lane");
            sched.submit(spec).unwrap()
        })
        .collect();
    futures::future::join_all(pending).await;

    let want: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    assert_eq!(*log.lock().unwrap(), want);
    sched.shutdown().await;
}

#[tokio::test]
async fn rush_jumps_the_queue() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(Config::default(), Vec::new());
    let mut pending = Vec::new();
    for name in ["first", "second"] {
        pending.push(
            sched
                .submit(TaskSpec::new(Call::new(recorder(log.clone())).arg(name)))
                .unwrap(),
        );
    }
    pending.push(
        sched
            .submit(TaskSpec::new(Call::new(recorder(log.clone())).arg("last")).relax())
            .unwrap(),
    );
    pending.push(
        sched
            .submit(TaskSpec::new(Call::new(recorder(log.clone())).arg("urgent")).rush())
            .unwrap(),
    );
    sched.attach_worker(Arc::new(InLoopWorker::new("late"))).await;
    futures::future::join_all(pending).await;

    // The loop may already hold "first" while no worker is attached.
    let order = log.lock().unwrap().clone();
    assert_eq!(order.last().map(String::as_str), Some("last"));
    let urgent = order.iter().position(|s| s == "urgent").unwrap();
    let second = order.iter().position(|s| s == "second").unwrap();
    assert!(urgent < second, "{order:?}");
    sched.shutdown().await;
}

#[tokio::test]
async fn invalid_niceness_is_rejected() {
    let sched = scheduler(Config::default(), in_loop());
    let err = sched
        .submit(TaskSpec::new(Call::new(square()).arg(1)).with_niceness(21))
        .unwrap_err();
    assert_eq!(err, TaskError::InvalidNiceness { niceness: 21 });
    sched.shutdown().await;
}

#[tokio::test]
async fn process_worker_over_a_stream() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (far_r, far_w) = tokio::io::split(far);
    let server = tokio::spawn(async move {
        WorkerServer::new(CallTable::new().with(square()).with(count()))
            .serve(far_r, far_w)
            .await
    });
    let (near_r, near_w) = tokio::io::split(near);
    let cfg = Config::default();
    let worker = ProcessWorker::connect("proc", near_r, near_w, &cfg);
    let sched = scheduler(cfg, vec![Arc::new(worker)]);

    let out = sched
        .submit(TaskSpec::new(Call::new(square()).arg(12)))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out.into_value(), Some(json!(144)));

    let seq = sched
        .submit(TaskSpec::new(Call::new(count()).arg(4)))
        .unwrap()
        .await
        .unwrap()
        .into_sequence()
        .unwrap();
    assert_eq!(seq.collect().await, vec![json!(1), json!(2), json!(3), json!(4)]);

    timeout(GUARD, sched.shutdown()).await.unwrap();
    timeout(GUARD, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_worker_runs_calls() {
    let cfg = Config::default();
    let worker = ThreadWorker::spawn("t", &cfg).unwrap();
    let sched = scheduler(cfg, vec![Arc::new(worker)]);

    let out = sched
        .submit(TaskSpec::new(Call::new(square()).arg(9)))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out.into_value(), Some(json!(81)));

    let seq = sched
        .submit(TaskSpec::new(Call::new(count()).arg(2)))
        .unwrap()
        .await
        .unwrap()
        .into_sequence()
        .unwrap();
    assert_eq!(seq.collect().await, vec![json!(1), json!(2)]);
    timeout(GUARD, sched.shutdown()).await.unwrap();
}

#[tokio::test]
async fn cancel_series_fails_queued_tasks() {
    let sched = scheduler(Config::default(), Vec::new());
    let keep = sched
        .submit(TaskSpec::new(Call::new(square()).arg(4)).with_series("y"))
        .unwrap();
    let doomed: Vec<_> = (0..3)
        .map(|i| {
            sched
                .submit(TaskSpec::new(Call::new(square()).arg(i)).with_series("x"))
                .unwrap()
        })
        .collect();

    assert_eq!(sched.cancel_series(&Series::from("x")), 3);
    for fut in doomed {
        assert_eq!(fut.await.unwrap_err(), TaskError::Cancelled);
    }

    sched.attach_worker(Arc::new(InLoopWorker::new("w"))).await;
    assert_eq!(keep.await.unwrap().into_value(), Some(json!(16)));
    assert_eq!(sched.load(), 0);
    sched.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_unhandled_tasks() {
    let sched = scheduler(Config::default(), Vec::new());
    let futs: Vec<_> = (0..2)
        .map(|i| sched.submit(TaskSpec::new(Call::new(square()).arg(i))).unwrap())
        .collect();
    let unhandled = timeout(GUARD, sched.shutdown()).await.unwrap();
    assert_eq!(unhandled.len(), 2);
    for fut in futs {
        assert_eq!(fut.await.unwrap_err(), TaskError::Shutdown);
    }
    // Second call waits for the first and returns nothing.
    assert!(sched.shutdown().await.is_empty());
}

#[tokio::test]
async fn updates_replay_on_late_workers() {
    let hits = Arc::new(AtomicU32::new(0));
    let setup = {
        let hits = hits.clone();
        Callable::new("setup", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Output::value("ok"))
        })
    };
    let sched = scheduler(Config::default(), in_loop());

    let results = sched.update(Call::new(setup.clone()), false).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().as_value(), Some(&json!("ok")));

    sched.update(Call::new(setup), true).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Only the remembered update is replayed.
    sched.attach_worker(Arc::new(InLoopWorker::new("late"))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    sched.shutdown().await;
}

#[tokio::test]
async fn crashed_worker_tasks_are_reassigned() {
    let cfg = Config {
        worker_stop_timeout: Duration::from_millis(20),
        loop_shutdown_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let sched = scheduler(cfg, vec![Arc::new(Stuck::default())]);
    let stuck_id = sched.worker_ids()[0];

    let fut = sched
        .submit(TaskSpec::new(Call::new(square()).arg(6)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    sched.attach_worker(Arc::new(InLoopWorker::new("rescue"))).await;
    let orphans = sched.detach_worker(stuck_id, true).await.unwrap();
    assert_eq!(orphans.len(), 1);

    let out = timeout(GUARD, fut).await.unwrap().unwrap();
    assert_eq!(out.into_value(), Some(json!(36)));
    sched.shutdown().await;
}

#[tokio::test]
async fn crashed_worker_tasks_are_abandoned_without_reassign() {
    let cfg = Config {
        worker_stop_timeout: Duration::from_millis(20),
        loop_shutdown_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let sched = scheduler(cfg, vec![Arc::new(Stuck::default())]);
    let fut = sched
        .submit(TaskSpec::new(Call::new(square()).arg(6)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let orphans = sched.detach_worker(sched.worker_ids()[0], false).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(fut.await.unwrap_err(), TaskError::Abandoned);
    sched.shutdown().await;
}

#[tokio::test]
async fn consumer_receives_the_whole_sequence() {
    let sched = scheduler(Config::default(), in_loop());
    let sink = ListConsumer::new();
    let out = sched
        .submit(TaskSpec::new(Call::new(count()).arg(3)).with_consumer(Arc::new(sink.clone())))
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(out, TaskOutput::Done { items: 3 }));
    assert_eq!(sink.items(), vec![json!(1), json!(2), json!(3)]);
    timeout(GUARD, sched.shutdown()).await.unwrap();
}

#[tokio::test]
async fn load_monitor_follows_the_queue() {
    let monitor = LoadMonitor::new();
    let sched = TaskScheduler::builder(Config::default())
        .with_subscriber(Arc::new(monitor.clone()))
        .build()
        .unwrap();
    let mut load = monitor.watch();

    let futs: Vec<_> = (0..3)
        .map(|i| sched.submit(TaskSpec::new(Call::new(square()).arg(i))).unwrap())
        .collect();
    assert_eq!(sched.load(), 3);
    timeout(GUARD, load.wait_for(|&n| n == 3)).await.unwrap().unwrap();

    sched.attach_worker(Arc::new(InLoopWorker::new("w"))).await;
    futures::future::join_all(futs).await;
    timeout(GUARD, load.wait_for(|&n| n == 0)).await.unwrap().unwrap();
    sched.shutdown().await;
}
