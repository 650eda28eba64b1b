use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[async_trait]
pub trait Task: Send {
    /// `deadline` is the instant this run was scheduled for, not when it woke up
    async fn run(&mut self, deadline: Instant) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

pub struct ExporterTask {
    task: Box<dyn Task>,
    interval: Duration,
    token: Option<CancellationToken>,
}

impl ExporterTask {
    pub fn new(task: Box<dyn Task>, interval: Duration) -> Self {
        ExporterTask {
            task,
            interval,
            token: None,
        }
    }

    /// Stops this task alone when `token` is cancelled
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

///
/// Runs each task on its own fixed interval until the runner token is cancelled.
/// The first run happens one interval after start.
///
pub struct TaskRunner {
    tasks: Vec<ExporterTask>,
    token: CancellationToken,
}

impl TaskRunner {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            tasks: Vec::default(),
            token,
        }
    }

    pub fn add_task(mut self, task: ExporterTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn number_of_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn start(self) {
        for scheduled in self.tasks {
            let token = scheduled
                .token
                .unwrap_or_else(|| self.token.child_token());
            spawn_task(scheduled.task, scheduled.interval, token);
        }
    }
}

fn spawn_task(mut task: Box<dyn Task>, period: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("({}) Stopped", task.name());
                    break;
                }
                deadline = ticker.tick() => {
                    if let Err(e) = task.run(deadline).await {
                        warn!("({}) Run failed: {:#}", task.name(), e);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct CountingTask {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for CountingTask {
        async fn run(&mut self, _deadline: Instant) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting Task"
        }
    }

    /// Takes a while on every run and keeps the deadlines it was handed
    struct SlowTask {
        deadlines: Arc<std::sync::Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Task for SlowTask {
        async fn run(&mut self, deadline: Instant) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.deadlines.lock().unwrap().push(deadline);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow Task"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_stop_on_cancel() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let runner = TaskRunner::new(token.clone()).add_task(ExporterTask::new(
            Box::new(CountingTask { runs: runs.clone() }),
            Duration::from_millis(100),
        ));
        assert_eq!(runner.number_of_tasks(), 1);
        runner.start();

        tokio::time::sleep(Duration::from_millis(350)).await;
        let before_cancel = runs.load(Ordering::SeqCst);
        assert_eq!(before_cancel, 3);

        token.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_receive_scheduled_deadlines() {
        let deadlines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let start = Instant::now();
        TaskRunner::new(token.clone())
            .add_task(ExporterTask::new(
                Box::new(SlowTask {
                    deadlines: deadlines.clone(),
                }),
                Duration::from_millis(100),
            ))
            .start();

        tokio::time::sleep(Duration::from_millis(450)).await;
        token.cancel();

        let deadlines = deadlines.lock().unwrap().clone();
        assert_eq!(deadlines.len(), 4);
        assert!(deadlines[0] >= start + Duration::from_millis(100));
        for pair in deadlines.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_token_stops_single_task() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let root = CancellationToken::new();
        let own = root.child_token();

        TaskRunner::new(root.clone())
            .add_task(
                ExporterTask::new(
                    Box::new(CountingTask { runs: first.clone() }),
                    Duration::from_millis(100),
                )
                .with_token(own.clone()),
            )
            .add_task(ExporterTask::new(
                Box::new(CountingTask { runs: second.clone() }),
                Duration::from_millis(100),
            ))
            .start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        own.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 4);
        root.cancel();
    }
}
