//! Named-task registry with health check and replace.
//!
//! The supervisor knows nothing about what its tasks do. Each task is a
//! factory producing a fresh future; whenever a running instance has
//! finished, for whatever reason, the next tick replaces it with a new one
//! under the same name. Restart is detection based, so a task that hangs
//! without finishing is never replaced: tasks bound their own waits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
pub type TaskFactory = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

#[derive(Clone)]
pub struct TaskSpec {
    name: String,
    factory: TaskFactory,
    deferred: bool,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::pin(factory()) as TaskFuture),
            deferred: false,
        }
    }

    /// Launch only after the supervisor's grace period.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn spawn(&self) -> JoinHandle<Result<(), TaskError>> {
        tokio::spawn((self.factory)())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Failed(String),
}

pub struct ManagedTask {
    spec: TaskSpec,
    handle: JoinHandle<Result<(), TaskError>>,
    state: TaskState,
    started_at: DateTime<Local>,
    restarts: u32,
}

impl ManagedTask {
    fn launch(spec: TaskSpec) -> Self {
        info!("Starting task {}", spec.name);
        let handle = spec.spawn();
        Self {
            spec,
            handle,
            state: TaskState::Running,
            started_at: Local::now(),
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// How long the current instance has been running.
    pub fn uptime(&self) -> TimeDelta {
        Local::now().signed_duration_since(self.started_at)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Collects the outcome of a finished instance without blocking.
    async fn refresh_state(&mut self) -> &TaskState {
        if self.state == TaskState::Running && self.handle.is_finished() {
            self.state = match (&mut self.handle).await {
                Ok(Ok(())) => TaskState::Done,
                Ok(Err(e)) => TaskState::Failed(e.to_string()),
                Err(e) => TaskState::Failed(e.to_string()),
            };
        }
        &self.state
    }

    fn restart(&mut self) {
        self.handle = self.spec.spawn();
        self.state = TaskState::Running;
        self.started_at = Local::now();
        self.restarts += 1;
    }

    fn abort(&self) {
        self.handle.abort();
    }
}

pub struct Supervisor {
    specs: Vec<TaskSpec>,
    tasks: Vec<ManagedTask>,
    tick: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(tick: Duration, grace: Duration) -> Self {
        Self {
            specs: Vec::new(),
            tasks: Vec::new(),
            tick,
            grace,
        }
    }

    pub fn register(&mut self, spec: TaskSpec) {
        debug!(
            "Registered task {}{}",
            spec.name,
            if spec.deferred { " (deferred)" } else { "" }
        );
        self.specs.push(spec);
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    pub fn tasks(&self) -> &[ManagedTask] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&ManagedTask> {
        self.tasks.iter().find(|task| task.name() == name)
    }

    /// Launches the registered tasks of one kind.
    pub fn launch(&mut self, deferred: bool) -> usize {
        let mut launched = 0;
        for spec in self.specs.iter().filter(|spec| spec.deferred == deferred) {
            self.tasks.push(ManagedTask::launch(spec.clone()));
            launched += 1;
        }
        launched
    }

    /// One health check: replaces every finished task. Returns the names
    /// and final states of the replaced instances.
    pub async fn check(&mut self) -> Vec<(String, TaskState)> {
        let mut replaced = Vec::new();
        for task in self.tasks.iter_mut() {
            let state = task.refresh_state().await.clone();
            let ran = task.uptime().num_seconds();
            match &state {
                TaskState::Running => continue,
                TaskState::Done => {
                    warn!("Task {} finished after {}s, restarting", task.name(), ran)
                }
                TaskState::Failed(reason) => error!(
                    "Task {} failed after {}s: {}, restarting",
                    task.name(),
                    ran,
                    reason
                ),
            }
            task.restart();
            replaced.push((task.name().to_string(), state));
        }
        replaced
    }

    /// Runs until `shutdown` is cancelled, then aborts every task.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.launch(false);

        tokio::select! {
            _ = shutdown.cancelled() => {
                self.abort_all();
                return;
            }
            _ = tokio::time::sleep(self.grace) => {}
        }
        self.launch(true);

        let mut ticker = tokio::time::interval(self.tick);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        self.abort_all();
    }

    fn abort_all(&self) {
        info!("Stopping {} tasks", self.tasks.len());
        for task in &self.tasks {
            task.abort();
        }
    }
}
