pub mod heartbeat;
pub mod jobs;
pub mod recurrence;
pub mod reminders;
pub mod schedule;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentRunner, NoopObserver};
use crate::config::SchedulerConfig;
use crate::notify::MessageSender;
use crate::store::timestamp;
use crate::workspace::Workspace;
use jobs::{mark_due_jobs, DueJob, InvalidJob, HEARTBEAT_JOB_ID};
use reminders::{collect_due_reminders, stamp_sent};

/// Executes a scheduled prompt and returns the text to deliver.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, prompt: &str, working_dir: &Path) -> Result<String>;
}

#[async_trait]
impl JobRunner for AgentRunner {
    async fn run_job(&self, prompt: &str, working_dir: &Path) -> Result<String> {
        let reply = self
            .run(prompt, None, working_dir, self.config().timeout(), &NoopObserver)
            .await?;
        Ok(reply.answer)
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: Vec<String>,
    pub invalid: Vec<String>,
    pub reminders_sent: usize,
    pub reminders_failed: usize,
    pub logs_removed: usize,
}

/// Everything a job needs once it has left the driver.
#[derive(Clone)]
struct JobContext {
    workspace: Workspace,
    runner: Arc<dyn JobRunner>,
    sender: Arc<dyn MessageSender>,
    soon_hours: i64,
}

impl JobContext {
    async fn execute(&self, job: DueJob) {
        if job.id == HEARTBEAT_JOB_ID {
            if let Err(e) = self.heartbeat().await {
                warn!("Heartbeat failed: {:#}", e);
                self.workspace.log_line(&format!("Heartbeat failed: {:#}", e));
            }
            return;
        }

        let result = async {
            let answer = self.runner.run_job(&job.prompt, self.workspace.path()).await?;
            self.sender.send(&answer, None).await
        }
        .await;
        match result {
            Ok(()) => info!(job = %job.id, "Cron job delivered"),
            Err(e) => {
                warn!(job = %job.id, "Cron job failed: {:#}", e);
                self.workspace
                    .log_line(&format!("Cron job failed ({}): {:#}", job.id, e));
            }
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        let tasks = self.workspace.tasks().file().read_async(|tasks| tasks.clone()).await?;
        match heartbeat::summarize(&tasks, timestamp::now(), self.soon_hours) {
            Some(summary) => self.sender.send(&summary, None).await,
            None => {
                self.workspace.log_line("Heartbeat: nothing to report");
                Ok(())
            }
        }
    }
}

/// Poll-driven scheduler for cron jobs, task reminders and log retention.
pub struct Scheduler {
    ctx: JobContext,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        workspace: Workspace,
        runner: Arc<dyn JobRunner>,
        sender: Arc<dyn MessageSender>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx: JobContext {
                workspace,
                runner,
                sender,
                soon_hours: config.soon_hours(),
            },
            permits: Arc::new(Semaphore::new(config.worker_count())),
            config,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Finds due jobs and commits their watermarks in one locked update of
    /// the job store. Jobs are only handed out after the commit.
    pub async fn commit_due_jobs(
        &self,
        now: NaiveDateTime,
    ) -> Result<(Vec<DueJob>, Vec<InvalidJob>)> {
        let grace = self.config.grace_window();
        let (due, invalid) = self
            .ctx
            .workspace
            .cron_jobs()
            .file()
            .update_if_changed_async(move |jobs| {
                let (due, invalid) = mark_due_jobs(jobs, now, grace);
                let changed = !due.is_empty();
                ((due, invalid), changed)
            })
            .await?;

        for job in &invalid {
            warn!(job = %job.id, schedule = %job.schedule, "Invalid cron schedule: {}", job.reason);
            self.ctx.workspace.log_line(&format!(
                "Invalid cron schedule ({}): {} ({})",
                job.id, job.schedule, job.reason
            ));
        }
        Ok((due, invalid))
    }

    /// Queues jobs on the worker pool without waiting for them.
    pub async fn dispatch(&self, jobs: Vec<DueJob>) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(done) = in_flight.try_join_next() {
            if let Err(e) = done {
                error!("Cron worker panicked: {}", e);
            }
        }
        for job in jobs {
            self.ctx
                .workspace
                .log_line(&format!("Scheduling cron job {}", job.id));
            info!(job = %job.id, "Scheduling cron job");
            let ctx = self.ctx.clone();
            let permits = self.permits.clone();
            in_flight.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                ctx.execute(job).await;
            });
        }
    }

    /// Waits for every dispatched job to finish.
    pub async fn drain(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!("Cron worker panicked: {}", e);
            }
        }
    }

    /// Sends due reminders independently, then stamps the ones that went out
    /// in a single update. Returns (sent, failed).
    pub async fn run_reminders(&self, now: NaiveDateTime) -> Result<(usize, usize)> {
        let file = self.ctx.workspace.tasks().file().clone();
        let due = file
            .read_async(move |tasks| collect_due_reminders(tasks, now))
            .await?;
        if due.is_empty() {
            return Ok((0, 0));
        }

        let outcomes = join_all(
            due.iter()
                .map(|reminder| self.ctx.sender.send(&reminder.message, None)),
        )
        .await;

        let mut sent_ids = Vec::new();
        let mut sent = 0;
        let mut failed = 0;
        for (reminder, outcome) in due.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    sent += 1;
                    sent_ids.push(reminder.task_id);
                }
                Err(e) => {
                    failed += 1;
                    warn!(task = %reminder.task_id, "Reminder failed: {:#}", e);
                    self.ctx
                        .workspace
                        .log_line(&format!("Reminder failed: {:#}", e));
                }
            }
        }

        if !sent_ids.is_empty() {
            file.update_if_changed_async(move |tasks| ((), stamp_sent(tasks, &sent_ids, now)))
                .await?;
        }
        Ok((sent, failed))
    }

    /// One full cycle: cron jobs, reminders, log retention.
    pub async fn run_once(&self, now: NaiveDateTime) -> Result<CycleReport> {
        let (due, invalid) = self.commit_due_jobs(now).await?;
        let mut report = CycleReport {
            dispatched: due.iter().map(|j| j.id.clone()).collect(),
            invalid: invalid.into_iter().map(|j| j.id).collect(),
            ..CycleReport::default()
        };
        self.dispatch(due).await;

        let (sent, failed) = self.run_reminders(now).await?;
        report.reminders_sent = sent;
        report.reminders_failed = failed;

        report.logs_removed = self
            .ctx
            .workspace
            .cleanup_logs(self.config.log_retention_days, now.date());
        Ok(report)
    }

    /// Polls until `shutdown` fires, then waits for running jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll = ?self.config.poll_interval(),
            workers = self.config.worker_count(),
            "Scheduler started"
        );
        self.ctx.workspace.log_line("Scheduler started");

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_once(timestamp::now()).await {
                error!("Scheduler cycle failed: {:#}", e);
                self.ctx
                    .workspace
                    .log_line(&format!("Scheduler error: {:#}", e));
            }
        }

        self.drain().await;
        info!("Scheduler stopped");
    }
}
