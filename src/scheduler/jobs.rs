use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::schedule::CronSchedule;
use crate::store::{timestamp, JsonFile, Record, Records};

/// Job id that summarizes open tasks instead of running the agent.
pub const HEARTBEAT_JOB_ID: &str = "heartbeat";

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    /// Unknown keys, plus timestamp values that did not parse.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<NaiveDateTime>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run: Option<NaiveDateTime>,
}

impl Record for CronJob {
    const TIMESTAMPS: &'static [&'static str] = &["created", "last_run"];

    fn extra_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

/// A job whose watermark has been committed and which is ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueJob {
    pub id: String,
    pub prompt: String,
}

/// A job that was skipped because its schedule does not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidJob {
    pub id: String,
    pub schedule: String,
    pub reason: String,
}

/// Decides whether a job fires at this poll tick.
///
/// `P` is the latest firing at or before `now`. The job is due when its
/// watermark is older than `P` and either `P` is inside the grace window, or
/// the schedule is a plain daily one and `P` fell earlier today. Other
/// schedules that missed the grace window wait for their next firing.
pub fn is_due(
    schedule: &CronSchedule,
    last_run: Option<NaiveDateTime>,
    now: NaiveDateTime,
    grace: Duration,
) -> bool {
    let Some(prev) = schedule.latest_at_or_before(now) else {
        return false;
    };
    if last_run.is_some_and(|last| last >= prev) {
        return false;
    }
    if prev >= now - grace {
        return true;
    }
    schedule.is_daily() && prev.date() == now.date()
}

/// Finds due jobs and stamps their watermark with `now`, in place.
/// Returns the due jobs and the jobs whose schedules failed to parse.
pub fn mark_due_jobs(
    jobs: &mut [CronJob],
    now: NaiveDateTime,
    grace: Duration,
) -> (Vec<DueJob>, Vec<InvalidJob>) {
    let mut due = Vec::new();
    let mut invalid = Vec::new();

    for job in jobs.iter_mut() {
        if !job.enabled || job.schedule.trim().is_empty() || job.prompt.trim().is_empty() {
            continue;
        }
        let schedule = match CronSchedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                invalid.push(InvalidJob {
                    id: job.id.clone(),
                    schedule: job.schedule.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !is_due(&schedule, job.last_run, now, grace) {
            continue;
        }
        job.last_run = Some(now);
        due.push(DueJob {
            id: job.id.clone(),
            prompt: job.prompt.clone(),
        });
    }

    (due, invalid)
}

/// CRUD over `cron.json`.
#[derive(Debug, Clone)]
pub struct CronJobs {
    file: JsonFile<Records<CronJob>>,
}

impl CronJobs {
    pub fn new(file: JsonFile<Records<CronJob>>) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &JsonFile<Records<CronJob>> {
        &self.file
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.file.load().into_vec()
    }

    pub fn add(&self, schedule: &str, prompt: &str) -> Result<CronJob> {
        let parsed = CronSchedule::parse(schedule)?;
        if prompt.trim().is_empty() {
            return Err(anyhow!("Cron job prompt must not be empty"));
        }
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            schedule: parsed.expr().to_string(),
            prompt: prompt.to_string(),
            enabled: true,
            created: Some(timestamp::now()),
            last_run: None,
            extra: Map::new(),
        };
        let stored = job.clone();
        self.file.update(move |jobs| jobs.push(stored))?;
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let removed = self.file.update_if_changed(|jobs| {
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            let removed = jobs.len() != before;
            (removed, removed)
        })?;
        if !removed {
            return Err(anyhow!("Cron job not found: {}", id));
        }
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.modify(id, |job| job.enabled = enabled)
    }

    pub fn update(&self, id: &str, schedule: Option<&str>, prompt: Option<&str>) -> Result<()> {
        let schedule = match schedule.filter(|s| !s.trim().is_empty()) {
            Some(s) => Some(CronSchedule::parse(s)?.expr().to_string()),
            None => None,
        };
        self.modify(id, |job| {
            if let Some(schedule) = schedule {
                job.schedule = schedule;
            }
            if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                job.prompt = prompt.to_string();
            }
        })
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut CronJob)) -> Result<()> {
        let found = self.file.update_if_changed(|jobs| match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                f(job);
                (true, true)
            }
            None => (false, false),
        })?;
        if !found {
            return Err(anyhow!("Cron job not found: {}", id));
        }
        Ok(())
    }
}
