use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipewright_core::node::NodeConfig;
use pipewright_core::pipeline::Pipeline;
use pipewright_core::run::{RunStatus, TriggerDescriptor};

use crate::engine::RunEngine;

struct CronJob {
    pipeline: Arc<Pipeline>,
    node_id: String,
    schedule: Schedule,
}

impl CronJob {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

/// Starts runs of armed pipelines from their `cron` trigger nodes.
///
/// Schedules are evaluated in UTC. Each firing spawns an independent run;
/// a slow run never delays the next firing.
pub struct CronScheduler {
    jobs: Vec<CronJob>,
    engine: Arc<RunEngine>,
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new(
        pipelines: &[Arc<Pipeline>],
        engine: Arc<RunEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let mut jobs = Vec::new();

        for pipeline in pipelines {
            if !pipeline.is_schedulable() {
                info!(pipeline_id = %pipeline.id, status = ?pipeline.status, enabled = pipeline.enabled, "Pipeline not armed, skipping");
                continue;
            }
            for node in &pipeline.nodes {
                let NodeConfig::Cron(trigger) = &node.config else {
                    continue;
                };
                if let Some(tz) = &trigger.timezone {
                    warn!(pipeline_id = %pipeline.id, node_id = %node.id, timezone = %tz, "Timezones are not supported, evaluating schedule in UTC");
                }
                match trigger.parse_schedule() {
                    Ok(schedule) => {
                        info!(pipeline_id = %pipeline.id, node_id = %node.id, schedule = %trigger.schedule, "Cron trigger registered");
                        jobs.push(CronJob {
                            pipeline: Arc::clone(pipeline),
                            node_id: node.id.clone(),
                            schedule,
                        });
                    }
                    Err(e) => {
                        warn!(
                            pipeline_id = %pipeline.id,
                            node_id = %node.id,
                            error = %e,
                            "Invalid cron schedule, skipping trigger"
                        );
                    }
                }
            }
        }

        Self {
            jobs,
            engine,
            cancel,
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The earliest upcoming firing after `now`: time, pipeline id, node id.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, &str, &str)> {
        self.jobs
            .iter()
            .filter_map(|job| job.next_after(now).map(|at| (at, job)))
            .min_by_key(|(at, _)| *at)
            .map(|(at, job)| (at, job.pipeline.id.as_str(), job.node_id.as_str()))
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.jobs.is_empty() {
            info!("No cron triggers armed, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.jobs.len(), "Cron scheduler started");

        loop {
            let now = Utc::now();
            let next = self
                .jobs
                .iter()
                .filter_map(|job| job.next_after(now).map(|at| (at, job)))
                .min_by_key(|(at, _)| *at);

            let Some((fire_at, job)) = next else {
                // No schedule has an upcoming time left.
                self.cancel.cancelled().await;
                break;
            };

            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));
            info!(
                pipeline_id = %job.pipeline.id,
                node_id = %job.node_id,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next cron trigger scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.fire(job),
                _ = self.cancel.cancelled() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
            }
        }
    }

    fn fire(&self, job: &CronJob) {
        info!(pipeline_id = %job.pipeline.id, node_id = %job.node_id, "Firing cron trigger");
        let trigger = TriggerDescriptor::new("cron").with_node(job.node_id.clone());
        let handle = self.engine.spawn(Arc::clone(&job.pipeline), trigger);

        let run_cancel = handle.cancellation_token();
        let shutdown = self.cancel.clone();
        let pipeline_id = job.pipeline.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                outcome = handle.wait() => match outcome {
                    Ok(report) if report.run.status == RunStatus::Success => {
                        info!(pipeline_id = %pipeline_id, run_id = %report.run.short_id(), "Scheduled run completed");
                    }
                    Ok(report) => {
                        warn!(
                            pipeline_id = %pipeline_id,
                            run_id = %report.run.short_id(),
                            status = %report.run.status,
                            error = report.run.error.as_deref().unwrap_or_default(),
                            "Scheduled run did not succeed"
                        );
                    }
                    Err(e) => error!(pipeline_id = %pipeline_id, error = %e, "Scheduled run task failed"),
                },
                _ = shutdown.cancelled() => run_cancel.cancel(),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pipewright_core::node::{CronTrigger, OutputFormat, PipelineNode};
    use pipewright_core::traits::RunLog;
    use pipewright_test_utils::fixtures::{edge, manual, output, pipeline};
    use pipewright_test_utils::MemoryRunLog;

    use crate::context::Capabilities;
    use crate::registry::ExecutorRegistry;

    fn cron(id: &str, schedule: &str) -> PipelineNode {
        PipelineNode::new(
            id,
            id,
            NodeConfig::Cron(CronTrigger {
                schedule: schedule.into(),
                timezone: None,
            }),
        )
    }

    fn engine() -> Arc<RunEngine> {
        Arc::new(RunEngine::new(
            ExecutorRegistry::with_builtins(),
            Capabilities::new(),
        ))
    }

    #[test]
    fn test_only_armed_cron_triggers_register() {
        let armed = pipeline("armed", vec![cron("tick", "0 9 * * *")], vec![]);
        let mut paused = pipeline("paused", vec![cron("tick", "0 9 * * *")], vec![]);
        paused.pause().unwrap();
        let bad = pipeline("bad", vec![cron("tick", "not a schedule")], vec![]);
        let manual_only = pipeline("manual", vec![manual("go")], vec![]);

        let pipelines: Vec<Arc<Pipeline>> = [armed, paused, bad, manual_only]
            .into_iter()
            .map(Arc::new)
            .collect();
        let scheduler = CronScheduler::new(&pipelines, engine(), CancellationToken::new());
        assert_eq!(scheduler.job_count(), 1);
    }

    #[test]
    fn test_next_fire_picks_earliest() {
        let p = pipeline(
            "digest",
            vec![cron("morning", "0 9 * * *"), cron("hourly", "0 * * * *")],
            vec![],
        );
        let scheduler = CronScheduler::new(&[Arc::new(p)], engine(), CancellationToken::new());

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        let (at, pipeline_id, node_id) = scheduler.next_fire(now).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        assert_eq!(pipeline_id, "digest");
        assert_eq!(node_id, "hourly");
    }

    #[tokio::test]
    async fn test_idle_scheduler_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let scheduler = CronScheduler::new(&[], engine(), cancel.clone());
        assert!(scheduler.next_fire(Utc::now()).is_none());
        cancel.cancel();
        scheduler.run().await;
    }

    #[tokio::test]
    async fn test_fires_run_for_cron_node() {
        let run_log = Arc::new(MemoryRunLog::new());
        let engine = Arc::new(
            RunEngine::new(ExecutorRegistry::with_builtins(), Capabilities::new())
                .with_run_log(run_log.clone()),
        );
        let p = pipeline(
            "every-second",
            vec![cron("tick", "* * * * * *"), output("out", OutputFormat::Text)],
            vec![edge("tick", "out")],
        );
        let cancel = CancellationToken::new();
        let scheduler = CronScheduler::new(&[Arc::new(p)], engine, cancel.clone());
        let task = tokio::spawn(async move { scheduler.run().await });

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let runs = run_log.load_recent("every-second", None).await.unwrap();
                if let Some(run) = runs.iter().find(|r| r.status.is_terminal()) {
                    return run.clone();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("a scheduled run should finish");

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(finished.status, RunStatus::Success);
        assert_eq!(finished.trigger.kind, "cron");
        assert_eq!(finished.trigger.node_id.as_deref(), Some("tick"));
        assert!(finished.node_results.iter().any(|r| r.node_id == "out"));
    }
}
