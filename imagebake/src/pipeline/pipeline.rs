//! Sequential pipeline executor.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::Stage;
use super::task::BoxedTask;
use imagebake_shared::BakeResult;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name).collect()
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// Pipeline executor.
///
/// Task logic lives in the task implementations; this only sequences them
/// and records timing.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// Stops at the first failing task and returns its error untouched.
    ///
    /// Generic over:
    /// - `Ctx`: Shared pipeline context (use interior mutability for writes)
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> BakeResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let stage_start = Instant::now();
            tracing::debug!(stage = stage.name, index, "Entering stage");

            let mut task_metrics = Vec::new();
            for task in stage.tasks {
                let name = task.name().to_string();
                let task_start = Instant::now();
                task.run(ctx.clone()).await?;
                task_metrics.push(TaskMetrics {
                    name,
                    duration_ms: task_start.elapsed().as_millis(),
                });
            }

            stage_metrics.push(StageMetrics {
                index,
                name: stage.name,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use imagebake_shared::BakeError;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> BakeResult<()> {
            ctx.lock().unwrap().push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> BakeResult<()> {
            Err(BakeError::Provisioning("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_runs_stages_in_order() {
        let log: Log = Arc::default();
        let stages: Vec<Stage<BoxedTask<Log>>> = vec![
            Stage::new("one", vec![Box::new(Record("a")), Box::new(Record("b"))]),
            Stage::single("two", Box::new(Record("c"))),
        ];
        let plan = ExecutionPlan::new(stages);
        assert_eq!(plan.stage_names(), vec!["one", "two"]);

        let metrics = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone())
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(metrics.completed_tasks(), vec!["a", "b", "c"]);
        assert_eq!(metrics.stages.len(), 2);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let log: Log = Arc::default();
        let stages: Vec<Stage<BoxedTask<Log>>> = vec![
            Stage::single("one", Box::new(Record("a"))),
            Stage::single("two", Box::new(Fail)),
            Stage::single("three", Box::new(Record("never"))),
        ];
        let plan = ExecutionPlan::new(stages);

        let err = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BakeError::Provisioning(_)));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }
}
