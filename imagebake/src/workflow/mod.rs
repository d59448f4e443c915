//! Bake run orchestration.
//!
//! ## Architecture
//!
//! The run is table-driven, with the plan chosen by output mode:
//!
//! ```text
//! Image:
//!   1. Resolve          (target name, source image)
//!   2. Precondition     (artifact must not exist)
//!   3. Provision        (create prototype instance)
//!   4. Watch            (wait for the sentinel)
//!   5. ExtractImage     (delete instance keeping disk, create image)
//!
//! Tarball:
//!   1-4. as above
//!   5. ExtractTarball   (scratch disk, remote bundle, upload)
//! ```
//!
//! `CleanupGuard` tears down every ephemeral resource after the pipeline
//! finishes, on success and failure alike.

mod cleanup;
mod tasks;
mod types;

pub use cleanup::CleanupReport;
pub use tasks::watch::{
    CrashSignatureClassifier, PollFailureClassifier, SerialSink, StdoutSink, WatchState,
    is_polling_tool_crash,
};
pub use types::{
    Artifact, EphemeralDisk, EphemeralInstance, RunId, TargetImage, WorkflowState,
};

use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::provider::ProvisioningApi;
use crate::request::{OutputMode, WorkflowRequest};
use crate::settings::BakeSettings;
use imagebake_shared::{BakeError, BakeResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;

use tasks::{
    BakeCtx, ExtractImageTask, ExtractTarballTask, PreconditionTask, ProvisionTask, ResolveTask,
    WatchTask,
};
use types::BakePipelineContext;

// ============================================================================
// EXECUTION PLAN
// ============================================================================

fn get_execution_plan(output: &OutputMode) -> ExecutionPlan<BakeCtx> {
    let extract: BoxedTask<BakeCtx> = match output {
        OutputMode::Image => Box::new(ExtractImageTask),
        OutputMode::Tarball { .. } => Box::new(ExtractTarballTask),
    };

    let stages: Vec<Stage<BoxedTask<BakeCtx>>> = vec![
        Stage::single("resolve", Box::new(ResolveTask)),
        // Fail before creating anything
        Stage::single("precondition", Box::new(PreconditionTask)),
        Stage::single("provision", Box::new(ProvisionTask)),
        Stage::single("watch", Box::new(WatchTask)),
        Stage::single("extract", extract),
    ];

    ExecutionPlan::new(stages)
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct BakeOutcome {
    pub run_id: RunId,
    pub artifact: Artifact,
    pub metrics: PipelineMetrics,
    /// Teardown problems that did not prevent the artifact.
    pub cleanup: CleanupReport,
}

/// One bake run.
///
/// # Example
///
/// ```ignore
/// let outcome = BakeWorkflow::new(api, settings, request)?.run().await?;
/// println!("{}", outcome.artifact.next_steps(&zone));
/// ```
pub struct BakeWorkflow {
    api: Arc<dyn ProvisioningApi>,
    settings: Arc<BakeSettings>,
    request: Arc<WorkflowRequest>,
    sink: Arc<dyn SerialSink>,
    classifier: Arc<dyn PollFailureClassifier>,
}

impl BakeWorkflow {
    /// Validate inputs. Nothing is contacted until [`BakeWorkflow::run`].
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        settings: BakeSettings,
        request: WorkflowRequest,
    ) -> BakeResult<Self> {
        settings.validate()?;
        request.validate()?;

        Ok(Self {
            api,
            settings: Arc::new(settings),
            request: Arc::new(request),
            sink: Arc::new(StdoutSink),
            classifier: Arc::new(CrashSignatureClassifier),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn SerialSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PollFailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Execute every stage, then tear down ephemeral resources.
    ///
    /// The first stage error is returned; teardown failures are only logged
    /// so they never replace it.
    pub async fn run(self) -> BakeResult<BakeOutcome> {
        let run_id = RunId::new();
        let span = tracing::info_span!(
            "bake",
            run_id = %run_id,
            instance = %self.request.instance_name,
            mode = self.request.output.label(),
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(self, run_id: RunId) -> BakeResult<BakeOutcome> {
        let BakeWorkflow {
            api,
            settings,
            request,
            sink,
            classifier,
        } = self;

        let ctx = BakePipelineContext::new(
            run_id,
            Arc::clone(&request),
            settings,
            Arc::clone(&api),
            sink,
            classifier,
        );
        let ctx = Arc::new(Mutex::new(ctx));

        let plan = get_execution_plan(&request.output);
        tracing::info!(stages = ?plan.stage_names(), "Starting bake run");
        let pipeline = PipelineBuilder::from_plan(plan);
        let result = PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await;

        let mut ctx = ctx.lock().await;
        let report = ctx.guard.cleanup(api.as_ref()).await;
        if !report.is_clean() {
            tracing::warn!(failures = ?report.failures, "Cleanup left resources behind");
        }

        let metrics = match result {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::error!(kind = e.kind(), "Bake run failed: {}", e);
                return Err(e);
            }
        };
        metrics.log_stages();

        let artifact = ctx
            .state
            .artifact
            .take()
            .ok_or_else(|| BakeError::Internal("extract task must run first".into()))?;
        tracing::info!(artifact = ?artifact, "Bake run completed");

        Ok(BakeOutcome {
            run_id,
            artifact,
            metrics,
            cleanup: report,
        })
    }
}
