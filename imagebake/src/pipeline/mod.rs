//! Table-driven sequential pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: Runs every stage in plan order
//! - Stage: Named group of tasks, run one after another
//! - Task: Atomic unit of work over the shared context
//! ```
//!
//! The first failing task stops the pipeline and its error is returned
//! unchanged. Callers own any unwinding.
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::new("prepare", vec![Box::new(TaskA)]),
//!     Stage::new("finish", vec![Box::new(TaskB)]),
//! ]);
//!
//! let pipeline = PipelineBuilder::from_plan(plan);
//! let metrics = PipelineExecutor::execute(pipeline, ctx).await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::Stage;
pub use task::{BoxedTask, PipelineTask};
