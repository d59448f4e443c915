//! Pipeline tasks for a bake run.
//!
//! Each task pulls its inputs out of the shared context, releases the lock
//! while talking to the provisioning API, then stores its outputs.

mod extract_image;
mod extract_tarball;
mod precondition;
mod provision;
mod resolve;
pub mod watch;

pub use extract_image::ExtractImageTask;
pub use extract_tarball::ExtractTarballTask;
pub use precondition::PreconditionTask;
pub use provision::ProvisionTask;
pub use resolve::ResolveTask;
pub use watch::WatchTask;

use super::types::{BakePipelineContext, RunId};
use imagebake_shared::BakeError;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type BakeCtx = Arc<Mutex<BakePipelineContext>>;

async fn task_start(ctx: &BakeCtx, task_name: &str) -> RunId {
    let run_id = ctx.lock().await.run_id;
    tracing::info!(run_id = %run_id, task = task_name, "Task started");
    run_id
}

fn log_task_error(run_id: &RunId, task_name: &str, err: &BakeError) {
    tracing::error!(
        run_id = %run_id,
        task = task_name,
        kind = err.kind(),
        "Task failed: {}",
        err
    );
}
