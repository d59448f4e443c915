//! Task: Completion watch.
//!
//! Polls the prototype instance until the installer publishes the sentinel
//! metadata key. There is no push channel from the instance, so this is a
//! fixed-interval poll loop and the only suspension point of a run.
//!
//! ```text
//! WAITING ──sentinel observed──→ DONE
//!    │
//!    └──unrecoverable poll failure / deadline──→ FAILED
//! ```

use super::{BakeCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::provider::{ApiOutput, ProvisioningApi};
use crate::workflow::types::EphemeralInstance;
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Text the polling tool prints when it crashes on its own.
const POLLING_TOOL_CRASH_SIGNATURE: &str = "If you would like to report this issue";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchState {
    #[default]
    Waiting,
    Done,
    Failed,
}

/// Decides whether a failed serial-output fetch is the polling tool's own
/// fault and safe to retry.
pub trait PollFailureClassifier: Send + Sync {
    fn is_transient(&self, output: &ApiOutput) -> bool;
}

/// Matches the crash banner of the polling tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashSignatureClassifier;

impl PollFailureClassifier for CrashSignatureClassifier {
    fn is_transient(&self, output: &ApiOutput) -> bool {
        is_polling_tool_crash(&output.stderr)
    }
}

pub fn is_polling_tool_crash(stderr: &str) -> bool {
    stderr.contains(POLLING_TOOL_CRASH_SIGNATURE)
}

/// Receives serial console output while tracing.
pub trait SerialSink: Send + Sync {
    fn emit(&self, chunk: &str);

    /// Called once per poll when not tracing.
    fn progress(&self) {}
}

/// Writes serial output to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl SerialSink for StdoutSink {
    fn emit(&self, chunk: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(chunk.as_bytes()).and_then(|_| stdout.flush()) {
            tracing::debug!("Failed to write serial output to stdout: {}", e);
        }
    }

    fn progress(&self) {
        self.emit(".");
    }
}

/// Watcher tuning, taken from settings.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub sentinel_key: String,
    pub trace: bool,
    pub interval: Duration,
    pub max_poll_failures: u32,
    pub deadline: Option<Duration>,
}

/// Poll loop over one instance.
pub struct CompletionWatcher {
    api: Arc<dyn ProvisioningApi>,
    instance: EphemeralInstance,
    classifier: Arc<dyn PollFailureClassifier>,
    sink: Arc<dyn SerialSink>,
    options: WatchOptions,
    pattern: String,
    state: WatchState,
    offset: usize,
    polls: usize,
}

impl CompletionWatcher {
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        instance: EphemeralInstance,
        classifier: Arc<dyn PollFailureClassifier>,
        sink: Arc<dyn SerialSink>,
        options: WatchOptions,
    ) -> Self {
        let pattern = sentinel_pattern(&options.sentinel_key);
        Self {
            api,
            instance,
            classifier,
            sink,
            options,
            pattern,
            state: WatchState::Waiting,
            offset: 0,
            polls: 0,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Number of poll cycles started so far.
    pub fn polls(&self) -> usize {
        self.polls
    }

    /// Block until the sentinel is observed.
    pub async fn watch(&mut self) -> BakeResult<()> {
        tracing::info!(instance = %self.instance.name, "Waiting for prototype instance setup to finish");

        let result = match self.options.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.poll_until_done())
                .await
                .unwrap_or_else(|_| {
                    Err(BakeError::WatchFailed(format!(
                        "sentinel not observed on {} within {:?}",
                        self.instance.name, deadline
                    )))
                }),
            None => self.poll_until_done().await,
        };

        if let Err(e) = result {
            self.state = WatchState::Failed;
            return Err(e);
        }

        if self.options.trace {
            self.drain().await;
        }
        tracing::info!(instance = %self.instance.name, polls = self.polls, "Prototype instance setup finished");
        Ok(())
    }

    async fn poll_until_done(&mut self) -> BakeResult<()> {
        let EphemeralInstance {
            name,
            project,
            zone,
        } = self.instance.clone();
        let mut describe_failures = 0u32;
        let mut serial_crashes = 0u32;

        loop {
            self.polls += 1;

            if self.options.trace {
                let serial = self
                    .api
                    .get_serial_output(&project, &zone, &name, self.offset)
                    .await
                    .map_err(|e| BakeError::WatchFailed(format!("serial output fetch: {}", e)))?;
                self.emit(&serial);

                if serial.success() {
                    serial_crashes = 0;
                } else if self.offset > 0 {
                    if !self.classifier.is_transient(&serial) {
                        return Err(BakeError::WatchFailed(format!(
                            "serial output fetch failed with status {}: {}",
                            serial.status,
                            serial.stderr.trim()
                        )));
                    }
                    // Still describe below; the sentinel may already be set.
                    serial_crashes += 1;
                    tracing::warn!(instance = %name, attempt = serial_crashes, "Ignoring polling tool crash");
                    if serial_crashes >= self.options.max_poll_failures {
                        return Err(BakeError::WatchFailed(format!(
                            "polling tool crashed {} times in a row reading serial output of {}",
                            serial_crashes, name
                        )));
                    }
                }
            } else {
                self.sink.progress();
            }

            let described = self
                .api
                .describe_instance(&project, &zone, &name)
                .await
                .map_err(|e| BakeError::WatchFailed(format!("describe instance: {}", e)))?;

            if described.success() {
                describe_failures = 0;
                if described.stdout.contains(&self.pattern) {
                    self.state = WatchState::Done;
                    return Ok(());
                }
            } else {
                describe_failures += 1;
                tracing::warn!(
                    instance = %name,
                    attempt = describe_failures,
                    "Describe instance failed: {}",
                    described.stderr.trim()
                );
                if describe_failures >= self.options.max_poll_failures {
                    return Err(BakeError::WatchFailed(format!(
                        "describe instance {} failed {} times in a row: {}",
                        name,
                        describe_failures,
                        described.stderr.trim()
                    )));
                }
            }

            tokio::time::sleep(self.options.interval).await;
        }
    }

    /// Emit whatever the console printed after the last poll.
    async fn drain(&mut self) {
        let instance = &self.instance;
        let result = self
            .api
            .get_serial_output(&instance.project, &instance.zone, &instance.name, self.offset)
            .await;
        match result {
            Ok(out) if out.success() => self.emit(&out),
            Ok(out) => {
                tracing::warn!(status = out.status, "Final serial output fetch failed: {}", out.stderr.trim())
            }
            Err(e) => tracing::warn!("Final serial output fetch failed: {}", e),
        }
    }

    /// The offset advances by raw console bytes, not decoded text length.
    fn emit(&mut self, serial: &ApiOutput) {
        if !serial.stdout.is_empty() {
            self.sink.emit(&serial.stdout);
        }
        self.offset += serial.stdout_bytes;
    }
}

/// Line the instance description contains once the key is set.
pub fn sentinel_pattern(key: &str) -> String {
    format!("- key: {}", key)
}

pub struct WatchTask;

#[async_trait]
impl PipelineTask<BakeCtx> for WatchTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut watcher = {
            let ctx = ctx.lock().await;
            let instance = ctx
                .state
                .instance
                .clone()
                .ok_or_else(|| BakeError::Internal("provision task must run first".into()))?;
            CompletionWatcher::new(
                ctx.api.clone(),
                instance,
                ctx.classifier.clone(),
                ctx.sink.clone(),
                WatchOptions {
                    sentinel_key: ctx.settings.sentinel_key.clone(),
                    trace: ctx.request.trace,
                    interval: ctx.settings.poll_interval(),
                    max_poll_failures: ctx.settings.max_poll_failures,
                    deadline: ctx.settings.watch_deadline(),
                },
            )
        };

        let result = watcher
            .watch()
            .await
            .inspect_err(|e| log_task_error(&run_id, task_name, e));

        ctx.lock().await.state.watch = watcher.state();
        result
    }

    fn name(&self) -> &str {
        "watch"
    }
}
