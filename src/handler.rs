//! Compilation request handler
//!
//! Drives one request through validate, stage, compile, encode and release.
//! Every path out of a request releases its workspace, and every failure is
//! reported as a `CompileResult` rather than an error.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::compiler::{CompileVerdict, Compiler};
use crate::config::{CompilerProfile, ServiceConfig};
use crate::core::{CancelToken, CompileRequest, CompileResult, ServiceError};
use crate::encoder::encode_artifact;
use crate::runner::{RunLimits, Runner};
use crate::workspace::{Workspace, WorkspaceManager};

/// Compiles BASIC source into tape images, one isolated workspace per request
pub struct CompileService {
    workspaces: WorkspaceManager,
    compiler: Compiler,
    limits: RunLimits,
    max_source_bytes: usize,
    permits: Arc<Semaphore>,
}

impl CompileService {
    pub fn new(
        config: &ServiceConfig,
        profile: CompilerProfile,
        runner: Arc<dyn Runner>,
    ) -> std::io::Result<Self> {
        let workspaces = WorkspaceManager::new(&config.workspace_root)?;
        let limits = RunLimits {
            wall_time: config.compile_timeout,
            max_output_bytes: config.max_output_bytes,
            max_file_bytes: config.max_artifact_bytes,
            memory_mb: config.memory_limit_mb,
        };

        Ok(Self {
            workspaces,
            compiler: Compiler::new(profile, runner),
            limits,
            max_source_bytes: config.max_source_bytes,
            permits: Arc::new(Semaphore::new(config.max_concurrent_compiles)),
        })
    }

    /// Compile `request` to completion
    pub async fn compile(&self, request: &CompileRequest) -> CompileResult {
        self.compile_with_cancel(request, &CancelToken::never()).await
    }

    /// Compile `request`, aborting once `cancel` fires
    pub async fn compile_with_cancel(
        &self,
        request: &CompileRequest,
        cancel: &CancelToken,
    ) -> CompileResult {
        let request_id = Uuid::new_v4().to_string();
        self.compile_with_id(&request_id, request, cancel).await
    }

    /// Compile `request` under a caller-supplied request id.
    ///
    /// The id is attached to every log line emitted while the request runs,
    /// including those from the workspace, compiler and runner.
    pub async fn compile_with_id(
        &self,
        request_id: &str,
        request: &CompileRequest,
        cancel: &CancelToken,
    ) -> CompileResult {
        let span = info_span!("compile", request_id = %request_id);
        async {
            let started = Instant::now();
            info!("Accepted compile request: source_bytes={}", request.source.len());

            match self.run(request, cancel).await {
                Ok(result) => {
                    let payload_bytes = match &result {
                        CompileResult::Success { artifact_encoded } => artifact_encoded.len(),
                        CompileResult::CompileFailure { diagnostics } => diagnostics.len(),
                        CompileResult::SystemFailure { .. } => 0,
                    };
                    info!(
                        "Compile request finished: outcome={}, payload_bytes={}, elapsed_ms={}",
                        result.kind(),
                        payload_bytes,
                        started.elapsed().as_millis()
                    );
                    result
                }
                Err(e) => {
                    let reason = e.reason();
                    error!(
                        "Compile request failed: reason={}, cause={}, elapsed_ms={}",
                        reason,
                        e,
                        started.elapsed().as_millis()
                    );
                    CompileResult::system_failure(reason)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &CompileRequest,
        cancel: &CancelToken,
    ) -> Result<CompileResult, ServiceError> {
        self.validate(request)?;
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        // Queueing counts against the same time limit as the compile itself
        let wait = self.limits.wall_time;
        let _permit = tokio::select! {
            permit = tokio::time::timeout(wait, self.permits.acquire()) => match permit {
                Ok(permit) => permit.map_err(|_| ServiceError::Cancelled)?,
                Err(_) => return Err(ServiceError::Busy { waited_ms: wait.as_millis() }),
            },
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
        };

        let workspace = self.workspaces.acquire().await.map_err(ServiceError::Workspace)?;
        let result = self.compile_in(&workspace, request, cancel).await;
        workspace.release().await;
        result
    }

    fn validate(&self, request: &CompileRequest) -> Result<(), ServiceError> {
        if request.source.trim().is_empty() {
            return Err(ServiceError::InvalidInput("source is empty".into()));
        }
        if request.source.len() > self.max_source_bytes {
            return Err(ServiceError::InvalidInput(format!(
                "source is {} bytes, limit is {}",
                request.source.len(),
                self.max_source_bytes
            )));
        }
        if request.source.contains('\0') {
            return Err(ServiceError::InvalidInput("source contains NUL bytes".into()));
        }
        Ok(())
    }

    async fn compile_in(
        &self,
        workspace: &Workspace,
        request: &CompileRequest,
        cancel: &CancelToken,
    ) -> Result<CompileResult, ServiceError> {
        let profile = self.compiler.profile();
        let source_path = workspace
            .write_file(&profile.source_file, request.source.as_bytes())
            .await
            .map_err(ServiceError::Workspace)?;

        let verdict = self
            .compiler
            .compile(&source_path, workspace.path(), &self.limits, cancel)
            .await?;

        match verdict {
            CompileVerdict::Compiled { artifact_path } => {
                let artifact_encoded = encode_artifact(&artifact_path)
                    .await
                    .map_err(ServiceError::ArtifactRead)?;
                Ok(CompileResult::Success { artifact_encoded })
            }
            CompileVerdict::Rejected { diagnostics } => {
                Ok(CompileResult::CompileFailure { diagnostics })
            }
        }
    }
}
