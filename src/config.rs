//! Service configuration
//!
//! Limits come from the environment (optionally via `.env`); the compiler
//! invocation comes from a TOML profile. Both are loaded once in `main` and
//! handed to the components that need them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime limits and locations
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Base directory under which per-request workspaces are created
    pub workspace_root: PathBuf,
    /// Wall-clock limit for one compiler invocation
    pub compile_timeout: Duration,
    /// Largest accepted source text in bytes
    pub max_source_bytes: usize,
    /// Cap on each captured stream (stdout, stderr) in bytes
    pub max_output_bytes: usize,
    /// Largest file the compiler may write (RLIMIT_FSIZE)
    pub max_artifact_bytes: u64,
    /// Address space limit for the compiler in MB (0 = unlimited)
    pub memory_limit_mb: u64,
    /// Number of compilations allowed to run at once
    pub max_concurrent_compiles: usize,
    /// Optional path to a compiler profile; the embedded one is used otherwise
    pub compiler_config: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            workspace_root: std::env::temp_dir().join("zxbasic-compiler"),
            compile_timeout: Duration::from_millis(8_000),
            max_source_bytes: 256 * 1024,
            max_output_bytes: 64 * 1024,
            max_artifact_bytes: 4 * 1024 * 1024,
            memory_limit_mb: 1024,
            max_concurrent_compiles: default_concurrency(),
            compiler_config: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            bind_addr: parse_var(vars, "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            workspace_root: vars
                .get("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            compile_timeout: parse_var::<u64>(vars, "COMPILE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.compile_timeout),
            max_source_bytes: parse_var(vars, "MAX_SOURCE_BYTES")?
                .unwrap_or(defaults.max_source_bytes),
            max_output_bytes: parse_var(vars, "MAX_OUTPUT_BYTES")?
                .unwrap_or(defaults.max_output_bytes),
            max_artifact_bytes: parse_var(vars, "MAX_ARTIFACT_BYTES")?
                .unwrap_or(defaults.max_artifact_bytes),
            memory_limit_mb: parse_var(vars, "COMPILER_MEMORY_LIMIT_MB")?
                .unwrap_or(defaults.memory_limit_mb),
            max_concurrent_compiles: parse_var(vars, "MAX_CONCURRENT_COMPILES")?
                .unwrap_or(defaults.max_concurrent_compiles),
            compiler_config: vars.get("COMPILER_CONFIG").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.compile_timeout.is_zero() {
            anyhow::bail!("COMPILE_TIMEOUT_MS must be greater than zero");
        }
        if self.max_source_bytes == 0 {
            anyhow::bail!("MAX_SOURCE_BYTES must be greater than zero");
        }
        if self.max_output_bytes == 0 {
            anyhow::bail!("MAX_OUTPUT_BYTES must be greater than zero");
        }
        if self.max_artifact_bytes == 0 {
            anyhow::bail!("MAX_ARTIFACT_BYTES must be greater than zero");
        }
        if self.max_concurrent_compiles == 0 {
            anyhow::bail!("MAX_CONCURRENT_COMPILES must be greater than zero");
        }
        Ok(())
    }

    /// Load the compiler profile this configuration points at
    pub fn load_profile(&self) -> Result<CompilerProfile> {
        match &self.compiler_config {
            Some(path) => CompilerProfile::from_file(path),
            None => CompilerProfile::embedded(),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match vars.get(name) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub const SOURCE_PLACEHOLDER: &str = "{source}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// How to invoke the external compiler
#[derive(Debug, Clone, Deserialize)]
pub struct CompilerProfile {
    /// Compiler executable (looked up on PATH if not absolute)
    pub program: String,
    /// Argument vector; `{source}` and `{output}` are substituted per request
    pub args: Vec<String>,
    /// File name the source is staged under
    pub source_file: String,
    /// File name the compiler is expected to produce
    pub artifact_file: String,
    /// Environment variables copied into the compiler's environment
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

impl CompilerProfile {
    /// Profile shipped with the service
    pub fn embedded() -> Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/compiler.toml"));
        Self::from_toml(content).context("Invalid embedded compiler profile")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiler profile {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid compiler profile {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let profile: CompilerProfile = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            anyhow::bail!("program must not be empty");
        }
        if !self.args.iter().any(|arg| arg.contains(SOURCE_PLACEHOLDER)) {
            anyhow::bail!("args must reference {}", SOURCE_PLACEHOLDER);
        }
        ensure_plain_file_name(&self.source_file, "source_file")?;
        ensure_plain_file_name(&self.artifact_file, "artifact_file")?;
        if self.source_file == self.artifact_file {
            anyhow::bail!("source_file and artifact_file must differ");
        }
        Ok(())
    }

    /// Expand the argument template for one invocation
    pub fn render_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

/// File names inside a workspace must not escape it
fn ensure_plain_file_name(name: &str, field: &str) -> Result<()> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => anyhow::bail!("{} must be a plain file name, got {:?}", field, name),
    }
}
