//! Artifact encoding for JSON transport

use base64::{engine::general_purpose, Engine as _};
use std::io;
use std::path::Path;

/// Read the artifact and encode it as standard base-64 without line breaks
pub async fn encode_artifact(path: &Path) -> io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(general_purpose::STANDARD.encode(bytes))
}
