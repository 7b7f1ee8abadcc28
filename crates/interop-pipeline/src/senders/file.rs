//! File writer sender (§4.9): writes a rendered envelope to an output directory, atomically via a
//! temp-file-then-rename.

use interop_core::envelope::{BodyContent, Envelope};
use interop_core::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileSenderConfig {
    pub directory: PathBuf,
    pub create_subdirs: bool,
}

/// Writes `envelope` under `config.directory` as `{timestamp}_{message_id}{ext}`, where `ext` is
/// picked from the envelope's content type.
pub async fn send(config: &FileSenderConfig, envelope: &Envelope) -> EngineResult<()> {
    if config.create_subdirs {
        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(|e| EngineError::internal(format!("cannot create output dir: {e}")))?;
    }

    let bytes = render(envelope)?;
    let ext = extension_for(&envelope.body.content_type);
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let filename = format!("{timestamp}_{}{ext}", envelope.header.message_id);
    let destination = config.directory.join(&filename);

    write_atomic(&destination, &bytes).await?;
    debug!(file = %destination.display(), "wrote outbound file");
    Ok(())
}

fn render(envelope: &Envelope) -> EngineResult<Vec<u8>> {
    match &envelope.body.content {
        BodyContent::Fhir(value) => serde_json::to_vec_pretty(value).map_err(EngineError::from),
        BodyContent::Hl7(_) | BodyContent::Raw => Ok(envelope.body.raw_content.clone()),
    }
}

fn extension_for(content_type: &str) -> &'static str {
    if content_type.contains("fhir") {
        ".json"
    } else if content_type.contains("hl7") {
        ".hl7"
    } else {
        ".out"
    }
}

async fn write_atomic(destination: &Path, bytes: &[u8]) -> EngineResult<()> {
    let temp_path = destination.with_extension(format!(
        "{}.tmp",
        destination.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| EngineError::internal(format!("write failed: {e}")))?;
    tokio::fs::rename(&temp_path, destination)
        .await
        .map_err(|e| EngineError::internal(format!("rename failed: {e}")))
}
