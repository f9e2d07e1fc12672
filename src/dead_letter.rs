//! Destino de lotes que agotaron sus reintentos, para reprocesado manual.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{error::PipelineError, models::Batch};

/// Etapa en la que se abandonó el lote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterStage {
    Publish,
    Materialize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub stage: DeadLetterStage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub batch: Batch,
}

impl DeadLetter {
    pub fn new(stage: DeadLetterStage, reason: impl Into<String>, batch: Batch) -> Self {
        Self {
            stage,
            reason: reason.into(),
            failed_at: Utc::now(),
            batch,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, letter: DeadLetter) -> Result<(), PipelineError>;

    /// Cartas pendientes, en orden estable.
    async fn pending(&self) -> Result<Vec<DeadLetter>, PipelineError>;

    /// Marca como reprocesada la carta de `batch_id`.
    async fn acknowledge(&self, letter: &DeadLetter) -> Result<(), PipelineError>;
}

/// Un fichero JSON por lote: `<dir>/<batch_id>.json`.
pub struct DirectoryDeadLetterSink {
    dir: PathBuf,
}

impl DirectoryDeadLetterSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, letter: &DeadLetter) -> PathBuf {
        self.dir.join(format!("{}.json", letter.batch.batch_id))
    }
}

#[async_trait]
impl DeadLetterSink for DirectoryDeadLetterSink {
    async fn store(&self, letter: DeadLetter) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&letter);
        let bytes = serde_json::to_vec_pretty(&letter)?;
        tokio::fs::write(&path, bytes).await?;
        error!(
            batch_id = %letter.batch.batch_id,
            files = letter.batch.files.len(),
            stage = ?letter.stage,
            "Lote enviado a dead-letter ({}): {}",
            path.display(),
            letter.reason
        );
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<DeadLetter>, PipelineError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut letters = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<DeadLetter>(&bytes) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!("Carta ilegible {}: {e}. Se ignora.", path.display()),
            }
        }
        Ok(letters)
    }

    async fn acknowledge(&self, letter: &DeadLetter) -> Result<(), PipelineError> {
        let path = self.path_for(letter);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Dead-letter {} reprocesada y eliminada.", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Variante en memoria, útil en tests y ejecuciones de prueba.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn store(&self, letter: DeadLetter) -> Result<(), PipelineError> {
        error!(
            batch_id = %letter.batch.batch_id,
            stage = ?letter.stage,
            "Lote enviado a dead-letter: {}",
            letter.reason
        );
        if let Ok(mut letters) = self.letters.lock() {
            // Mismo lote, misma carta: igual que el fichero `<batch_id>.json`.
            match letters.iter_mut().find(|l| l.batch.batch_id == letter.batch.batch_id) {
                Some(existing) => *existing = letter,
                None => letters.push(letter),
            }
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<DeadLetter>, PipelineError> {
        Ok(self.letters())
    }

    async fn acknowledge(&self, letter: &DeadLetter) -> Result<(), PipelineError> {
        if let Ok(mut letters) = self.letters.lock() {
            letters.retain(|l| l.batch.batch_id != letter.batch.batch_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    fn letter(id: u128) -> DeadLetter {
        DeadLetter::new(
            DeadLetterStage::Materialize,
            "almacén caído",
            Batch::empty(Uuid::from_u128(id), "demo", Uuid::nil()),
        )
    }

    #[tokio::test]
    async fn directory_sink_round_trips_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryDeadLetterSink::new(dir.path().join("dl"));

        assert!(sink.pending().await.unwrap().is_empty());
        assert_ok!(sink.store(letter(1)).await);
        assert_ok!(sink.store(letter(2)).await);

        let pending = sink.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].stage, DeadLetterStage::Materialize);

        assert_ok!(sink.acknowledge(&pending[0]).await);
        assert_eq!(sink.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_sink_tracks_letters() {
        let sink = MemoryDeadLetterSink::new();
        sink.store(letter(7)).await.unwrap();
        sink.store(letter(7)).await.unwrap();
        assert_eq!(sink.letters().len(), 1);
        let pending = sink.pending().await.unwrap();
        sink.acknowledge(&pending[0]).await.unwrap();
        assert!(sink.letters().is_empty());
    }
}
