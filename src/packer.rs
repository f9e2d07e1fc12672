//! Empaquetado de `FileRecord`s en lotes acotados por tamaño serializado.
//!
//! El tamaño se mide sobre el JSON compacto del sobre completo (`Batch`),
//! que es exactamente lo que viaja por el canal.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Batch, BatchFile, FileRecord};

/// Límites de empaquetado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    /// Fracción configurada del límite duro del transporte.
    pub max_batch_bytes: usize,
    /// Por encima de este tamaño el fichero viaja sin contenido.
    pub max_inline_file_bytes: u64,
}

/// Un único fichero que no cabe en el presupuesto ni estando solo.
/// Se emite igualmente, en un lote unitario marcado como `oversized`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackingAnomaly {
    pub batch_id: Uuid,
    pub path: String,
    pub serialized_bytes: usize,
    pub max_batch_bytes: usize,
}

#[derive(Debug, Default)]
pub struct PackResult {
    pub batches: Vec<Batch>,
    pub anomalies: Vec<PackingAnomaly>,
}

impl PackResult {
    pub fn file_count(&self) -> usize {
        self.batches.iter().map(|b| b.files.len()).sum()
    }
}

/// Longitud del JSON compacto de un valor.
pub fn serialized_len<T: Serialize>(value: &T) -> serde_json::Result<usize> {
    Ok(serde_json::to_vec(value)?.len())
}

/// Lote en construcción: la cabecera sin ficheros se serializa aparte y los
/// ficheros se suman ya medidos, así cada candidato cuesta O(1) serializaciones.
struct OpenBatch {
    header: Batch,
    files: Vec<BatchFile>,
    files_len: usize,
}

impl OpenBatch {
    fn new(batch_id: Uuid, project: &str, correlation_id: Uuid) -> Self {
        Self {
            header: Batch::empty(batch_id, project, correlation_id),
            files: Vec::new(),
            files_len: 0,
        }
    }

    /// Tamaño que tendría el lote con `candidate` añadido.
    fn projected_len(&self, candidate: &BatchFile, candidate_len: usize) -> serde_json::Result<usize> {
        let mut header = self.header.clone();
        if candidate.path_only {
            header.path_only_count += 1;
        } else {
            header.inline_count += 1;
        }
        // `"files":[]` ya está en la cabecera; cada elemento extra añade una coma.
        let separators = self.files.len();
        Ok(serialized_len(&header)? + self.files_len + candidate_len + separators)
    }

    fn push(&mut self, file: BatchFile, len: usize) {
        if file.path_only {
            self.header.path_only_count += 1;
        } else {
            self.header.inline_count += 1;
        }
        self.files.push(file);
        self.files_len += len;
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn close(self) -> Batch {
        let mut batch = self.header;
        batch.files = self.files;
        batch
    }
}

/// Empaquetador voraz y determinista: mismo input y mismos límites producen
/// los mismos lotes (incluidos sus `batch_id`).
#[derive(Debug, Clone)]
pub struct BatchPacker {
    project_name: String,
    correlation_id: Uuid,
    limits: PackLimits,
}

impl BatchPacker {
    pub fn new(project_name: &str, correlation_id: Uuid, limits: PackLimits) -> Self {
        Self {
            project_name: project_name.to_string(),
            correlation_id,
            limits,
        }
    }

    /// Empaqueta los registros respetando el orden de entrada.
    pub fn pack<I>(&self, records: I) -> serde_json::Result<PackResult>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        self.stream(records).collect()
    }

    /// Versión perezosa de `pack`: cada lote se emite en cuanto se cierra, y
    /// sólo se consume del origen el registro que provoca el cierre.
    pub fn stream<I>(&self, records: I) -> PackStream<impl Iterator<Item = BatchFile>>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let max_inline = self.limits.max_inline_file_bytes;
        let files = records
            .into_iter()
            .map(move |record| BatchFile::from_record(record, max_inline));
        PackStream::new(
            &self.project_name,
            self.correlation_id,
            files,
            self.limits.max_batch_bytes,
            IdScheme::Run {
                namespace: self.correlation_id,
                project: self.project_name.clone(),
            },
        )
    }
}

/// Vuelve a partir un lote con un presupuesto menor. Los hijos conservan
/// `correlation_id` y derivan su id del lote padre.
pub fn split_batch(batch: &Batch, max_batch_bytes: usize, depth: u32) -> serde_json::Result<PackResult> {
    let result: PackResult = PackStream::new(
        &batch.project_name,
        batch.correlation_id,
        batch.files.iter().cloned(),
        max_batch_bytes,
        IdScheme::Split {
            parent: batch.batch_id,
            depth,
        },
    )
    .collect::<serde_json::Result<_>>()?;
    debug!(
        batch_id = %batch.batch_id,
        budget = max_batch_bytes,
        parts = result.batches.len(),
        "Lote re-partido"
    );
    Ok(result)
}

/// Derivación de `batch_id` a partir del número de secuencia.
#[derive(Debug, Clone)]
enum IdScheme {
    Run { namespace: Uuid, project: String },
    Split { parent: Uuid, depth: u32 },
}

impl IdScheme {
    fn id(&self, seq: usize) -> Uuid {
        match self {
            IdScheme::Run { namespace, project } => {
                Uuid::new_v5(namespace, format!("{project}:{seq}").as_bytes())
            }
            IdScheme::Split { parent, depth } => {
                Uuid::new_v5(parent, format!("split:{depth}:{seq}").as_bytes())
            }
        }
    }
}

/// Un lote cerrado y, si era un fichero que no cabía ni solo, su anomalía.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBatch {
    pub batch: Batch,
    pub anomaly: Option<PackingAnomaly>,
}

impl FromIterator<PackedBatch> for PackResult {
    fn from_iter<T: IntoIterator<Item = PackedBatch>>(iter: T) -> Self {
        let mut result = PackResult::default();
        for packed in iter {
            result.anomalies.extend(packed.anomaly);
            result.batches.push(packed.batch);
        }
        result
    }
}

/// Iterador de lotes sobre un flujo de `BatchFile`.
pub struct PackStream<I> {
    files: I,
    project: String,
    correlation_id: Uuid,
    max_batch_bytes: usize,
    ids: IdScheme,
    seq: usize,
    current: OpenBatch,
    // Como mucho dos: el lote lleno y el unitario sobredimensionado.
    ready: VecDeque<PackedBatch>,
    done: bool,
}

impl<I: Iterator<Item = BatchFile>> PackStream<I> {
    fn new(project: &str, correlation_id: Uuid, files: I, max_batch_bytes: usize, ids: IdScheme) -> Self {
        let current = OpenBatch::new(ids.id(0), project, correlation_id);
        Self {
            files,
            project: project.to_string(),
            correlation_id,
            max_batch_bytes,
            ids,
            seq: 1,
            current,
            ready: VecDeque::new(),
            done: false,
        }
    }

    fn open_new(&mut self) -> OpenBatch {
        let id = self.ids.id(self.seq);
        self.seq += 1;
        OpenBatch::new(id, &self.project, self.correlation_id)
    }

    fn rotate(&mut self) -> Batch {
        let fresh = self.open_new();
        std::mem::replace(&mut self.current, fresh).close()
    }

    fn accept(&mut self, file: BatchFile) -> serde_json::Result<()> {
        let max_batch_bytes = self.max_batch_bytes;
        let file_len = serialized_len(&file)?;

        if self.current.projected_len(&file, file_len)? <= max_batch_bytes {
            self.current.push(file, file_len);
            return Ok(());
        }

        if !self.current.is_empty() {
            let full = self.rotate();
            self.ready.push_back(PackedBatch {
                batch: full,
                anomaly: None,
            });
        }

        let alone = self.current.projected_len(&file, file_len)?;
        if alone <= max_batch_bytes {
            self.current.push(file, file_len);
            return Ok(());
        }

        // No cabe ni solo: lote unitario marcado, nunca se descarta.
        let path = file.path.clone();
        self.current.push(file, file_len);
        let mut single = self.rotate();
        single.oversized = true;
        warn!(
            batch_id = %single.batch_id,
            path = %path,
            bytes = alone,
            budget = max_batch_bytes,
            "Anomalía de empaquetado: el fichero excede el presupuesto por sí solo"
        );
        let anomaly = PackingAnomaly {
            batch_id: single.batch_id,
            path,
            serialized_bytes: alone,
            max_batch_bytes,
        };
        self.ready.push_back(PackedBatch {
            batch: single,
            anomaly: Some(anomaly),
        });
        Ok(())
    }
}

impl<I: Iterator<Item = BatchFile>> Iterator for PackStream<I> {
    type Item = serde_json::Result<PackedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(packed) = self.ready.pop_front() {
                return Some(Ok(packed));
            }
            if self.done {
                return None;
            }
            match self.files.next() {
                Some(file) => {
                    if let Err(e) = self.accept(file) {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                None => {
                    self.done = true;
                    if !self.current.is_empty() {
                        let last = self.rotate();
                        return Some(Ok(PackedBatch {
                            batch: last,
                            anomaly: None,
                        }));
                    }
                }
            }
        }
    }
}
