//! Lado consumidor: convierte lotes recibidos en nodos y aristas del grafo.
//!
//! El materializador nunca crea aristas `CONTAINS`; sólo registra que un
//! fichero existe. Colocarlo en la jerarquía es trabajo del `TreeBuilder`
//! y del `OrphanReconciler`.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cancel::CancelSignal,
    channel::PartitionReceiver,
    dead_letter::{DeadLetter, DeadLetterSink, DeadLetterStage},
    error::StoreError,
    extraction::{ExtractionRequest, ExtractionResult, Extractor},
    models::{entity_id, Batch, BatchFile, EntityNode, FileNode, RelatesEdge},
    retry::{RetryOutcome, RetryPolicy},
    store::GraphStore,
};

/// Contadores de un lote (o acumulados de varios).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub files_upserted: usize,
    pub files_failed: usize,
    /// Ficheros sólo-ruta: sin contenido no hay extracción.
    pub extraction_skipped: usize,
    pub extraction_failed: usize,
    pub entities_upserted: usize,
    pub relations_upserted: usize,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: &BatchOutcome) {
        self.files_upserted += other.files_upserted;
        self.files_failed += other.files_failed;
        self.extraction_skipped += other.extraction_skipped;
        self.extraction_failed += other.extraction_failed;
        self.entities_upserted += other.entities_upserted;
        self.relations_upserted += other.relations_upserted;
    }
}

/// Fallo de una escritura tras aplicar la política de reintentos.
enum WriteFailure {
    /// Rechazo propio de este dato; se registra y se sigue.
    Rejected(StoreError),
    /// El almacén no responde: caída a nivel de lote.
    Outage(StoreError),
}

pub struct Materializer {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn Extractor>,
    retry: RetryPolicy,
}

impl Materializer {
    pub fn new(store: Arc<dyn GraphStore>, extractor: Arc<dyn Extractor>, retry: RetryPolicy) -> Self {
        Self {
            store,
            extractor,
            retry,
        }
    }

    async fn write<T, F, Fut>(&self, what: &str, op: F) -> Result<T, WriteFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.retry.run(what, StoreError::is_retryable, op).await {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Terminal(e) => Err(WriteFailure::Rejected(e)),
            RetryOutcome::Exhausted { last_error, .. } => Err(WriteFailure::Outage(last_error)),
        }
    }

    /// Procesa un lote en orden. Los fallos por fichero se registran y no
    /// detienen el resto; sólo una caída del almacén devuelve `Err`.
    pub async fn process_batch(&self, batch: &Batch) -> Result<BatchOutcome, StoreError> {
        let project = batch.project_name.as_str();
        let mut outcome = BatchOutcome::default();

        match self.write("upsert_project", || self.store.upsert_project(project)).await {
            Ok(_) => {}
            Err(WriteFailure::Outage(e)) => return Err(e),
            Err(WriteFailure::Rejected(e)) => warn!(project, "No se pudo registrar el proyecto: {e}"),
        }

        for file in &batch.files {
            match self.process_file(project, batch.correlation_id, file, &mut outcome).await {
                Ok(()) => {}
                Err(WriteFailure::Outage(e)) => {
                    error!(
                        batch_id = %batch.batch_id,
                        path = %file.path,
                        "Almacén no disponible a mitad de lote: {e}"
                    );
                    return Err(e);
                }
                Err(WriteFailure::Rejected(e)) => {
                    outcome.files_failed += 1;
                    warn!(batch_id = %batch.batch_id, path = %file.path, "Fichero no materializado: {e}");
                }
            }
        }

        info!(
            batch_id = %batch.batch_id,
            project,
            files = outcome.files_upserted,
            failed = outcome.files_failed,
            skipped = outcome.extraction_skipped,
            "Lote materializado"
        );
        Ok(outcome)
    }

    async fn process_file(
        &self,
        project: &str,
        run_id: Uuid,
        file: &BatchFile,
        outcome: &mut BatchOutcome,
    ) -> Result<(), WriteFailure> {
        let node = FileNode::from_batch_file(project, run_id, file);
        self.write("upsert_file", || self.store.upsert_file(&node)).await?;
        outcome.files_upserted += 1;

        let content = match (&file.content, file.path_only) {
            (Some(content), false) => content,
            _ => {
                debug!(path = %file.path, "Fichero sólo-ruta: se omite la extracción");
                outcome.extraction_skipped += 1;
                return Ok(());
            }
        };

        let request = ExtractionRequest {
            file_path: &file.path,
            content,
            language: file.language.as_deref(),
        };
        let extraction = match self.extractor.extract(request).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(path = %file.path, "Extracción fallida: {e}. El nodo File se conserva.");
                outcome.extraction_failed += 1;
                return Ok(());
            }
        };

        match self.upsert_extraction(project, &node.entity_id, &extraction).await {
            Ok((entities, relations)) => {
                outcome.entities_upserted += entities;
                outcome.relations_upserted += relations;
                Ok(())
            }
            Err(WriteFailure::Rejected(e)) => {
                warn!(path = %file.path, "Entidades no persistidas: {e}");
                outcome.extraction_failed += 1;
                Ok(())
            }
            Err(outage) => Err(outage),
        }
    }

    /// Upsert de entidades, menciones y relaciones por clave compuesta: una
    /// segunda pasada con el mismo contenido deja el grafo igual.
    async fn upsert_extraction(
        &self,
        project: &str,
        file_id: &str,
        extraction: &ExtractionResult,
    ) -> Result<(usize, usize), WriteFailure> {
        let mut entities: BTreeMap<String, EntityNode> = BTreeMap::new();
        for candidate in &extraction.entities {
            let id = entity_id(project, &candidate.id);
            entities.entry(id.clone()).or_insert_with(|| EntityNode {
                entity_id: id,
                project_name: project.to_string(),
                name: candidate.id.clone(),
                label: candidate.label.clone(),
            });
        }

        let mut relations: BTreeMap<(String, String, String), RelatesEdge> = BTreeMap::new();
        for candidate in &extraction.relations {
            let edge = RelatesEdge {
                source_entity_id: entity_id(project, &candidate.subject),
                relationship_type: candidate.predicate.clone(),
                target_entity_id: entity_id(project, &candidate.object),
                confidence: candidate.confidence,
            };
            let key = (
                edge.source_entity_id.clone(),
                edge.relationship_type.clone(),
                edge.target_entity_id.clone(),
            );
            relations.insert(key, edge);
        }

        for entity in entities.values() {
            self.write("upsert_entity", || self.store.upsert_entity(entity)).await?;
            self.write("upsert_mention", || self.store.upsert_mention(file_id, &entity.entity_id))
                .await?;
        }
        for edge in relations.values() {
            self.write("upsert_relation", || self.store.upsert_relation(project, edge))
                .await?;
        }
        Ok((entities.len(), relations.len()))
    }
}

/// Acumulado del pool de consumidores.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub batches_processed: usize,
    pub batches_dead_lettered: usize,
    pub files_dead_lettered: usize,
    pub malformed_messages: usize,
    pub totals: BatchOutcome,
}

/// Pool de consumidores que compiten por las particiones del canal.
pub struct MaterializerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl MaterializerPool {
    /// Lanza `workers` tareas; el trabajador `i` consume de la partición
    /// `i % receivers.len()`.
    pub fn spawn(
        materializer: Arc<Materializer>,
        receivers: Vec<PartitionReceiver>,
        workers: usize,
        dead_letters: Arc<dyn DeadLetterSink>,
        batch_retry: RetryPolicy,
        cancel: CancelSignal,
    ) -> Self {
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let mut handles = Vec::new();
        if receivers.is_empty() {
            return Self { handles, stats };
        }

        for worker in 0..workers.max(1) {
            let receiver = receivers[worker % receivers.len()].clone();
            let ctx = Worker {
                id: worker,
                materializer: materializer.clone(),
                dead_letters: dead_letters.clone(),
                batch_retry,
                stats: stats.clone(),
            };
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { ctx.run(receiver, cancel).await }));
        }
        Self { handles, stats }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Espera a que todos los trabajadores terminen (canal cerrado o cancelación).
    pub async fn join(self) -> ConsumerStats {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Un trabajador del materializador terminó con pánico: {e}");
            }
        }
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

struct Worker {
    id: usize,
    materializer: Arc<Materializer>,
    dead_letters: Arc<dyn DeadLetterSink>,
    batch_retry: RetryPolicy,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl Worker {
    async fn run(self, receiver: PartitionReceiver, cancel: CancelSignal) {
        debug!(worker = self.id, partition = receiver.partition, "Trabajador iniciado");
        loop {
            // La cancelación sólo se observa entre lotes: un lote en curso se
            // termina para no dejar nodos a medias.
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = receiver.recv() => match msg {
                    Some(payload) => payload,
                    None => break,
                },
            };
            self.handle(&payload).await;
        }
        debug!(worker = self.id, "Trabajador detenido");
    }

    async fn handle(&self, payload: &[u8]) {
        let batch = match Batch::from_bytes(payload) {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker = self.id, "Mensaje ilegible descartado: {e}");
                self.update(|s| s.malformed_messages += 1);
                return;
            }
        };

        let outcome = self
            .batch_retry
            .run("process_batch", StoreError::is_retryable, || {
                self.materializer.process_batch(&batch)
            })
            .await;

        match outcome {
            RetryOutcome::Success(result) => self.update(|s| {
                s.batches_processed += 1;
                s.totals.merge(&result);
            }),
            RetryOutcome::Exhausted { last_error: e, .. } | RetryOutcome::Terminal(e) => {
                let files = batch.files.len();
                let batch_id = batch.batch_id;
                let letter = DeadLetter::new(DeadLetterStage::Materialize, e.to_string(), batch);
                if let Err(store_err) = self.dead_letters.store(letter).await {
                    error!(%batch_id, "Lote perdido: no se pudo guardar en dead-letter: {store_err}");
                }
                self.update(|s| {
                    s.batches_dead_lettered += 1;
                    s.files_dead_lettered += files;
                });
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut ConsumerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ExtractionError,
        extraction::{EntityCandidate, RelationCandidate},
        models::{BatchFile, NodeKind},
        store::{MemoryStore, StoredNode},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    struct FixedExtractor;

    #[async_trait]
    impl Extractor for FixedExtractor {
        async fn extract(&self, request: ExtractionRequest<'_>) -> Result<ExtractionResult, ExtractionError> {
            if request.content.contains("boom") {
                return Err(ExtractionError::Unavailable("modelo caído".into()));
            }
            Ok(ExtractionResult {
                entities: vec![
                    EntityCandidate { id: "Parser".into(), label: "Type".into() },
                    EntityCandidate { id: "Lexer".into(), label: "Type".into() },
                ],
                relations: vec![RelationCandidate {
                    subject: "Parser".into(),
                    predicate: "USES".into(),
                    object: "Lexer".into(),
                    confidence: 0.7,
                }],
            })
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 2,
        }
    }

    fn batch(files: Vec<(&str, Option<&str>, u64)>) -> Batch {
        let mut batch = Batch::empty(Uuid::new_v4(), "demo", Uuid::nil());
        for (path, content, size) in files {
            batch.push(BatchFile {
                path: path.into(),
                size_bytes: size,
                last_modified: Utc::now(),
                language: Some("python".into()),
                content: content.map(str::to_string),
                path_only: content.is_none(),
            });
        }
        batch
    }

    fn materializer(store: Arc<MemoryStore>) -> Materializer {
        Materializer::new(store, Arc::new(FixedExtractor), fast())
    }

    #[tokio::test]
    async fn reprocessing_a_batch_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let m = materializer(store.clone());
        let input = batch(vec![("a.py", Some("class Parser"), 12), ("src/util/c.py", None, 3_000_000)]);

        let first = m.process_batch(&input).await.unwrap();
        assert_eq!(first.files_upserted, 2);
        assert_eq!(first.extraction_skipped, 1);
        assert_eq!(first.entities_upserted, 2);

        m.process_batch(&input).await.unwrap();
        assert_eq!(store.count_nodes(NodeKind::File, "demo").await.unwrap(), 2);
        assert_eq!(store.count_nodes(NodeKind::Entity, "demo").await.unwrap(), 2);
        assert_eq!(store.relations().len(), 1);
        assert_eq!(store.mentions().len(), 2);
        // El materializador no coloca ficheros en la jerarquía.
        assert!(store.contains_edges().is_empty());

        match store.node("file:demo:src/util/c.py") {
            Some(StoredNode::File(f)) => assert!(f.path_only),
            other => panic!("nodo inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn extraction_failure_keeps_the_file_node() {
        let store = Arc::new(MemoryStore::new());
        let m = materializer(store.clone());
        let input = batch(vec![("bad.py", Some("boom"), 4), ("ok.py", Some("x"), 1)]);

        let outcome = m.process_batch(&input).await.unwrap();
        assert_eq!(outcome.files_upserted, 2);
        assert_eq!(outcome.extraction_failed, 1);
        assert_eq!(store.count_nodes(NodeKind::File, "demo").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn short_outage_is_absorbed_by_retries() {
        let store = Arc::new(MemoryStore::new());
        let m = materializer(store.clone());
        store.fail_next(1);
        let outcome = m.process_batch(&batch(vec![("a.py", None, 1)])).await.unwrap();
        assert_eq!(outcome.files_upserted, 1);
    }

    #[tokio::test]
    async fn persistent_outage_fails_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let m = materializer(store.clone());
        store.fail_next(100);
        let err = m.process_batch(&batch(vec![("a.py", None, 1)])).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn pool_dead_letters_batches_after_exhausting_retries() {
        use crate::{channel::{BatchChannel, MemoryChannel}, dead_letter::MemoryDeadLetterSink};

        let store = Arc::new(MemoryStore::new());
        let m = Arc::new(materializer(store.clone()));
        let (channel, receivers) = MemoryChannel::new(2, 16, 1 << 20);
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let pool = MaterializerPool::spawn(m, receivers, 2, sink.clone(), fast(), CancelSignal::new());

        // Suficientes fallos para agotar reintentos por operación y por lote.
        store.fail_next(4);
        let doomed = batch(vec![("x.py", None, 1)]);
        channel.publish("demo", doomed.to_bytes().unwrap()).await.unwrap();
        // Espera a que el primer lote agote sus reintentos antes de enviar el segundo.
        while sink.letters().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        channel
            .publish("demo", batch(vec![("y.py", None, 1)]).to_bytes().unwrap())
            .await
            .unwrap();
        channel.publish("demo", b"no es json".to_vec()).await.unwrap();
        drop(channel);

        let stats = pool.join().await;
        assert_eq!(stats.batches_dead_lettered, 1);
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.malformed_messages, 1);
        assert_eq!(sink.letters()[0].stage, DeadLetterStage::Materialize);
        assert_eq!(store.count_nodes(NodeKind::File, "demo").await.unwrap(), 1);
    }
}
