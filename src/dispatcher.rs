//! Publicación de lotes en el canal: paso final del productor.
//!
//! Cada lote se publica de forma independiente. Un rechazo por tamaño
//! provoca una re-partición con la mitad de presupuesto (profundidad
//! acotada); los fallos transitorios se reintentan con backoff y, agotados
//! los intentos, el lote va a dead-letter. La cancelación se comprueba
//! antes de cada envío, también entre los sub-lotes de una re-partición.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cancel::CancelSignal,
    channel::BatchChannel,
    dead_letter::{DeadLetter, DeadLetterSink, DeadLetterStage},
    error::TransportError,
    models::Batch,
    packer::split_batch,
    retry::{RetryOutcome, RetryPolicy},
};

/// Contadores de publicación.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub batches_published: usize,
    pub files_published: usize,
    /// Lotes rechazados por tamaño y re-partidos.
    pub batches_split: usize,
    pub batches_dead_lettered: usize,
    pub files_dead_lettered: usize,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn merge(&mut self, other: &DispatchReport) {
        self.batches_published += other.batches_published;
        self.files_published += other.files_published;
        self.batches_split += other.batches_split;
        self.batches_dead_lettered += other.batches_dead_lettered;
        self.files_dead_lettered += other.files_dead_lettered;
        self.cancelled |= other.cancelled;
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn BatchChannel>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    max_split_depth: u32,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn BatchChannel>,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
        max_split_depth: u32,
    ) -> Self {
        Self {
            channel,
            dead_letters,
            retry,
            max_split_depth,
        }
    }

    /// Publica los lotes en orden, comprobando la cancelación antes de cada uno.
    pub async fn publish_all(
        &self,
        batches: impl IntoIterator<Item = Batch>,
        cancel: &CancelSignal,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for batch in batches {
            let partial = self.publish(batch, cancel).await;
            report.merge(&partial);
            if report.cancelled {
                break;
            }
        }
        info!(
            published = report.batches_published,
            split = report.batches_split,
            dead_lettered = report.batches_dead_lettered,
            "Publicación terminada"
        );
        report
    }

    /// Publica un lote (y, si hace falta, sus sub-lotes).
    pub async fn publish(&self, batch: Batch, cancel: &CancelSignal) -> DispatchReport {
        self.publish_tracked(batch, cancel).await.0
    }

    /// Como `publish`, devolviendo además los ids enviados a dead-letter.
    async fn publish_tracked(&self, batch: Batch, cancel: &CancelSignal) -> (DispatchReport, Vec<Uuid>) {
        let mut report = DispatchReport::default();
        let mut dead = Vec::new();
        // Pila LIFO con hijos apilados al revés para conservar el orden.
        let mut pending = vec![(batch, 0u32)];

        while let Some((batch, depth)) = pending.pop() {
            if cancel.is_cancelled() {
                let files = batch.files.len()
                    + pending.iter().map(|(b, _)| b.files.len()).sum::<usize>();
                warn!(
                    batch_id = %batch.batch_id,
                    pending_batches = pending.len() + 1,
                    pending_files = files,
                    "Ejecución cancelada: se detiene la publicación entre lotes"
                );
                report.cancelled = true;
                break;
            }

            let payload = match batch.to_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    dead.push(batch.batch_id);
                    self.dead_letter(&mut report, batch, DeadLetterStage::Publish, e.to_string())
                        .await;
                    continue;
                }
            };
            let payload_len = payload.len();

            let outcome = self
                .retry
                .run("publish", TransportError::is_retryable, || {
                    self.channel.publish(&batch.project_name, payload.clone())
                })
                .await;

            match outcome {
                RetryOutcome::Success(()) => {
                    report.batches_published += 1;
                    report.files_published += batch.files.len();
                }
                RetryOutcome::Terminal(TransportError::PayloadTooLarge { size, limit })
                    if depth < self.max_split_depth && batch.files.len() > 1 =>
                {
                    let budget = payload_len.min(limit) / 2;
                    warn!(
                        batch_id = %batch.batch_id,
                        size,
                        limit,
                        budget,
                        depth,
                        "Lote rechazado por tamaño: se re-parte"
                    );
                    match split_batch(&batch, budget, depth + 1) {
                        Ok(parts) => {
                            report.batches_split += 1;
                            for child in parts.batches.into_iter().rev() {
                                pending.push((child, depth + 1));
                            }
                        }
                        Err(e) => {
                            dead.push(batch.batch_id);
                            self.dead_letter(&mut report, batch, DeadLetterStage::Publish, e.to_string())
                                .await
                        }
                    }
                }
                RetryOutcome::Terminal(err) => {
                    let reason = format!("{err} (profundidad de partición {depth})");
                    dead.push(batch.batch_id);
                    self.dead_letter(&mut report, batch, DeadLetterStage::Publish, reason)
                        .await;
                }
                RetryOutcome::Exhausted {
                    attempts,
                    last_error,
                } => {
                    let reason = format!("{last_error} tras {attempts} intentos");
                    dead.push(batch.batch_id);
                    self.dead_letter(&mut report, batch, DeadLetterStage::Publish, reason)
                        .await;
                }
            }
        }
        (report, dead)
    }

    async fn dead_letter(
        &self,
        report: &mut DispatchReport,
        batch: Batch,
        stage: DeadLetterStage,
        reason: String,
    ) {
        report.batches_dead_lettered += 1;
        report.files_dead_lettered += batch.files.len();
        let batch_id = batch.batch_id;
        if let Err(e) = self
            .dead_letters
            .store(DeadLetter::new(stage, reason, batch))
            .await
        {
            warn!(%batch_id, "No se pudo guardar el lote en dead-letter: {e}");
        }
    }

    /// Ficheros de la ejecución `correlation_id` que los consumidores
    /// enviaron a dead-letter hasta ahora.
    pub async fn consumer_dead_letters(&self, correlation_id: Uuid) -> usize {
        match self.dead_letters.pending().await {
            Ok(letters) => letters
                .iter()
                .filter(|l| l.stage == DeadLetterStage::Materialize)
                .filter(|l| l.batch.correlation_id == correlation_id)
                .map(|l| l.batch.files.len())
                .sum(),
            Err(e) => {
                warn!(%correlation_id, "No se pudieron leer las dead-letters: {e}");
                0
            }
        }
    }

    /// Re-publica las cartas pendientes.
    ///
    /// La carta sólo se confirma después de publicar. Si el lote vuelve a
    /// fallar entero, su carta se sobrescribe y sigue pendiente; si se
    /// re-parte, los sub-lotes fallidos quedan con carta propia y la original
    /// se confirma. La entrega es al-menos-una-vez: un lote puede llegar dos
    /// veces si falla la confirmación, y los upserts lo absorben.
    pub async fn replay_dead_letters(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        let letters = match self.dead_letters.pending().await {
            Ok(letters) => letters,
            Err(e) => {
                warn!("No se pudieron leer las dead-letters: {e}");
                return report;
            }
        };

        let cancel = CancelSignal::new();
        for letter in letters {
            let batch_id = letter.batch.batch_id;
            let (partial, dead) = self.publish_tracked(letter.batch.clone(), &cancel).await;
            report.merge(&partial);
            if dead.contains(&batch_id) {
                warn!(%batch_id, "El lote reprocesado volvió a fallar: la carta sigue pendiente");
                continue;
            }
            if let Err(e) = self.dead_letters.acknowledge(&letter).await {
                warn!(%batch_id, "No se pudo confirmar la carta: {e}");
            }
        }
        report
    }
}
