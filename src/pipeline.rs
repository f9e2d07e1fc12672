//! Orquestación de una ejecución: empaquetar → publicar → barrera → árbol.
//!
//! El productor nunca asume que "publicado" equivale a "materializado": si la
//! barrera se agota, el árbol se difiere y queda en manos del reconciliador,
//! que corre al cierre de cada ejecución y, además, de forma periódica.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::Status,
    barrier::{BarrierConfig, CompletionBarrier},
    cancel::CancelSignal,
    discovery,
    dispatcher::{DispatchReport, Dispatcher},
    error::{PipelineError, StoreError},
    models::FileRecord,
    packer::{BatchPacker, PackLimits},
    reconciler::{OrphanReconciler, ReconcileReport, ReconcileScope},
    retry::RetryPolicy,
    store::GraphStore,
    tree::{TreeBuilder, TreeReport},
};

/// Dependencias compartidas por todas las ejecuciones.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn GraphStore>,
    pub dispatcher: Dispatcher,
    pub limits: PackLimits,
    pub barrier: BarrierConfig,
    pub retry: RetryPolicy,
    pub tree_batch_size: usize,
    pub reconcile_batch_size: usize,
}

impl PipelineContext {
    pub fn tree_builder(&self) -> TreeBuilder {
        TreeBuilder::new(self.store.clone(), self.tree_batch_size, self.retry)
    }

    pub fn reconciler(&self) -> OrphanReconciler {
        OrphanReconciler::new(self.store.clone(), self.reconcile_batch_size, self.retry)
    }

    pub async fn reconcile(&self, scope: &ReconcileScope) -> Result<ReconcileReport, StoreError> {
        self.reconciler().reconcile(scope).await
    }
}

/// Resumen de una ejecución. Los fallos por fichero o por lote se cuentan
/// aquí en lugar de abortar la ejecución.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub project: String,
    pub correlation_id: Uuid,
    pub files_discovered: usize,
    pub files_packed: usize,
    pub batches_packed: usize,
    pub packing_anomalies: usize,
    pub batches_published: usize,
    pub batches_split: usize,
    pub files_dead_lettered: usize,
    /// Ficheros de esta ejecución que los consumidores abandonaron.
    pub files_dead_lettered_by_consumers: usize,
    pub cancelled: bool,
    pub barrier_ready: bool,
    /// El árbol no se construyó; lo completará el reconciliador.
    pub tree_deferred: bool,
    pub tree: Option<TreeReport>,
    /// Reconciliación del proyecto al cierre de la ejecución.
    pub reconcile: Option<ReconcileReport>,
    pub warnings: Vec<String>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen '{}': {} ficheros empaquetados en {} lotes ({} anomalías), {} lotes publicados, {} re-partidos, {} ficheros en dead-letter ({} desde los consumidores).",
            self.project,
            self.files_packed,
            self.batches_packed,
            self.packing_anomalies,
            self.batches_published,
            self.batches_split,
            self.files_dead_lettered,
            self.files_dead_lettered_by_consumers
        )?;
        if self.cancelled {
            write!(f, " Ejecución cancelada.")?;
        }
        match (&self.tree, self.tree_deferred) {
            (Some(tree), _) => write!(
                f,
                " Árbol: {} directorios y {} aristas nuevas.",
                tree.directories_created, tree.edges_created
            )?,
            (None, true) => write!(f, " Árbol diferido a la reconciliación.")?,
            (None, false) => {}
        }
        if let Some(reconcile) = &self.reconcile {
            write!(
                f,
                " Huérfanos: {} encontrados, {} reparados.",
                reconcile.orphans_found, reconcile.orphans_fixed
            )?;
        }
        Ok(())
    }
}

/// Nombre de proyecto por defecto: el nombre del directorio raíz.
pub fn project_name_for(root: &Path) -> String {
    root.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Recorre `root` y ejecuta la ingesta completa. El recorrido alimenta al
/// empaquetador a medida que avanza: nunca se tiene el corpus entero en memoria.
pub async fn ingest_directory(
    ctx: &PipelineContext,
    root: &Path,
    project: &str,
    cancel: &CancelSignal,
    status: &Arc<Mutex<Status>>,
) -> Result<RunSummary, PipelineError> {
    Status::set(status, format!("Recorriendo {}...", root.display()), 0.0);
    let mut discovery = discovery::discover(root, ctx.limits.max_inline_file_bytes)?;
    let mut summary = run_ingestion(ctx, project, &mut discovery, Uuid::new_v4(), cancel, status).await?;

    let stats = discovery.stats();
    info!(
        project,
        scanned = stats.files_scanned,
        skipped = stats.files_skipped,
        "Recorrido terminado"
    );
    summary.files_discovered = stats.files_scanned;
    Ok(summary)
}

/// Ejecuta una ingesta sobre un flujo de registros. Cada lote se publica en
/// cuanto el empaquetador lo cierra.
pub async fn run_ingestion<I>(
    ctx: &PipelineContext,
    project: &str,
    records: I,
    correlation_id: Uuid,
    cancel: &CancelSignal,
    status: &Arc<Mutex<Status>>,
) -> Result<RunSummary, PipelineError>
where
    I: IntoIterator<Item = FileRecord>,
{
    let mut summary = RunSummary {
        project: project.to_string(),
        correlation_id,
        ..Default::default()
    };

    // Si el almacén no responde ni para esto, la ejecución falla entera.
    ctx.retry
        .run("upsert_project", StoreError::is_retryable, || {
            ctx.store.upsert_project(project)
        })
        .await
        .into_result()?;

    // 1) Empaquetado y publicación, lote a lote.
    Status::set(status, "Empaquetando y publicando lotes...", 0.1);
    let packer = BatchPacker::new(project, correlation_id, ctx.limits);
    let mut dispatch = DispatchReport::default();
    for packed in packer.stream(records) {
        let packed = packed?;
        summary.files_packed += packed.batch.files.len();
        summary.batches_packed += 1;
        if let Some(anomaly) = packed.anomaly {
            summary.packing_anomalies += 1;
            summary.warnings.push(format!(
                "{} ocupa {} bytes serializado (presupuesto {})",
                anomaly.path, anomaly.serialized_bytes, anomaly.max_batch_bytes
            ));
        }

        let partial = ctx.dispatcher.publish(packed.batch, cancel).await;
        dispatch.merge(&partial);
        if dispatch.cancelled {
            break;
        }
        Status::set(
            status,
            format!("{} lotes publicados...", dispatch.batches_published),
            0.3,
        );
    }
    summary.files_discovered = summary.files_packed;
    summary.batches_published = dispatch.batches_published;
    summary.batches_split = dispatch.batches_split;
    summary.files_dead_lettered = dispatch.files_dead_lettered;
    summary.cancelled = dispatch.cancelled;
    info!(
        project,
        published = dispatch.batches_published,
        split = dispatch.batches_split,
        dead_lettered = dispatch.batches_dead_lettered,
        "Publicación terminada"
    );

    if summary.cancelled {
        summary.tree_deferred = true;
        warn!(project, "Ejecución cancelada tras publicar {} lotes", summary.batches_published);
        return Ok(summary);
    }

    // 2) Barrera: publicado no implica materializado, y sólo cuentan los
    // ficheros que ha escrito esta ejecución.
    let expected = dispatch.files_published as u64;
    Status::set(
        status,
        format!("Esperando la materialización de {expected} ficheros..."),
        0.6,
    );
    summary.barrier_ready = CompletionBarrier::for_run(ctx.store.clone(), correlation_id)
        .wait(project, expected, ctx.barrier)
        .await;
    summary.files_dead_lettered_by_consumers =
        ctx.dispatcher.consumer_dead_letters(correlation_id).await;

    if summary.barrier_ready {
        // 3) Árbol de contención
        Status::set(status, "Construyendo la jerarquía de directorios...", 0.85);
        match ctx.tree_builder().build(project).await {
            Ok(tree) => summary.tree = Some(tree),
            Err(e) => {
                error!(project, "No se pudo construir el árbol: {e}");
                summary.tree_deferred = true;
                summary.warnings.push(format!("Árbol no construido: {e}"));
            }
        }
    } else {
        summary.tree_deferred = true;
        summary
            .warnings
            .push("Barrera agotada: árbol diferido a la reconciliación".to_string());
    }

    // 4) Reparación de lo que ya esté materializado; lo que llegue más tarde
    // lo recoge la reconciliación periódica.
    Status::set(status, "Reconciliando huérfanos...", 0.95);
    match ctx.reconcile(&ReconcileScope::Project(project.to_string())).await {
        Ok(report) => summary.reconcile = Some(report),
        Err(e) => {
            warn!(project, "Reconciliación al cierre fallida: {e}");
            summary.warnings.push(format!("Reconciliación no completada: {e}"));
        }
    }

    info!("{summary}");
    Ok(summary)
}

/// Lanza la reconciliación periódica. Devuelve `None` si `every` es cero.
/// Cada pasada guarda su informe en `last`; un error se registra y la
/// siguiente pasada lo reintenta.
pub fn spawn_reconcile_loop(
    ctx: PipelineContext,
    scope: ReconcileScope,
    every: Duration,
    cancel: CancelSignal,
    last: Arc<Mutex<Option<ReconcileReport>>>,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        info!("Reconciliación periódica desactivada");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // El primer tick es inmediato; la primera pasada espera un periodo.
        ticker.tick().await;
        info!(?scope, ?every, "Reconciliación periódica activa");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match ctx.reconcile(&scope).await {
                Ok(report) => {
                    if let Ok(mut slot) = last.lock() {
                        *slot = Some(report);
                    }
                }
                Err(e) => warn!(?scope, "Reconciliación periódica fallida: {e}"),
            }
        }
        info!("Reconciliación periódica detenida");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_comes_from_the_root() {
        assert_eq!(project_name_for(Path::new("/tmp/demo")), "demo");
        assert_eq!(project_name_for(Path::new("/")), "default");
    }

    #[test]
    fn summary_mentions_deferral() {
        let summary = RunSummary {
            project: "demo".into(),
            tree_deferred: true,
            ..Default::default()
        };
        assert!(summary.to_string().contains("diferido"));
    }

    #[tokio::test]
    async fn reconcile_loop_stops_on_cancel_and_zero_disables_it() {
        use crate::{
            channel::MemoryChannel, dead_letter::MemoryDeadLetterSink, models::FileNode,
            store::MemoryStore,
        };

        let store = Arc::new(MemoryStore::new());
        let node = FileNode {
            entity_id: crate::models::file_id("demo", "src/a.py"),
            project_name: "demo".into(),
            path: "src/a.py".into(),
            extension: "py".into(),
            language: None,
            size_bytes: 1,
            last_modified: chrono::Utc::now(),
            path_only: true,
            run_id: None,
        };
        store.upsert_file(&node).await.unwrap();

        let (channel, _receivers) = MemoryChannel::new(1, 4, 1 << 20);
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 2,
        };
        let ctx = PipelineContext {
            store: store.clone(),
            dispatcher: Dispatcher::new(Arc::new(channel), Arc::new(MemoryDeadLetterSink::new()), retry, 2),
            limits: PackLimits {
                max_batch_bytes: 4096,
                max_inline_file_bytes: 1024,
            },
            barrier: BarrierConfig::default(),
            retry,
            tree_batch_size: 100,
            reconcile_batch_size: 100,
        };

        let last = Arc::new(Mutex::new(None));
        let cancel = CancelSignal::new();
        assert!(spawn_reconcile_loop(
            ctx.clone(),
            ReconcileScope::All,
            Duration::ZERO,
            cancel.clone(),
            last.clone()
        )
        .is_none());

        let handle = spawn_reconcile_loop(
            ctx,
            ReconcileScope::All,
            Duration::from_millis(10),
            cancel.clone(),
            last.clone(),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while last.lock().unwrap().is_none() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let first = last.lock().unwrap().expect("sin pasada periódica");
        assert_eq!(first.orphans_found, first.orphans_fixed);
        assert!(store.find_orphans(Some("demo")).await.unwrap().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("el bucle no se detuvo")
            .unwrap();
    }
}
