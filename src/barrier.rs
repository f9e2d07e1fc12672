//! Barrera de finalización: espera, sondeando el almacén, a que los
//! consumidores hayan materializado los ficheros publicados.
//!
//! Que el `Dispatcher` haya publicado no dice nada del progreso de los
//! consumidores; esta barrera observa el segundo estado por separado.
//!
//! Con `for_run` sólo cuentan los ficheros escritos por esa ejecución, así
//! que los que ya existían de ejecuciones anteriores no adelantan la barrera.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::StoreError, models::NodeKind, store::GraphStore};

/// Espera máxima admitida; valores mayores se recortan.
pub const MAX_BARRIER_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierConfig {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct CompletionBarrier {
    store: Arc<dyn GraphStore>,
    run_id: Option<Uuid>,
}

impl CompletionBarrier {
    /// Barrera sobre todos los ficheros del proyecto.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store, run_id: None }
    }

    /// Barrera sobre los ficheros que escribió la ejecución `run_id`.
    pub fn for_run(store: Arc<dyn GraphStore>, run_id: Uuid) -> Self {
        Self {
            store,
            run_id: Some(run_id),
        }
    }

    async fn materialized(&self, project_name: &str) -> Result<u64, StoreError> {
        match self.run_id {
            Some(run_id) => self.store.count_run_files(project_name, run_id).await,
            None => self.store.count_nodes(NodeKind::File, project_name).await,
        }
    }

    /// `true` si el proyecto alcanza `expected_count` ficheros antes de
    /// `max_wait`. `false` no es un error: indica modo degradado.
    pub async fn wait_for_count(
        &self,
        project_name: &str,
        expected_count: u64,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> bool {
        let max_wait = max_wait.min(MAX_BARRIER_WAIT);
        let deadline = Instant::now() + max_wait;
        let mut last_seen = 0;

        loop {
            match self.materialized(project_name).await {
                Ok(count) if count >= expected_count => {
                    info!(project = project_name, count, expected_count, "Barrera superada");
                    return true;
                }
                Ok(count) => {
                    debug!(project = project_name, count, expected_count, "Materialización en curso");
                    last_seen = count;
                }
                Err(e) => warn!(project = project_name, "Error sondeando el almacén: {e}"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    project = project_name,
                    materialized = last_seen,
                    expected_count,
                    ?max_wait,
                    "Barrera agotada: se continúa en modo degradado"
                );
                return false;
            }
            tokio::time::sleep(poll_interval.max(Duration::from_millis(1)).min(deadline - now)).await;
        }
    }

    pub async fn wait(&self, project_name: &str, expected_count: u64, config: BarrierConfig) -> bool {
        self.wait_for_count(project_name, expected_count, config.max_wait, config.poll_interval)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hierarchy, models::FileNode, store::MemoryStore};
    use chrono::Utc;

    fn file(path: &str) -> FileNode {
        FileNode {
            entity_id: crate::models::file_id("demo", path),
            project_name: "demo".into(),
            path: path.into(),
            extension: hierarchy::extension_of(path),
            language: None,
            size_bytes: 1,
            last_modified: Utc::now(),
            path_only: true,
            run_id: None,
        }
    }

    #[tokio::test]
    async fn returns_true_once_the_count_is_reached() {
        let store = Arc::new(MemoryStore::new());
        let barrier = CompletionBarrier::new(store.clone());

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    store.upsert_file(&file(&format!("f{i}.py"))).await.unwrap();
                }
            })
        };

        let ready = barrier
            .wait_for_count("demo", 5, Duration::from_secs(5), Duration::from_millis(2))
            .await;
        writer.await.unwrap();
        assert!(ready);
    }

    #[tokio::test]
    async fn times_out_without_error() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..40 {
            store.upsert_file(&file(&format!("f{i}.py"))).await.unwrap();
        }
        let barrier = CompletionBarrier::new(store);

        let started = std::time::Instant::now();
        let ready = barrier
            .wait_for_count("demo", 100, Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn run_scoped_barrier_ignores_files_from_earlier_runs() {
        let store = Arc::new(MemoryStore::new());
        let (previous, current) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..10 {
            let node = FileNode {
                run_id: Some(previous),
                ..file(&format!("f{i}.py"))
            };
            store.upsert_file(&node).await.unwrap();
        }

        let project_wide = CompletionBarrier::new(store.clone());
        assert!(
            project_wide
                .wait_for_count("demo", 10, Duration::from_millis(20), Duration::from_millis(5))
                .await
        );

        let scoped = CompletionBarrier::for_run(store.clone(), current);
        assert!(
            !scoped
                .wait_for_count("demo", 10, Duration::from_millis(30), Duration::from_millis(5))
                .await
        );

        for i in 0..10 {
            let node = FileNode {
                run_id: Some(current),
                ..file(&format!("f{i}.py"))
            };
            store.upsert_file(&node).await.unwrap();
        }
        assert!(
            scoped
                .wait_for_count("demo", 10, Duration::from_millis(30), Duration::from_millis(5))
                .await
        );
    }

    #[tokio::test]
    async fn huge_waits_are_clamped_instead_of_overflowing() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("a.py")).await.unwrap();
        let barrier = CompletionBarrier::new(store);

        assert!(
            barrier
                .wait_for_count("demo", 1, Duration::MAX, Duration::ZERO)
                .await
        );
    }

    #[tokio::test]
    async fn poll_errors_do_not_abort_the_wait() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("a.py")).await.unwrap();
        store.fail_next(2);
        let barrier = CompletionBarrier::new(store);

        assert!(
            barrier
                .wait_for_count("demo", 1, Duration::from_secs(1), Duration::from_millis(1))
                .await
        );
    }
}
