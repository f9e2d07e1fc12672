//! Reparación de huérfanos: nodos `File`/`Directory` sin arista `CONTAINS`
//! entrante.
//!
//! La cadena de ancestros se deduce del `path` del propio huérfano, nunca de
//! eventos externos. Sólo hace upserts, así que puede correr a la vez que la
//! ingesta y repetirse sobre un grafo sano (`orphans_found == 0`).

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::StoreError,
    hierarchy::HierarchyPlan,
    models::{ContainsEdge, DirectoryNode, OrphanRow},
    retry::RetryPolicy,
    store::GraphStore,
    tree::write_in_chunks,
};

/// Alcance de la reconciliación.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    All,
    Project(String),
}

impl ReconcileScope {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "all" | "*" => Self::All,
            name => Self::Project(name.to_string()),
        }
    }

    fn project(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Project(name) => Some(name),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub orphans_found: usize,
    pub orphans_fixed: usize,
    pub directories_created: usize,
    pub edges_created: usize,
}

pub struct OrphanReconciler {
    store: Arc<dyn GraphStore>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl OrphanReconciler {
    pub fn new(store: Arc<dyn GraphStore>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub async fn reconcile(&self, scope: &ReconcileScope) -> Result<ReconcileReport, StoreError> {
        let orphans = self.scan(scope).await?;
        let mut report = ReconcileReport {
            orphans_found: orphans.len(),
            ..Default::default()
        };
        if orphans.is_empty() {
            info!(?scope, "Grafo sano: sin huérfanos");
            return Ok(report);
        }

        // Proyecto → plan, para dar de alta cada proyecto una sola vez.
        let mut plans: BTreeMap<&str, HierarchyPlan> = BTreeMap::new();
        for orphan in &orphans {
            if orphan.path.is_empty() {
                warn!(entity_id = %orphan.entity_id, "Huérfano sin ruta: no se puede deducir su padre");
                continue;
            }
            plans
                .entry(orphan.project_name.as_str())
                .or_default()
                .add_chain(&orphan.project_name, orphan.kind, &orphan.path);
        }

        for (project, plan) in plans {
            self.retry
                .run("upsert_project", StoreError::is_retryable, || {
                    self.store.upsert_project(project)
                })
                .await
                .into_result()?;

            let directories: Vec<DirectoryNode> = plan.directories.into_iter().collect();
            let edges: Vec<ContainsEdge> = plan.edges.into_iter().collect();
            report.directories_created += write_in_chunks(&self.retry, &directories, self.batch_size, |chunk| {
                self.store.upsert_directories(chunk)
            })
            .await?;
            report.edges_created += write_in_chunks(&self.retry, &edges, self.batch_size, |chunk| {
                self.store.upsert_contains(chunk)
            })
            .await?;
        }

        // Un huérfano está arreglado si ya no aparece en un nuevo escaneo.
        let remaining: HashSet<String> = self
            .scan(scope)
            .await?
            .into_iter()
            .map(|r| r.entity_id)
            .collect();
        report.orphans_fixed = orphans
            .iter()
            .filter(|o| !remaining.contains(&o.entity_id))
            .count();

        info!(
            ?scope,
            found = report.orphans_found,
            fixed = report.orphans_fixed,
            directories_created = report.directories_created,
            edges_created = report.edges_created,
            "Reconciliación terminada"
        );
        Ok(report)
    }

    async fn scan(&self, scope: &ReconcileScope) -> Result<Vec<OrphanRow>, StoreError> {
        self.retry
            .run("find_orphans", StoreError::is_retryable, || {
                self.store.find_orphans(scope.project())
            })
            .await
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hierarchy,
        models::{FileNode, NodeKind},
        store::MemoryStore,
        tree::TreeBuilder,
    };
    use chrono::Utc;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    fn file(project: &str, path: &str) -> FileNode {
        FileNode {
            entity_id: crate::models::file_id(project, path),
            project_name: project.into(),
            path: path.into(),
            extension: hierarchy::extension_of(path),
            language: None,
            size_bytes: 1,
            last_modified: Utc::now(),
            path_only: false,
            run_id: None,
        }
    }

    #[tokio::test]
    async fn repairs_files_ingested_without_a_tree() {
        let store = Arc::new(MemoryStore::new());
        for path in ["a.py", "src/b.py", "src/util/c.py"] {
            store.upsert_file(&file("demo", path)).await.unwrap();
        }
        let reconciler = OrphanReconciler::new(store.clone(), 1000, retry());

        let report = reconciler
            .reconcile(&ReconcileScope::Project("demo".into()))
            .await
            .unwrap();
        assert_eq!(report.orphans_found, 3);
        assert_eq!(report.orphans_fixed, 3);
        assert_eq!(report.directories_created, 2);
        assert_eq!(store.count_nodes(NodeKind::Project, "demo").await.unwrap(), 1);

        let again = reconciler.reconcile(&ReconcileScope::All).await.unwrap();
        assert_eq!(again, ReconcileReport::default());
    }

    #[tokio::test]
    async fn repairs_a_detached_directory_chain() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("demo", "src/util/c.py")).await.unwrap();
        TreeBuilder::new(store.clone(), 100, retry())
            .build("demo")
            .await
            .unwrap();

        // Se pierde la arista que cuelga `src/util` de `src`.
        assert!(store.remove_contains("dir:demo:src", "dir:demo:src/util"));
        let reconciler = OrphanReconciler::new(store.clone(), 1000, retry());
        let report = reconciler.reconcile(&ReconcileScope::All).await.unwrap();

        assert_eq!(report.orphans_found, 1);
        assert_eq!(report.orphans_fixed, 1);
        assert_eq!(report.directories_created, 0);
        assert_eq!(report.edges_created, 1);
    }

    #[tokio::test]
    async fn scope_limits_the_repair_to_one_project() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("a", "x/1.rs")).await.unwrap();
        store.upsert_file(&file("b", "y/2.rs")).await.unwrap();
        let reconciler = OrphanReconciler::new(store.clone(), 1000, retry());

        let report = reconciler
            .reconcile(&ReconcileScope::Project("a".into()))
            .await
            .unwrap();
        assert_eq!(report.orphans_fixed, 1);
        assert_eq!(store.find_orphans(Some("b")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_orphan_sets_count_unrepairable_rows_as_unfixed() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5_000 {
            let path = format!("pkg{}/mod{i}.py", i % 50);
            store.upsert_file(&file("big", &path)).await.unwrap();
        }
        // Sin ruta no hay padre que deducir.
        store.upsert_file(&file("big", "")).await.unwrap();
        let reconciler = OrphanReconciler::new(store.clone(), 1000, retry());

        let report = reconciler.reconcile(&ReconcileScope::All).await.unwrap();
        assert_eq!(report.orphans_found, 5_001);
        assert_eq!(report.orphans_fixed, 5_000);
        assert_eq!(report.directories_created, 50);
        assert_eq!(store.find_orphans(Some("big")).await.unwrap().len(), 1);
    }

    #[test]
    fn parses_scope() {
        assert_eq!(ReconcileScope::parse("all"), ReconcileScope::All);
        assert_eq!(ReconcileScope::parse(""), ReconcileScope::All);
        assert_eq!(
            ReconcileScope::parse("demo"),
            ReconcileScope::Project("demo".into())
        );
    }
}
