//! Construcción de la jerarquía Project → Directory → File a partir de los
//! ficheros ya materializados. Todo son upserts: repetir `build` sobre un
//! árbol correcto no crea nada.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::{
    error::StoreError,
    hierarchy::HierarchyPlan,
    models::{ContainsEdge, DirectoryNode, NodeKind},
    retry::RetryPolicy,
    store::GraphStore,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    pub files_seen: usize,
    pub directories_created: usize,
    pub edges_created: usize,
}

pub struct TreeBuilder {
    store: Arc<dyn GraphStore>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl TreeBuilder {
    pub fn new(store: Arc<dyn GraphStore>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub async fn build(&self, project_name: &str) -> Result<TreeReport, StoreError> {
        let paths = self
            .retry
            .run("file_paths", StoreError::is_retryable, || {
                self.store.file_paths(project_name)
            })
            .await
            .into_result()?;

        let mut plan = HierarchyPlan::new();
        for path in &paths {
            plan.add_chain(project_name, NodeKind::File, path);
        }

        self.retry
            .run("upsert_project", StoreError::is_retryable, || {
                self.store.upsert_project(project_name)
            })
            .await
            .into_result()?;

        let directories: Vec<DirectoryNode> = plan.directories.into_iter().collect();
        let edges: Vec<ContainsEdge> = plan.edges.into_iter().collect();

        let directories_created = write_in_chunks(&self.retry, &directories, self.batch_size, |chunk| {
            self.store.upsert_directories(chunk)
        })
        .await?;
        let edges_created = write_in_chunks(&self.retry, &edges, self.batch_size, |chunk| {
            self.store.upsert_contains(chunk)
        })
        .await?;

        let report = TreeReport {
            files_seen: paths.len(),
            directories_created,
            edges_created,
        };
        info!(
            project = project_name,
            files = report.files_seen,
            directories_created,
            edges_created,
            "Árbol de contención construido"
        );
        Ok(report)
    }
}

/// Escribe `rows` en trozos de `chunk_size`, cada uno con su propio
/// reintento, y suma lo que devuelva cada escritura.
pub(crate) async fn write_in_chunks<'a, T, F, Fut>(
    retry: &RetryPolicy,
    rows: &'a [T],
    chunk_size: usize,
    mut write: F,
) -> Result<usize, StoreError>
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: std::future::Future<Output = Result<usize, StoreError>>,
{
    let mut total = 0;
    for chunk in rows.chunks(chunk_size.max(1)) {
        total += retry
            .run("batched_write", StoreError::is_retryable, || write(chunk))
            .await
            .into_result()?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hierarchy, models::FileNode, store::MemoryStore};
    use chrono::Utc;
    use std::time::Duration;

    fn file(path: &str) -> FileNode {
        FileNode {
            entity_id: crate::models::file_id("demo", path),
            project_name: "demo".into(),
            path: path.into(),
            extension: hierarchy::extension_of(path),
            language: None,
            size_bytes: 1,
            last_modified: Utc::now(),
            path_only: false,
            run_id: None,
        }
    }

    fn builder(store: Arc<MemoryStore>, batch_size: usize) -> TreeBuilder {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 3,
        };
        TreeBuilder::new(store, batch_size, retry)
    }

    #[tokio::test]
    async fn builds_the_demo_tree() {
        let store = Arc::new(MemoryStore::new());
        for path in ["a.py", "src/b.py", "src/util/c.py"] {
            store.upsert_file(&file(path)).await.unwrap();
        }

        let report = builder(store.clone(), 100).build("demo").await.unwrap();
        assert_eq!(report.files_seen, 3);
        assert_eq!(report.directories_created, 2);
        assert_eq!(report.edges_created, 5);
        assert_eq!(store.count_nodes(NodeKind::Directory, "demo").await.unwrap(), 2);
        assert_eq!(store.count_nodes(NodeKind::Project, "demo").await.unwrap(), 1);
        assert!(store.find_orphans(Some("demo")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuild_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        for path in ["a/b/c/d.rs", "a/b/e.rs", "a/f.rs"] {
            store.upsert_file(&file(path)).await.unwrap();
        }
        let tree = builder(store.clone(), 2);
        tree.build("demo").await.unwrap();
        let edges_before = store.contains_edges();

        let again = tree.build("demo").await.unwrap();
        assert_eq!(again.directories_created, 0);
        assert_eq!(again.edges_created, 0);
        assert_eq!(store.contains_edges(), edges_before);
    }

    #[tokio::test]
    async fn growing_file_set_only_adds_what_is_new() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("src/a.rs")).await.unwrap();
        let tree = builder(store.clone(), 100);
        tree.build("demo").await.unwrap();

        store.upsert_file(&file("src/net/b.rs")).await.unwrap();
        let report = tree.build("demo").await.unwrap();
        assert_eq!(report.directories_created, 1);
        assert_eq!(report.edges_created, 2);
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried_per_chunk() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_file(&file("x/y.rs")).await.unwrap();
        store.fail_next(2);
        let report = builder(store.clone(), 1).build("demo").await.unwrap();
        assert_eq!(report.edges_created, 2);
    }
}
