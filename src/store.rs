//! Interfaz del almacén de grafos y una implementación en memoria.
//!
//! Todas las escrituras son upserts por `entity_id`: escrituras concurrentes
//! o repetidas convergen al mismo estado.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::StoreError,
    hierarchy,
    models::{
        ContainsEdge, DirectoryNode, EntityNode, FileNode, NodeKind, NodeRef, OrphanRow, ProjectNode,
        RelatesEdge,
    },
};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Crea el proyecto si no existe. Devuelve `true` si lo creó.
    async fn upsert_project(&self, name: &str) -> Result<bool, StoreError>;

    /// Crea el fichero o actualiza sus campos mutables. `true` si lo creó.
    async fn upsert_file(&self, file: &FileNode) -> Result<bool, StoreError>;

    /// Upsert por lotes; devuelve cuántos directorios eran nuevos.
    async fn upsert_directories(&self, dirs: &[DirectoryNode]) -> Result<usize, StoreError>;

    /// Merge de aristas `CONTAINS`, creando stubs de los extremos ausentes.
    /// Devuelve cuántas aristas eran nuevas.
    async fn upsert_contains(&self, edges: &[ContainsEdge]) -> Result<usize, StoreError>;

    async fn upsert_entity(&self, entity: &EntityNode) -> Result<(), StoreError>;

    /// (File)-[:MENTIONS]->(Entity)
    async fn upsert_mention(&self, file_id: &str, entity_id: &str) -> Result<(), StoreError>;

    /// Merge por `(source, type, target)`; la confianza se sobrescribe.
    async fn upsert_relation(&self, project: &str, edge: &RelatesEdge) -> Result<(), StoreError>;

    async fn count_nodes(&self, kind: NodeKind, project: &str) -> Result<u64, StoreError>;

    /// Ficheros del proyecto escritos por la ejecución `run_id`.
    async fn count_run_files(&self, project: &str, run_id: Uuid) -> Result<u64, StoreError>;

    /// Rutas de todos los `File` del proyecto.
    async fn file_paths(&self, project: &str) -> Result<Vec<String>, StoreError>;

    /// `File`/`Directory` sin arista `CONTAINS` entrante.
    async fn find_orphans(&self, project: Option<&str>) -> Result<Vec<OrphanRow>, StoreError>;

    async fn projects(&self) -> Result<Vec<String>, StoreError>;
}

/// Nodo tal y como lo guarda `MemoryStore`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredNode {
    Project(ProjectNode),
    Directory(DirectoryNode),
    File(FileNode),
    Entity(EntityNode),
}

impl StoredNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            StoredNode::Project(_) => NodeKind::Project,
            StoredNode::Directory(_) => NodeKind::Directory,
            StoredNode::File(_) => NodeKind::File,
            StoredNode::Entity(_) => NodeKind::Entity,
        }
    }

    pub fn project_name(&self) -> &str {
        match self {
            StoredNode::Project(p) => &p.name,
            StoredNode::Directory(d) => &d.project_name,
            StoredNode::File(f) => &f.project_name,
            StoredNode::Entity(e) => &e.project_name,
        }
    }

    fn path(&self) -> &str {
        match self {
            StoredNode::Directory(d) => &d.path,
            StoredNode::File(f) => &f.path,
            StoredNode::Project(_) | StoredNode::Entity(_) => "",
        }
    }

    fn stub(node: &NodeRef) -> Self {
        match node.kind {
            NodeKind::Project => StoredNode::Project(ProjectNode::new(&node.project_name)),
            NodeKind::Directory => {
                StoredNode::Directory(hierarchy::directory_node(&node.project_name, &node.path))
            }
            NodeKind::File => StoredNode::File(FileNode {
                entity_id: node.entity_id.clone(),
                project_name: node.project_name.clone(),
                path: node.path.clone(),
                extension: hierarchy::extension_of(&node.path),
                language: None,
                size_bytes: 0,
                last_modified: DateTime::<Utc>::default(),
                path_only: true,
                run_id: None,
            }),
            NodeKind::Entity => StoredNode::Entity(EntityNode {
                entity_id: node.entity_id.clone(),
                project_name: node.project_name.clone(),
                name: node.path.clone(),
                label: String::new(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryGraph {
    nodes: HashMap<String, StoredNode>,
    contains: BTreeSet<(String, String)>,
    mentions: BTreeSet<(String, String)>,
    relates: HashMap<(String, String, String), f64>,
}

/// Almacén en memoria. Permite simular caídas con `fail_next`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    graph: Mutex<MemoryGraph>,
    outage: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Las próximas `n` operaciones fallan con `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.outage.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryGraph>, StoreError> {
        let injected = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("caída simulada".into()));
        }
        self.graph
            .lock()
            .map_err(|_| StoreError::Unavailable("mutex envenenado".into()))
    }

    pub fn node(&self, entity_id: &str) -> Option<StoredNode> {
        self.graph.lock().ok()?.nodes.get(entity_id).cloned()
    }

    /// Pares (padre, hijo) de todas las aristas `CONTAINS`.
    pub fn contains_edges(&self) -> Vec<(String, String)> {
        self.graph
            .lock()
            .map(|g| g.contains.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn relations(&self) -> Vec<(String, String, String, f64)> {
        self.graph
            .lock()
            .map(|g| {
                let mut out: Vec<_> = g
                    .relates
                    .iter()
                    .map(|((s, t, o), c)| (s.clone(), t.clone(), o.clone(), *c))
                    .collect();
                out.sort_by(|a, b| (&a.0, &a.1, &a.2).cmp(&(&b.0, &b.1, &b.2)));
                out
            })
            .unwrap_or_default()
    }

    pub fn mentions(&self) -> Vec<(String, String)> {
        self.graph
            .lock()
            .map(|g| g.mentions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn nodes_of(&self, kind: NodeKind, project: &str) -> Vec<StoredNode> {
        self.graph
            .lock()
            .map(|g| {
                g.nodes
                    .values()
                    .filter(|n| n.kind() == kind && n.project_name() == project)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Elimina una arista; sólo para preparar escenarios de huérfanos.
    pub fn remove_contains(&self, parent_id: &str, child_id: &str) -> bool {
        self.graph
            .lock()
            .map(|mut g| g.contains.remove(&(parent_id.to_string(), child_id.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn upsert_project(&self, name: &str) -> Result<bool, StoreError> {
        let mut g = self.lock()?;
        let node = ProjectNode::new(name);
        if g.nodes.contains_key(&node.entity_id) {
            return Ok(false);
        }
        g.nodes.insert(node.entity_id.clone(), StoredNode::Project(node));
        Ok(true)
    }

    async fn upsert_file(&self, file: &FileNode) -> Result<bool, StoreError> {
        let mut g = self.lock()?;
        let created = !g.nodes.contains_key(&file.entity_id);
        g.nodes
            .insert(file.entity_id.clone(), StoredNode::File(file.clone()));
        Ok(created)
    }

    async fn upsert_directories(&self, dirs: &[DirectoryNode]) -> Result<usize, StoreError> {
        let mut g = self.lock()?;
        let mut created = 0;
        for dir in dirs {
            if !g.nodes.contains_key(&dir.entity_id) {
                g.nodes
                    .insert(dir.entity_id.clone(), StoredNode::Directory(dir.clone()));
                created += 1;
            }
        }
        Ok(created)
    }

    async fn upsert_contains(&self, edges: &[ContainsEdge]) -> Result<usize, StoreError> {
        let mut g = self.lock()?;
        let mut created = 0;
        for edge in edges {
            for end in [&edge.parent, &edge.child] {
                if !g.nodes.contains_key(&end.entity_id) {
                    g.nodes.insert(end.entity_id.clone(), StoredNode::stub(end));
                }
            }
            if g
                .contains
                .insert((edge.parent.entity_id.clone(), edge.child.entity_id.clone()))
            {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn upsert_entity(&self, entity: &EntityNode) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        g.nodes
            .insert(entity.entity_id.clone(), StoredNode::Entity(entity.clone()));
        Ok(())
    }

    async fn upsert_mention(&self, file_id: &str, entity_id: &str) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        g.mentions.insert((file_id.to_string(), entity_id.to_string()));
        Ok(())
    }

    async fn upsert_relation(&self, project: &str, edge: &RelatesEdge) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        for id in [&edge.source_entity_id, &edge.target_entity_id] {
            if !g.nodes.contains_key(id) {
                let name = id.rsplit(':').next().unwrap_or(id).to_string();
                g.nodes.insert(
                    id.clone(),
                    StoredNode::Entity(EntityNode {
                        entity_id: id.clone(),
                        project_name: project.to_string(),
                        name,
                        label: String::new(),
                    }),
                );
            }
        }
        g.relates.insert(
            (
                edge.source_entity_id.clone(),
                edge.relationship_type.clone(),
                edge.target_entity_id.clone(),
            ),
            edge.confidence,
        );
        Ok(())
    }

    async fn count_nodes(&self, kind: NodeKind, project: &str) -> Result<u64, StoreError> {
        let g = self.lock()?;
        Ok(g.nodes
            .values()
            .filter(|n| n.kind() == kind && n.project_name() == project)
            .count() as u64)
    }

    async fn count_run_files(&self, project: &str, run_id: Uuid) -> Result<u64, StoreError> {
        let g = self.lock()?;
        Ok(g.nodes
            .values()
            .filter(|n| {
                matches!(n, StoredNode::File(f) if f.project_name == project && f.run_id == Some(run_id))
            })
            .count() as u64)
    }

    async fn file_paths(&self, project: &str) -> Result<Vec<String>, StoreError> {
        let g = self.lock()?;
        let mut paths: Vec<String> = g
            .nodes
            .values()
            .filter_map(|n| match n {
                StoredNode::File(f) if f.project_name == project => Some(f.path.clone()),
                _ => None,
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn find_orphans(&self, project: Option<&str>) -> Result<Vec<OrphanRow>, StoreError> {
        let g = self.lock()?;
        let with_parent: BTreeSet<&str> = g.contains.iter().map(|(_, child)| child.as_str()).collect();
        let mut orphans: Vec<OrphanRow> = g
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.kind(), NodeKind::File | NodeKind::Directory))
            .filter(|(_, n)| project.map_or(true, |p| n.project_name() == p))
            .filter(|(id, _)| !with_parent.contains(id.as_str()))
            .map(|(id, n)| OrphanRow {
                kind: n.kind(),
                entity_id: id.clone(),
                project_name: n.project_name().to_string(),
                path: n.path().to_string(),
            })
            .collect();
        orphans.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(orphans)
    }

    async fn projects(&self) -> Result<Vec<String>, StoreError> {
        let g = self.lock()?;
        let names: BTreeSet<String> = g
            .nodes
            .values()
            .filter(|n| matches!(n.kind(), NodeKind::Directory | NodeKind::File | NodeKind::Project))
            .map(|n| n.project_name().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{directory_ref, file_ref, project_ref};
    use tokio_test::assert_ok;

    fn file(project: &str, path: &str, size: u64) -> FileNode {
        FileNode {
            entity_id: crate::models::file_id(project, path),
            project_name: project.into(),
            path: path.into(),
            extension: hierarchy::extension_of(path),
            language: Some("python".into()),
            size_bytes: size,
            last_modified: Utc::now(),
            path_only: false,
            run_id: None,
        }
    }

    #[tokio::test]
    async fn file_upsert_is_idempotent_and_keeps_latest_metadata() {
        let store = MemoryStore::new();
        assert!(store.upsert_file(&file("demo", "a.py", 1)).await.unwrap());
        assert!(!store.upsert_file(&file("demo", "a.py", 2)).await.unwrap());

        assert_eq!(store.count_nodes(NodeKind::File, "demo").await.unwrap(), 1);
        match store.node("file:demo:a.py") {
            Some(StoredNode::File(f)) => assert_eq!(f.size_bytes, 2),
            other => panic!("nodo inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn contains_edges_merge_and_stub_missing_parents() {
        let store = MemoryStore::new();
        store.upsert_file(&file("demo", "src/b.py", 1)).await.unwrap();

        let edges = vec![
            ContainsEdge {
                parent: project_ref("demo"),
                child: directory_ref("demo", "src"),
            },
            ContainsEdge {
                parent: directory_ref("demo", "src"),
                child: file_ref("demo", "src/b.py"),
            },
        ];
        assert_eq!(store.upsert_contains(&edges).await.unwrap(), 2);
        assert_eq!(store.upsert_contains(&edges).await.unwrap(), 0);
        assert!(matches!(store.node("dir:demo:src"), Some(StoredNode::Directory(_))));
        assert!(store.find_orphans(Some("demo")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_counts_only_see_the_latest_writer() {
        let store = MemoryStore::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        for path in ["a.py", "b.py"] {
            let node = FileNode {
                run_id: Some(first),
                ..file("demo", path, 1)
            };
            store.upsert_file(&node).await.unwrap();
        }
        let rewritten = FileNode {
            run_id: Some(second),
            ..file("demo", "a.py", 1)
        };
        store.upsert_file(&rewritten).await.unwrap();

        assert_eq!(store.count_nodes(NodeKind::File, "demo").await.unwrap(), 2);
        assert_eq!(store.count_run_files("demo", first).await.unwrap(), 1);
        assert_eq!(store.count_run_files("demo", second).await.unwrap(), 1);
        assert_eq!(store.count_run_files("other", second).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn orphans_are_scoped_by_project() {
        let store = MemoryStore::new();
        store.upsert_file(&file("a", "x.py", 1)).await.unwrap();
        store.upsert_file(&file("b", "y.py", 1)).await.unwrap();

        assert_eq!(store.find_orphans(Some("a")).await.unwrap().len(), 1);
        assert_eq!(store.find_orphans(None).await.unwrap().len(), 2);
        assert_eq!(store.projects().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn relations_overwrite_confidence() {
        let store = MemoryStore::new();
        let mut edge = RelatesEdge {
            source_entity_id: "entity:demo:A".into(),
            relationship_type: "USES".into(),
            target_entity_id: "entity:demo:B".into(),
            confidence: 0.4,
        };
        assert_ok!(store.upsert_relation("demo", &edge).await);
        edge.confidence = 0.9;
        assert_ok!(store.upsert_relation("demo", &edge).await);

        let relations = store.relations();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].3, 0.9);
        assert_eq!(store.count_nodes(NodeKind::Entity, "demo").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_outage_fails_then_recovers() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.upsert_project("demo").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.upsert_project("demo").await.unwrap());
    }
}
