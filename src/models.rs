//! Modelos de dominio: registros de fichero, lotes y nodos/aristas del grafo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tipo de nodo del grafo. Es la única fuente de verdad para las etiquetas:
/// el materializador, el árbol y el reconciliador escriben y leen a través
/// de este enum, nunca con literales sueltos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Project,
    Directory,
    File,
    Entity,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::Project,
        NodeKind::Directory,
        NodeKind::File,
        NodeKind::Entity,
    ];

    /// Etiqueta Neo4j del nodo.
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::Project => "Project",
            NodeKind::Directory => "Directory",
            NodeKind::File => "File",
            NodeKind::Entity => "Entity",
        }
    }

    /// Prefijo del `entity_id`.
    pub fn id_prefix(self) -> &'static str {
        match self {
            NodeKind::Project => "project",
            NodeKind::Directory => "dir",
            NodeKind::File => "file",
            NodeKind::Entity => "entity",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }
}

pub fn project_id(project: &str) -> String {
    format!("{}:{}", NodeKind::Project.id_prefix(), project)
}

pub fn directory_id(project: &str, path: &str) -> String {
    format!("{}:{}:{}", NodeKind::Directory.id_prefix(), project, path)
}

pub fn file_id(project: &str, path: &str) -> String {
    format!("{}:{}:{}", NodeKind::File.id_prefix(), project, path)
}

pub fn entity_id(project: &str, name: &str) -> String {
    format!("{}:{}:{}", NodeKind::Entity.id_prefix(), project, name)
}

/// Fichero descubierto, tal como lo entrega el recorrido del sistema de
/// archivos. Inmutable; su identidad es `(project_name, path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Ruta relativa al proyecto, separada por `/`.
    pub path: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub language: Option<String>,
    /// Contenido textual (los binarios se filtran antes de llegar aquí).
    pub content: Option<String>,
}

/// Un fichero tal y como viaja dentro de un lote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    pub path: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// `true` cuando el contenido se omitió por superar el umbral de inline.
    pub path_only: bool,
}

impl BatchFile {
    /// Decide inline vs. sólo-ruta para un registro.
    pub fn from_record(record: FileRecord, max_inline_file_bytes: u64) -> Self {
        let path_only = record.size_bytes > max_inline_file_bytes || record.content.is_none();
        Self {
            path: record.path,
            size_bytes: record.size_bytes,
            last_modified: record.last_modified,
            language: record.language,
            content: if path_only { None } else { record.content },
            path_only,
        }
    }
}

/// Mensaje que viaja por el canal: sobre + ficheros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub project_name: String,
    pub correlation_id: Uuid,
    pub inline_count: u32,
    pub path_only_count: u32,
    /// Lote unitario cuyo único fichero excede por sí solo el presupuesto.
    pub oversized: bool,
    pub files: Vec<BatchFile>,
}

impl Batch {
    pub fn empty(batch_id: Uuid, project_name: &str, correlation_id: Uuid) -> Self {
        Self {
            batch_id,
            project_name: project_name.to_string(),
            correlation_id,
            inline_count: 0,
            path_only_count: 0,
            oversized: false,
            files: Vec::new(),
        }
    }

    pub fn push(&mut self, file: BatchFile) {
        if file.path_only {
            self.path_only_count += 1;
        } else {
            self.inline_count += 1;
        }
        self.files.push(file);
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Representa un nodo (:Project).
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNode {
    pub entity_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl ProjectNode {
    pub fn new(name: &str) -> Self {
        Self {
            entity_id: project_id(name),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Representa un nodo (:Directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryNode {
    pub entity_id: String,
    pub project_name: String,
    pub path: String,
    pub depth: u32,
}

/// Representa un nodo (:File).
#[derive(Debug, Clone, PartialEq)]
pub struct FileNode {
    pub entity_id: String,
    pub project_name: String,
    pub path: String,
    pub extension: String,
    pub language: Option<String>,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub path_only: bool,
    /// Ejecución (correlation id) que escribió el fichero por última vez.
    /// `None` para stubs creados por aristas.
    pub run_id: Option<Uuid>,
}

impl FileNode {
    pub fn from_batch_file(project: &str, run_id: Uuid, file: &BatchFile) -> Self {
        Self {
            entity_id: file_id(project, &file.path),
            project_name: project.to_string(),
            path: file.path.clone(),
            extension: crate::hierarchy::extension_of(&file.path),
            language: file.language.clone(),
            size_bytes: file.size_bytes,
            last_modified: file.last_modified,
            path_only: file.path_only,
            run_id: Some(run_id),
        }
    }
}

/// Referencia mínima a un nodo, suficiente para crearlo como stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub entity_id: String,
    pub project_name: String,
    /// Ruta relativa; vacía para el proyecto.
    pub path: String,
}

/// Arista (padre)-[:CONTAINS]->(hijo). Su identidad es el par ordenado de ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainsEdge {
    pub parent: NodeRef,
    pub child: NodeRef,
}

/// Entidad extraída del contenido de un fichero.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub entity_id: String,
    pub project_name: String,
    pub name: String,
    pub label: String,
}

/// Relación tipada entre entidades, clave `(source, relationship_type, target)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatesEdge {
    pub source_entity_id: String,
    pub relationship_type: String,
    pub target_entity_id: String,
    pub confidence: f64,
}

/// Nodo sin arista `CONTAINS` entrante.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrphanRow {
    pub kind: NodeKind,
    pub entity_id: String,
    pub project_name: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: u64, content: Option<&str>) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_bytes: size,
            last_modified: Utc::now(),
            language: Some("python".into()),
            content: content.map(str::to_string),
        }
    }

    #[test]
    fn ids_follow_the_kind_prefix() {
        assert_eq!(project_id("demo"), "project:demo");
        assert_eq!(directory_id("demo", "src/util"), "dir:demo:src/util");
        assert_eq!(file_id("demo", "a.py"), "file:demo:a.py");
        assert_eq!(NodeKind::from_label("Directory"), Some(NodeKind::Directory));
        assert_eq!(NodeKind::from_label("directory"), None);
    }

    #[test]
    fn large_files_travel_without_content() {
        let big = BatchFile::from_record(record("big.py", 3_000, Some("x")), 2_000);
        assert!(big.path_only);
        assert!(big.content.is_none());

        let small = BatchFile::from_record(record("small.py", 10, Some("print()")), 2_000);
        assert!(!small.path_only);
        assert_eq!(small.content.as_deref(), Some("print()"));
    }

    #[test]
    fn batch_counts_track_representation() {
        let mut batch = Batch::empty(Uuid::nil(), "demo", Uuid::nil());
        batch.push(BatchFile::from_record(record("a.py", 1, Some("a")), 10));
        batch.push(BatchFile::from_record(record("b.py", 100, Some("b")), 10));
        assert_eq!(batch.inline_count, 1);
        assert_eq!(batch.path_only_count, 1);

        let bytes = batch.to_bytes().unwrap();
        assert_eq!(Batch::from_bytes(&bytes).unwrap(), batch);
    }
}
