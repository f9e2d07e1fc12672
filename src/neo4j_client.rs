//! `GraphStore` sobre Neo4j (neo4rs). Todas las escrituras son `MERGE`.

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{query, Graph, Query};
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::StoreError,
    models::{ContainsEdge, DirectoryNode, EntityNode, FileNode, NodeKind, OrphanRow, RelatesEdge},
    store::GraphStore,
};

pub async fn connect_from_config(cfg: &AppConfig) -> anyhow::Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea una constraint de unicidad sobre `entity_id` por cada etiqueta de
/// `NodeKind`, más un índice por `project_name` para los recuentos y otro
/// por `(project_name, run_id)` sobre `File`.
pub async fn ensure_schema(graph: &Graph) -> anyhow::Result<()> {
    for kind in NodeKind::ALL {
        let label = kind.label();
        let constraint = format!(
            "CREATE CONSTRAINT {lower}_entity_id IF NOT EXISTS
             FOR (n:{label})
             REQUIRE n.entity_id IS UNIQUE",
            lower = label.to_lowercase()
        );
        graph.run(query(&constraint)).await?;

        let index = format!(
            "CREATE INDEX {lower}_project IF NOT EXISTS
             FOR (n:{label})
             ON (n.project_name)",
            lower = label.to_lowercase()
        );
        graph.run(query(&index)).await?;
    }

    // La barrera cuenta los ficheros de una ejecución concreta.
    let run_index = format!(
        "CREATE INDEX file_run IF NOT EXISTS FOR (n:{label}) ON (n.project_name, n.run_id)",
        label = NodeKind::File.label()
    );
    graph.run(query(&run_index)).await?;

    info!("Esquema de Neo4j asegurado (constraints e índices creados).");
    Ok(())
}

pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    /// Ejecuta una consulta que devuelve una sola fila con un entero `key`.
    async fn scalar(&self, q: Query, key: &'static str) -> Result<i64, StoreError> {
        let mut cursor = self.graph.execute(q).await?;
        match cursor.next().await? {
            Some(row) => row.get::<i64>(key).ok_or(StoreError::MissingField(key)),
            None => Ok(0),
        }
    }

    async fn upsert_contains_group(
        &self,
        parent: NodeKind,
        child: NodeKind,
        edges: &[&ContainsEdge],
    ) -> Result<usize, StoreError> {
        // Los extremos se fusionan como stubs si aún no existen; ON CREATE
        // sólo rellena lo derivable de la ruta.
        let cypher = format!(
            "UNWIND range(0, size($parent_ids) - 1) AS i
             MERGE (p:{parent_label} {{entity_id: $parent_ids[i]}})
               ON CREATE SET p.project_name = $projects[i], p.path = $parent_paths[i],
                             p.name = CASE WHEN $parent_kind = 'Project' THEN $projects[i] END,
                             p.kind = $parent_kind, p.stub = true
             MERGE (c:{child_label} {{entity_id: $child_ids[i]}})
               ON CREATE SET c.project_name = $projects[i], c.path = $child_paths[i],
                             c.kind = $child_kind, c.stub = true
             WITH p, c
             OPTIONAL MATCH (p)-[existing:CONTAINS]->(c)
             WITH p, c, existing IS NULL AS is_new
             MERGE (p)-[:CONTAINS]->(c)
             RETURN sum(CASE WHEN is_new THEN 1 ELSE 0 END) AS created",
            parent_label = parent.label(),
            child_label = child.label(),
        );

        let q = query(&cypher)
            .param("parent_ids", edges.iter().map(|e| e.parent.entity_id.clone()).collect::<Vec<_>>())
            .param("parent_paths", edges.iter().map(|e| e.parent.path.clone()).collect::<Vec<_>>())
            .param("child_ids", edges.iter().map(|e| e.child.entity_id.clone()).collect::<Vec<_>>())
            .param("child_paths", edges.iter().map(|e| e.child.path.clone()).collect::<Vec<_>>())
            .param("projects", edges.iter().map(|e| e.child.project_name.clone()).collect::<Vec<_>>())
            .param("parent_kind", parent.label())
            .param("child_kind", child.label());

        Ok(self.scalar(q, "created").await? as usize)
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert_project(&self, name: &str) -> Result<bool, StoreError> {
        let label = NodeKind::Project.label();
        let cypher = format!(
            "OPTIONAL MATCH (existing:{label} {{entity_id: $id}})
             WITH existing IS NULL AS is_new
             MERGE (p:{label} {{entity_id: $id}})
               ON CREATE SET p.created_at = datetime($now)
             SET p.name = $name, p.project_name = $name, p.kind = $kind, p.stub = false
             RETURN CASE WHEN is_new THEN 1 ELSE 0 END AS created"
        );
        let q = query(&cypher)
            .param("id", crate::models::project_id(name))
            .param("name", name)
            .param("kind", label)
            .param("now", Utc::now().to_rfc3339());
        Ok(self.scalar(q, "created").await? == 1)
    }

    async fn upsert_file(&self, file: &FileNode) -> Result<bool, StoreError> {
        let label = NodeKind::File.label();
        let cypher = format!(
            "OPTIONAL MATCH (existing:{label} {{entity_id: $id}})
             WITH existing IS NULL AS is_new
             MERGE (f:{label} {{entity_id: $id}})
             SET f.project_name = $project, f.path = $path, f.extension = $extension,
                 f.language = $language, f.size_bytes = $size_bytes,
                 f.last_modified = datetime($last_modified), f.path_only = $path_only,
                 f.kind = $kind, f.stub = false,
                 f.run_id = CASE WHEN $run_id = '' THEN f.run_id ELSE $run_id END
             RETURN CASE WHEN is_new THEN 1 ELSE 0 END AS created"
        );
        let q = query(&cypher)
            .param("id", file.entity_id.clone())
            .param("project", file.project_name.clone())
            .param("path", file.path.clone())
            .param("extension", file.extension.clone())
            .param("language", file.language.clone().unwrap_or_default())
            .param("size_bytes", file.size_bytes as i64)
            .param("last_modified", file.last_modified.to_rfc3339())
            .param("path_only", file.path_only)
            .param("run_id", file.run_id.map(|id| id.to_string()).unwrap_or_default())
            .param("kind", label);
        Ok(self.scalar(q, "created").await? == 1)
    }

    async fn upsert_directories(&self, dirs: &[DirectoryNode]) -> Result<usize, StoreError> {
        if dirs.is_empty() {
            return Ok(0);
        }
        let label = NodeKind::Directory.label();
        let cypher = format!(
            "UNWIND range(0, size($ids) - 1) AS i
             OPTIONAL MATCH (existing:{label} {{entity_id: $ids[i]}})
             WITH i, existing IS NULL AS is_new
             MERGE (d:{label} {{entity_id: $ids[i]}})
             SET d.project_name = $projects[i], d.path = $paths[i], d.depth = $depths[i],
                 d.kind = $kind, d.stub = false
             RETURN sum(CASE WHEN is_new THEN 1 ELSE 0 END) AS created"
        );
        let q = query(&cypher)
            .param("ids", dirs.iter().map(|d| d.entity_id.clone()).collect::<Vec<_>>())
            .param("projects", dirs.iter().map(|d| d.project_name.clone()).collect::<Vec<_>>())
            .param("paths", dirs.iter().map(|d| d.path.clone()).collect::<Vec<_>>())
            .param("depths", dirs.iter().map(|d| d.depth as i64).collect::<Vec<_>>())
            .param("kind", label);
        Ok(self.scalar(q, "created").await? as usize)
    }

    async fn upsert_contains(&self, edges: &[ContainsEdge]) -> Result<usize, StoreError> {
        // Una consulta por combinación de etiquetas (las etiquetas no se
        // pueden parametrizar en Cypher).
        let mut groups: Vec<((NodeKind, NodeKind), Vec<&ContainsEdge>)> = Vec::new();
        for edge in edges {
            let key = (edge.parent.kind, edge.child.kind);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(edge),
                None => groups.push((key, vec![edge])),
            }
        }

        let mut created = 0;
        for ((parent, child), group) in groups {
            created += self.upsert_contains_group(parent, child, &group).await?;
        }
        Ok(created)
    }

    async fn upsert_entity(&self, entity: &EntityNode) -> Result<(), StoreError> {
        let label = NodeKind::Entity.label();
        let cypher = format!(
            "MERGE (e:{label} {{entity_id: $id}})
             SET e.project_name = $project, e.name = $name, e.entity_label = $entity_label,
                 e.kind = $kind"
        );
        self.graph
            .run(
                query(&cypher)
                    .param("id", entity.entity_id.clone())
                    .param("project", entity.project_name.clone())
                    .param("name", entity.name.clone())
                    .param("entity_label", entity.label.clone())
                    .param("kind", label),
            )
            .await?;
        Ok(())
    }

    async fn upsert_mention(&self, file_id: &str, entity_id: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "MATCH (f:{file} {{entity_id: $fid}}), (e:{entity} {{entity_id: $eid}})
             MERGE (f)-[:MENTIONS]->(e)",
            file = NodeKind::File.label(),
            entity = NodeKind::Entity.label(),
        );
        self.graph
            .run(query(&cypher).param("fid", file_id).param("eid", entity_id))
            .await?;
        Ok(())
    }

    async fn upsert_relation(&self, project: &str, edge: &RelatesEdge) -> Result<(), StoreError> {
        let label = NodeKind::Entity.label();
        let cypher = format!(
            "MERGE (s:{label} {{entity_id: $sid}})
               ON CREATE SET s.project_name = $project, s.kind = $kind
             MERGE (o:{label} {{entity_id: $oid}})
               ON CREATE SET o.project_name = $project, o.kind = $kind
             MERGE (s)-[r:RELATES {{type: $rel_type}}]->(o)
             SET r.confidence = $confidence"
        );
        self.graph
            .run(
                query(&cypher)
                    .param("sid", edge.source_entity_id.clone())
                    .param("oid", edge.target_entity_id.clone())
                    .param("rel_type", edge.relationship_type.clone())
                    .param("confidence", edge.confidence)
                    .param("project", project)
                    .param("kind", label),
            )
            .await?;
        Ok(())
    }

    async fn count_nodes(&self, kind: NodeKind, project: &str) -> Result<u64, StoreError> {
        let cypher = format!(
            "MATCH (n:{label} {{project_name: $project}}) RETURN count(n) AS total",
            label = kind.label()
        );
        let total = self
            .scalar(query(&cypher).param("project", project), "total")
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn count_run_files(&self, project: &str, run_id: Uuid) -> Result<u64, StoreError> {
        let cypher = format!(
            "MATCH (f:{label} {{project_name: $project, run_id: $run_id}}) RETURN count(f) AS total",
            label = NodeKind::File.label()
        );
        let q = query(&cypher)
            .param("project", project)
            .param("run_id", run_id.to_string());
        Ok(self.scalar(q, "total").await?.max(0) as u64)
    }

    async fn file_paths(&self, project: &str) -> Result<Vec<String>, StoreError> {
        let cypher = format!(
            "MATCH (f:{label} {{project_name: $project}}) RETURN f.path AS path ORDER BY path",
            label = NodeKind::File.label()
        );
        let mut cursor = self
            .graph
            .execute(query(&cypher).param("project", project))
            .await?;
        let mut paths = Vec::new();
        while let Some(row) = cursor.next().await? {
            if let Some(path) = row.get::<String>("path") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    async fn find_orphans(&self, project: Option<&str>) -> Result<Vec<OrphanRow>, StoreError> {
        let mut orphans = Vec::new();
        for kind in [NodeKind::Directory, NodeKind::File] {
            let filter = if project.is_some() {
                "{project_name: $project}"
            } else {
                ""
            };
            let cypher = format!(
                "MATCH (n:{label} {filter})
                 WHERE NOT ()-[:CONTAINS]->(n)
                 RETURN n.entity_id AS id, n.project_name AS project, n.path AS path
                 ORDER BY id",
                label = kind.label()
            );
            let mut q = query(&cypher);
            if let Some(project) = project {
                q = q.param("project", project);
            }

            let mut cursor = self.graph.execute(q).await?;
            while let Some(row) = cursor.next().await? {
                let entity_id: String = row.get("id").ok_or(StoreError::MissingField("id"))?;
                let project_name: String =
                    row.get("project").ok_or(StoreError::MissingField("project"))?;
                let path: String = row.get("path").ok_or(StoreError::MissingField("path"))?;
                orphans.push(OrphanRow {
                    kind,
                    entity_id,
                    project_name,
                    path,
                });
            }
        }
        Ok(orphans)
    }

    async fn projects(&self) -> Result<Vec<String>, StoreError> {
        let cypher = format!(
            "MATCH (n) WHERE n:{project} OR n:{dir} OR n:{file}
             RETURN DISTINCT n.project_name AS project ORDER BY project",
            project = NodeKind::Project.label(),
            dir = NodeKind::Directory.label(),
            file = NodeKind::File.label(),
        );
        let mut cursor = self.graph.execute(query(&cypher)).await?;
        let mut projects = Vec::new();
        while let Some(row) = cursor.next().await? {
            if let Some(name) = row.get::<String>("project") {
                projects.push(name);
            }
        }
        Ok(projects)
    }
}
