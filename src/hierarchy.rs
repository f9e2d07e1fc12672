//! Derivación de la jerarquía Project → Directory → File a partir de rutas.
//!
//! El padre de cada nodo se deduce sólo de su `path`, así que la jerarquía
//! resultante es un árbol por construcción.

use std::collections::BTreeSet;

use crate::models::{directory_id, file_id, project_id, ContainsEdge, DirectoryNode, NodeKind, NodeRef};

/// Normaliza una ruta relativa: sin `./` inicial, sin barras sobrantes.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Número de separadores desde la raíz del proyecto.
pub fn depth_of(path: &str) -> u32 {
    path.matches('/').count() as u32
}

/// Extensión en minúsculas, vacía si no la hay.
pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// Directorio padre inmediato; `None` si cuelga directamente del proyecto.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}

/// Directorios ancestros de `path`, de la raíz hacia abajo.
/// `src/util/c.py` → `["src", "src/util"]`.
pub fn ancestor_dirs(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path;
    while let Some(parent) = parent_path(current) {
        out.push(parent.to_string());
        current = parent;
    }
    out.reverse();
    out
}

pub fn project_ref(project: &str) -> NodeRef {
    NodeRef {
        kind: NodeKind::Project,
        entity_id: project_id(project),
        project_name: project.to_string(),
        path: String::new(),
    }
}

pub fn directory_ref(project: &str, path: &str) -> NodeRef {
    NodeRef {
        kind: NodeKind::Directory,
        entity_id: directory_id(project, path),
        project_name: project.to_string(),
        path: path.to_string(),
    }
}

pub fn file_ref(project: &str, path: &str) -> NodeRef {
    NodeRef {
        kind: NodeKind::File,
        entity_id: file_id(project, path),
        project_name: project.to_string(),
        path: path.to_string(),
    }
}

pub fn directory_node(project: &str, path: &str) -> DirectoryNode {
    DirectoryNode {
        entity_id: directory_id(project, path),
        project_name: project.to_string(),
        path: path.to_string(),
        depth: depth_of(path),
    }
}

/// Padre esperado del nodo situado en `path`.
pub fn parent_ref(project: &str, path: &str) -> NodeRef {
    match parent_path(path) {
        Some(parent) => directory_ref(project, parent),
        None => project_ref(project),
    }
}

/// Acumula directorios y aristas `CONTAINS` deduplicados para un conjunto
/// de nodos hoja. Orden determinista (BTreeSet) para que las escrituras por
/// lotes sean reproducibles.
#[derive(Debug, Default)]
pub struct HierarchyPlan {
    pub directories: BTreeSet<DirectoryNode>,
    pub edges: BTreeSet<ContainsEdge>,
}

impl HierarchyPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade la cadena completa de ancestros hasta el nodo indicado.
    pub fn add_chain(&mut self, project: &str, kind: NodeKind, path: &str) {
        let leaf = match kind {
            NodeKind::File => file_ref(project, path),
            NodeKind::Directory => directory_ref(project, path),
            // Proyectos y entidades no cuelgan del árbol de contención.
            NodeKind::Project | NodeKind::Entity => return,
        };

        let mut child = leaf;
        let mut current = path.to_string();
        loop {
            let parent = parent_ref(project, &current);
            let is_root = parent.kind == NodeKind::Project;
            if !is_root {
                self.directories.insert(directory_node(project, &parent.path));
            }
            let next = parent.path.clone();
            self.edges.insert(ContainsEdge {
                parent,
                child,
            });
            if is_root {
                break;
            }
            child = directory_ref(project, &next);
            current = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposes_paths() {
        assert_eq!(normalize("./src//util/"), "src/util");
        assert_eq!(depth_of("src"), 0);
        assert_eq!(depth_of("src/util"), 1);
        assert_eq!(extension_of("src/util/C.PY"), "py");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of(".gitignore"), "");
        assert_eq!(ancestor_dirs("src/util/c.py"), vec!["src", "src/util"]);
        assert!(ancestor_dirs("a.py").is_empty());
    }

    #[test]
    fn chain_reaches_the_project() {
        let mut plan = HierarchyPlan::new();
        plan.add_chain("demo", NodeKind::File, "src/util/c.py");

        let dirs: Vec<_> = plan.directories.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(dirs, vec!["src", "src/util"]);

        let pairs: BTreeSet<_> = plan
            .edges
            .iter()
            .map(|e| (e.parent.entity_id.as_str(), e.child.entity_id.as_str()))
            .collect();
        assert_eq!(
            pairs,
            BTreeSet::from([
                ("project:demo", "dir:demo:src"),
                ("dir:demo:src", "dir:demo:src/util"),
                ("dir:demo:src/util", "file:demo:src/util/c.py"),
            ])
        );
    }

    #[test]
    fn shared_ancestors_are_deduplicated() {
        let mut plan = HierarchyPlan::new();
        plan.add_chain("demo", NodeKind::File, "a.py");
        plan.add_chain("demo", NodeKind::File, "src/b.py");
        plan.add_chain("demo", NodeKind::File, "src/util/c.py");
        plan.add_chain("demo", NodeKind::Directory, "src/util");

        assert_eq!(plan.directories.len(), 2);
        assert_eq!(plan.edges.len(), 5);
    }
}
