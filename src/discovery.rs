//! Recorrido de un directorio del sistema de archivos para producir
//! `FileRecord`s en orden determinista.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use mime_guess::MimeGuess;
use tracing::{debug, warn};
use walkdir::{DirEntry, FilterEntry, WalkDir};

use crate::{hierarchy, models::FileRecord};

/// Resumen del recorrido.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub files_scanned: usize,
    pub files_skipped: usize,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// Lenguaje a partir de la extensión.
pub fn language_for(extension: &str) -> Option<&'static str> {
    let lang = match extension {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "md" => "markdown",
        "toml" => "toml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "html" => "html",
        "css" => "css",
        "sh" => "shell",
        _ => return None,
    };
    Some(lang)
}

/// Extensiones de texto que `mime_guess` no clasifica como `text/*`.
fn is_textual(path: &Path, extension: &str) -> bool {
    if language_for(extension).is_some() || matches!(extension, "txt" | "log" | "cfg" | "ini" | "") {
        return true;
    }
    let mime: MimeGuess = MimeGuess::from_path(path);
    mime.first()
        .map(|m| m.type_() == mime_guess::mime::TEXT)
        .unwrap_or(false)
}

/// Recorrido perezoso de un directorio: cada `next` avanza el walker hasta
/// el siguiente fichero de texto. Los ficheros mayores que
/// `max_inline_bytes` no se leen y viajarán sólo con su ruta.
pub struct Discovery {
    root: PathBuf,
    max_inline_bytes: u64,
    walker: FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
    stats: DiscoveryStats,
}

impl Discovery {
    /// Contadores de lo recorrido hasta ahora.
    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }

    fn record_for(&mut self, entry: &DirEntry) -> Option<FileRecord> {
        let path = entry.path();
        let relative = path.strip_prefix(&self.root).ok()?;
        let rel_str = hierarchy::normalize(&relative.to_string_lossy().replace('\\', "/"));
        let extension = hierarchy::extension_of(&rel_str);

        if !is_textual(path, &extension) {
            debug!("Saltando fichero no textual: {rel_str}");
            self.stats.files_skipped += 1;
            return None;
        }

        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!("No se pudo leer metadatos de {}: {e}", path.display());
                self.stats.files_skipped += 1;
                return None;
            }
        };
        let size_bytes = metadata.len();
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        let content = if size_bytes > self.max_inline_bytes {
            None
        } else {
            match fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(_) => {
                    warn!("Saltando fichero no-UTF8: {}", path.display());
                    self.stats.files_skipped += 1;
                    return None;
                }
            }
        };

        Some(FileRecord {
            language: language_for(&extension).map(str::to_string),
            path: rel_str,
            size_bytes,
            last_modified,
            content,
        })
    }
}

impl Iterator for Discovery {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error recorriendo el directorio: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            self.stats.files_scanned += 1;
            if let Some(record) = self.record_for(&entry) {
                return Some(record);
            }
        }
    }
}

fn is_visible(entry: &DirEntry) -> bool {
    !is_hidden(entry)
}

/// Prepara el recorrido de `root` en orden determinista con rutas relativas
/// separadas por `/`. No toca el disco más allá de comprobar `root`.
pub fn discover(root: &Path, max_inline_bytes: u64) -> std::io::Result<Discovery> {
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("La ruta no es un directorio: {}", root.display()),
        ));
    }

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(is_visible as fn(&DirEntry) -> bool);

    Ok(Discovery {
        root: root.to_path_buf(),
        max_inline_bytes,
        walker,
        stats: DiscoveryStats::default(),
    })
}
