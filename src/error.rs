//! Taxonomía de errores del pipeline.
//!
//! Cada error sabe si merece reintento (`is_retryable`); la política de
//! `retry` sólo consulta ese método, nunca el texto del mensaje.

use thiserror::Error;

/// Error de configuración: es el único que aborta una ejecución completa
/// junto con la caída total del almacén.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Falta la variable {0} en el entorno")]
    Missing(&'static str),

    #[error("Valor inválido para {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("Configuración incoherente: {0}")]
    Inconsistent(String),
}

/// Fallos del canal de transporte.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Canal no disponible: {0}")]
    Unavailable(String),

    #[error("Mensaje demasiado grande: {size} bytes (límite {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Canal cerrado")]
    Closed,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Fallos del almacén de grafos.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Caída transitoria (conexión, timeout, pool agotado).
    #[error("Almacén no disponible: {0}")]
    Unavailable(String),

    /// La consulta fue rechazada; reintentarla no cambia nada.
    #[error("Consulta rechazada: {0}")]
    Query(String),

    #[error("Falta el campo '{0}' en el resultado")]
    MissingField(&'static str),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<neo4rs::Error> for StoreError {
    fn from(err: neo4rs::Error) -> Self {
        match err {
            neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Fallo del extractor de entidades. Nunca impide el upsert del fichero.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("Extractor no disponible: {0}")]
    Unavailable(String),

    #[error("Respuesta de extracción inválida: {0}")]
    Malformed(String),
}

/// Error paraguas para las operaciones de alto nivel.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TransportError::Unavailable("broker".into()).is_retryable());
        assert!(!TransportError::PayloadTooLarge { size: 10, limit: 5 }.is_retryable());
        assert!(!TransportError::Closed.is_retryable());
        assert!(StoreError::Unavailable("timeout".into()).is_retryable());
        assert!(!StoreError::Query("syntax".into()).is_retryable());
        assert!(PipelineError::from(StoreError::Unavailable("x".into())).is_retryable());
        assert!(!PipelineError::from(ConfigError::Missing("NEO4J_URI")).is_retryable());
    }
}
