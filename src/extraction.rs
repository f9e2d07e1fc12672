//! Colaborador de extracción de entidades y relaciones.
//!
//! El materializador sólo conoce el trait `Extractor`; la implementación por
//! defecto delega en un LLM a través de Rig.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::{
    config::{AppConfig, LlmProvider},
    error::ExtractionError,
};

/// Petición de extracción para un fichero con contenido.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub file_path: &'a str,
    pub content: &'a str,
    pub language: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityCandidate {
    /// Nombre de la entidad; forma parte de su clave.
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationCandidate {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<EntityCandidate>,
    #[serde(default)]
    pub relations: Vec<RelationCandidate>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<ExtractionResult, ExtractionError>;
}

/// Extractor que no encuentra nada; para ejecuciones sin LLM configurado.
pub struct NoopExtractor;

#[async_trait]
impl Extractor for NoopExtractor {
    async fn extract(&self, _request: ExtractionRequest<'_>) -> Result<ExtractionResult, ExtractionError> {
        Ok(ExtractionResult::default())
    }
}

/// Extractor basado en LLM.
#[derive(Debug, Clone)]
pub struct LlmExtractor {
    pub provider: LlmProvider,
    pub chat_model: String,
    /// Se recorta el contenido enviado al modelo.
    pub max_chars: usize,
}

const EXTRACTION_PROMPT: &str = r#"
Tu tarea es analizar el contenido de un fichero y extraer entidades y relaciones para un grafo de conocimiento.
- Identifica entidades (módulos, tipos, funciones, conceptos, tecnologías) y clasifícalas con una etiqueta breve en inglés: 'Module', 'Type', 'Function', 'Concept', 'Technology'.
- Identifica relaciones entre esas entidades como una tripleta (sujeto, predicado, objeto). El predicado debe ser un identificador conciso en mayúsculas (ej: 'IMPORTS', 'CALLS', 'IMPLEMENTS').
- Cada relación lleva "confidence", un número entre 0 y 1.

La salida DEBE ser un único objeto JSON válido con dos claves: "entities" y "relations".
- "entities": una lista de objetos, cada uno con "id" (nombre de la entidad) y "label".
- "relations": una lista de objetos, cada uno con "subject", "predicate", "object" y "confidence".

Si no encuentras nada, devuelve listas vacías. No incluyas explicaciones, solo el JSON.
"#;

impl LlmExtractor {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            max_chars: 12_000,
        }
    }

    async fn extract_with_openai(&self, request: ExtractionRequest<'_>) -> Result<ExtractionResult, ExtractionError> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client.agent(model_name).preamble(EXTRACTION_PROMPT).build();

        let body: String = request.content.chars().take(self.max_chars).collect();
        let prompt = format!(
            "Fichero: {}\nLenguaje: {}\n\n{}",
            request.file_path,
            request.language.unwrap_or("desconocido"),
            body
        );

        let response = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| ExtractionError::Unavailable(e.to_string()))?;

        parse_extraction(&response)
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<ExtractionResult, ExtractionError> {
        match self.provider {
            LlmProvider::OpenAI => self.extract_with_openai(request).await,
            ref other => Err(ExtractionError::Unavailable(format!(
                "Proveedor LLM {other:?} aún no implementado para extracción"
            ))),
        }
    }
}

/// Limpia la respuesta del LLM (bloques ```json) y la interpreta.
pub fn parse_extraction(response: &str) -> Result<ExtractionResult, ExtractionError> {
    let json_response = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str::<ExtractionResult>(json_response).map_err(|e| {
        warn!("No se pudo parsear el JSON de extracción. Error: {e}");
        ExtractionError::Malformed(e.to_string())
    })
}
