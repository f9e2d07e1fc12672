//! Carga y validación de la configuración (Neo4j, LLM, límites del pipeline).

use std::{env, str::FromStr, time::Duration};

use crate::{
    barrier::{BarrierConfig, MAX_BARRIER_WAIT},
    error::ConfigError,
    packer::PackLimits,
    reconciler::ReconcileScope,
    retry::RetryPolicy,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
    /// Sin extractor: sólo metadatos.
    Disabled,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "none" | "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::Invalid {
                key: "LLM_PROVIDER",
                value: other.to_string(),
            }),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,

    /// Límite duro del transporte.
    pub transport_max_payload_bytes: usize,
    pub pack: PackLimits,
    pub max_split_depth: u32,
    pub channel_partitions: usize,
    pub materializer_workers: usize,

    pub barrier: BarrierConfig,
    pub retry: RetryPolicy,

    pub tree_batch_size: usize,
    pub reconcile_batch_size: usize,
    pub reconcile_scope: ReconcileScope,
    /// Periodo de la reconciliación en segundo plano; cero la desactiva.
    pub reconcile_interval: Duration,
    pub dead_letter_dir: String,
}

const DEFAULT_TRANSPORT_MAX_PAYLOAD: usize = 1024 * 1024;
const DEFAULT_BATCH_FRACTION: f64 = 0.9;

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        let neo4j_uri = required("NEO4J_URI")?;
        let neo4j_user = required("NEO4J_USER")?;
        let neo4j_password = required("NEO4J_PASSWORD")?;

        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        let llm_provider = LlmProvider::from_str(&lookup("LLM_PROVIDER").unwrap_or_else(|| "openai".into()))?;
        let llm_chat_model = lookup("LLM_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let transport_max_payload_bytes: usize = parse_or(
            &lookup,
            "TRANSPORT_MAX_PAYLOAD_BYTES",
            DEFAULT_TRANSPORT_MAX_PAYLOAD,
        )?;
        let fraction: f64 = parse_or(&lookup, "MAX_BATCH_FRACTION", DEFAULT_BATCH_FRACTION)?;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "MAX_BATCH_FRACTION",
                value: fraction.to_string(),
            });
        }
        let derived = (transport_max_payload_bytes as f64 * fraction) as usize;
        let max_batch_bytes: usize = parse_or(&lookup, "MAX_BATCH_BYTES", derived)?;
        let max_inline_file_bytes: u64 = parse_or(&lookup, "MAX_INLINE_FILE_BYTES", 256 * 1024)?;

        let retry = RetryPolicy {
            base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 1000)?),
            multiplier: parse_or(&lookup, "RETRY_MULTIPLIER", 2.0)?,
            max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 5)?,
        };

        let barrier = BarrierConfig {
            max_wait: Duration::from_secs(parse_or(&lookup, "BARRIER_MAX_WAIT_SECS", 120)?),
            poll_interval: Duration::from_millis(parse_or(&lookup, "BARRIER_POLL_INTERVAL_MS", 1000)?),
        };

        let cfg = Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_chat_model,
            transport_max_payload_bytes,
            pack: PackLimits {
                max_batch_bytes,
                max_inline_file_bytes,
            },
            max_split_depth: parse_or(&lookup, "MAX_SPLIT_DEPTH", 4)?,
            channel_partitions: parse_or(&lookup, "CHANNEL_PARTITIONS", 4)?,
            materializer_workers: parse_or(&lookup, "MATERIALIZER_WORKERS", 4)?,
            barrier,
            retry,
            tree_batch_size: parse_or(&lookup, "TREE_BATCH_SIZE", 100)?,
            reconcile_batch_size: parse_or(&lookup, "RECONCILE_BATCH_SIZE", 1000)?,
            reconcile_scope: ReconcileScope::parse(&lookup("RECONCILE_SCOPE").unwrap_or_default()),
            reconcile_interval: Duration::from_secs(parse_or(&lookup, "RECONCILE_INTERVAL_SECS", 300)?),
            dead_letter_dir: lookup("DEAD_LETTER_DIR").unwrap_or_else(|| "dead_letters".to_string()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Coherencia entre límites; un fallo aquí es fatal para la ejecución.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport_max_payload_bytes == 0 || self.pack.max_batch_bytes == 0 {
            return Err(ConfigError::Inconsistent(
                "los límites de tamaño deben ser mayores que cero".into(),
            ));
        }
        if self.pack.max_batch_bytes > self.transport_max_payload_bytes {
            return Err(ConfigError::Inconsistent(format!(
                "MAX_BATCH_BYTES ({}) supera el límite del transporte ({})",
                self.pack.max_batch_bytes, self.transport_max_payload_bytes
            )));
        }
        if self.pack.max_inline_file_bytes >= self.pack.max_batch_bytes as u64 {
            return Err(ConfigError::Inconsistent(format!(
                "MAX_INLINE_FILE_BYTES ({}) debe ser menor que MAX_BATCH_BYTES ({})",
                self.pack.max_inline_file_bytes, self.pack.max_batch_bytes
            )));
        }
        if self.retry.max_attempts == 0
            || !self.retry.multiplier.is_finite()
            || self.retry.multiplier < 1.0
        {
            return Err(ConfigError::Inconsistent(
                "la política de reintentos necesita al menos un intento y multiplicador >= 1".into(),
            ));
        }
        if self.barrier.max_wait > MAX_BARRIER_WAIT {
            return Err(ConfigError::Inconsistent(format!(
                "BARRIER_MAX_WAIT_SECS ({}) supera el máximo de {} segundos",
                self.barrier.max_wait.as_secs(),
                MAX_BARRIER_WAIT.as_secs()
            )));
        }
        if self.barrier.poll_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "BARRIER_POLL_INTERVAL_MS debe ser mayor que cero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
