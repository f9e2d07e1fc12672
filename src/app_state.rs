use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    cancel::CancelSignal, config::AppConfig, dispatcher::Dispatcher, materializer::MaterializerPool,
    pipeline::{PipelineContext, RunSummary}, reconciler::ReconcileReport, store::GraphStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn GraphStore>,
    pub pipeline: PipelineContext,
    pub consumers: Arc<MaterializerPool>,
    pub status: Arc<Mutex<Status>>,
    pub current_dir: Arc<Mutex<Option<PathBuf>>>,
    /// Señal de la ingesta en curso; se sustituye en cada ejecución.
    pub run_cancel: Arc<Mutex<CancelSignal>>,
    pub last_run: Arc<Mutex<Option<RunSummary>>>,
    /// Última reconciliación, manual o periódica.
    pub last_reconcile: Arc<Mutex<Option<ReconcileReport>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.pipeline.dispatcher
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

impl Status {
    /// Actualiza mensaje y progreso ignorando un mutex envenenado.
    pub fn set(status: &Mutex<Status>, message: impl Into<String>, progress: f32) {
        if let Ok(mut s) = status.lock() {
            s.message = message.into();
            s.progress = progress;
        }
    }
}
