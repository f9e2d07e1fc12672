use std::sync::{Arc, Mutex};

use axum::Router;
use neo4j_corpus_graph::{
    api,
    app_state::{AppState, Status},
    cancel::CancelSignal,
    channel::{BatchChannel, MemoryChannel},
    config::{self, LlmProvider},
    dead_letter::{DeadLetterSink, DirectoryDeadLetterSink},
    dispatcher::Dispatcher,
    extraction::{Extractor, LlmExtractor, NoopExtractor},
    materializer::{Materializer, MaterializerPool},
    neo4j_client::{self, Neo4jStore},
    pipeline::{self, PipelineContext},
    store::GraphStore,
};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mensajes en vuelo por partición antes de que `publish` espere.
const CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = neo4j_client::connect_from_config(&cfg)
        .await
        .expect("Error conectando a Neo4j");
    neo4j_client::ensure_schema(&graph)
        .await
        .expect("Error asegurando el esquema de Neo4j");
    let store: Arc<dyn GraphStore> = Arc::new(Neo4jStore::new(graph));

    // 4. Extractor de entidades
    let extractor: Arc<dyn Extractor> = match cfg.llm_provider {
        LlmProvider::Disabled => {
            info!("Extracción LLM desactivada: sólo se materializa la estructura.");
            Arc::new(NoopExtractor)
        }
        _ => Arc::new(LlmExtractor::from_config(&cfg)),
    };

    // 5. Canal, dead-letters y consumidores
    let (channel, receivers) = MemoryChannel::new(
        cfg.channel_partitions,
        CHANNEL_CAPACITY,
        cfg.transport_max_payload_bytes,
    );
    let channel: Arc<dyn BatchChannel> = Arc::new(channel);
    let dead_letters: Arc<dyn DeadLetterSink> =
        Arc::new(DirectoryDeadLetterSink::new(&cfg.dead_letter_dir));
    let dispatcher = Dispatcher::new(
        channel,
        dead_letters.clone(),
        cfg.retry,
        cfg.max_split_depth,
    );

    let consumers_cancel = CancelSignal::new();
    let materializer = Arc::new(Materializer::new(store.clone(), extractor, cfg.retry));
    let consumers = MaterializerPool::spawn(
        materializer,
        receivers,
        cfg.materializer_workers,
        dead_letters,
        cfg.retry,
        consumers_cancel.clone(),
    );
    info!(
        workers = cfg.materializer_workers,
        partitions = cfg.channel_partitions,
        "Consumidores del materializador en marcha"
    );

    let pipeline = PipelineContext {
        store: store.clone(),
        dispatcher,
        limits: cfg.pack,
        barrier: cfg.barrier,
        retry: cfg.retry,
        tree_batch_size: cfg.tree_batch_size,
        reconcile_batch_size: cfg.reconcile_batch_size,
    };

    let last_reconcile = Arc::new(Mutex::new(None));
    let reconcile_loop = pipeline::spawn_reconcile_loop(
        pipeline.clone(),
        cfg.reconcile_scope.clone(),
        cfg.reconcile_interval,
        consumers_cancel.clone(),
        last_reconcile.clone(),
    );

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 6. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        pipeline,
        consumers: Arc::new(consumers),
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        current_dir: Arc::new(Mutex::new(None)),
        run_cancel: Arc::new(Mutex::new(CancelSignal::new())),
        last_run: Arc::new(Mutex::new(None)),
        last_reconcile,
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 7. Configurar el router de la API
    let app = Router::new().merge(api::create_router(app_state.clone())).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await.unwrap();
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .unwrap();

    app_state.run_cancel.lock().unwrap().cancel();
    consumers_cancel.cancel();
    if let Some(handle) = reconcile_loop {
        handle.await.ok();
    }
    info!("✅ Servidor cerrado correctamente.");
}
