//! Ingesta de un corpus de ficheros en un grafo Neo4j a través de un canal
//! asíncrono: empaquetado en lotes, publicación, materialización, barrera de
//! finalización, construcción del árbol de directorios y reconciliación de
//! huérfanos.

pub mod api;
pub mod app_state;
pub mod barrier;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod extraction;
pub mod hierarchy;
pub mod materializer;
pub mod models;
pub mod neo4j_client;
pub mod packer;
pub mod pipeline;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod tree;
