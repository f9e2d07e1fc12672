//! Canal de mensajes entre productor y consumidores.
//!
//! El broker real es un colaborador externo; aquí sólo se define la interfaz
//! que usa el `Dispatcher` y una implementación en proceso con particiones,
//! límite duro de tamaño y sin orden garantizado entre particiones.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;

/// Interfaz mínima de publicación.
#[async_trait]
pub trait BatchChannel: Send + Sync {
    /// Límite duro del transporte para un mensaje.
    fn max_payload_bytes(&self) -> usize;

    /// Publica un mensaje ya serializado. `Ok` significa que el broker lo
    /// aceptó, no que alguien lo haya procesado.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Canal en memoria con `partitions` colas acotadas y reparto round-robin.
pub struct MemoryChannel {
    senders: Vec<mpsc::Sender<Vec<u8>>>,
    next: AtomicUsize,
    max_payload_bytes: usize,
}

/// Extremo consumidor de una partición. Clonable: varios consumidores
/// pueden competir por la misma partición.
#[derive(Clone)]
pub struct PartitionReceiver {
    pub partition: usize,
    inner: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl PartitionReceiver {
    /// Siguiente mensaje, o `None` cuando el canal se ha cerrado y vaciado.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inner.lock().await.recv().await
    }
}

impl MemoryChannel {
    pub fn new(
        partitions: usize,
        capacity: usize,
        max_payload_bytes: usize,
    ) -> (Self, Vec<PartitionReceiver>) {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            receivers.push(PartitionReceiver {
                partition,
                inner: Arc::new(Mutex::new(rx)),
            });
        }
        let channel = Self {
            senders,
            next: AtomicUsize::new(0),
            max_payload_bytes,
        };
        (channel, receivers)
    }
}

#[async_trait]
impl BatchChannel for MemoryChannel {
    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    async fn publish(&self, _key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if payload.len() > self.max_payload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[idx]
            .send(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
