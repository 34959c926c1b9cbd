//! Background writer, grounded on `spatio-server::writer`'s dedicated
//! OS-thread-plus-channel pattern: mutating calls hand their payload to a
//! channel and return once queued, and a single thread drains it with
//! `blocking_recv`, so the tokio runtime's worker threads never block on the
//! substrate's synchronous lock/AOF-append path.
//!
//! After each `Set`, the writer dispatches the affected objects to the
//! geofence evaluator and publishes their details on the object bus — the
//! same place `original_source/db/object.go`'s `Set` triggers geofence
//! evaluation and event publication, after the write that makes them visible.

use std::collections::HashMap;
use std::sync::Arc;

use geodb_types::{Object, ObjectDetail};
use tokio::sync::{mpsc, oneshot};

use geodb_core::{Error, GeofenceEvaluator, ObjectBus, ObjectStore, Result};

pub enum WriteOp {
    Set {
        objects: HashMap<String, Object>,
        reply: oneshot::Sender<Result<HashMap<String, ObjectDetail>>>,
    },
    Delete {
        keys: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Overwrites one key's already-persisted detail in place, used once the
    /// facade has attached the address/timezone side-tables a `Set` flagged
    /// for — those lookups are async and run outside this thread, but the
    /// write back into the substrate still belongs here.
    PutDetail {
        detail: ObjectDetail,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Spawns the writer thread and returns the channel handle used to submit
/// ops. `buffer_size` bounds how many writes may be queued ahead of the
/// thread; callers awaiting a reply still see backpressure if the channel
/// is full.
pub fn spawn_background_writer(
    store: Arc<ObjectStore>,
    object_bus: Arc<ObjectBus>,
    evaluator: Arc<GeofenceEvaluator>,
    buffer_size: usize,
) -> mpsc::Sender<WriteOp> {
    let (tx, mut rx) = mpsc::channel(buffer_size);

    std::thread::spawn(move || {
        while let Some(op) = rx.blocking_recv() {
            match op {
                WriteOp::Set { objects, reply } => {
                    let result = store.set(objects);
                    if let Ok(details) = &result {
                        for detail in details.values() {
                            object_bus.publish(detail.clone());
                            evaluator.dispatch(detail.object.clone());
                        }
                    } else if let Err(e) = &result {
                        log::error!("geodb: background set failed: {e}");
                    }
                    let _ = reply.send(result);
                }
                WriteOp::Delete { keys, reply } => {
                    let result = store.delete(&keys);
                    if let Err(e) = &result {
                        log::error!("geodb: background delete failed: {e}");
                    }
                    let _ = reply.send(result);
                }
                WriteOp::PutDetail { detail, reply } => {
                    let result = store.put_detail(&detail);
                    match &result {
                        Ok(()) => object_bus.publish(detail),
                        Err(e) => log::error!("geodb: background put_detail failed: {e}"),
                    }
                    let _ = reply.send(result);
                }
            }
        }
        log::info!("geodb: background writer shutting down");
    });

    tx
}

/// Submits `op` and awaits its reply, translating a dropped-channel
/// condition (the writer thread panicked or shut down) into an internal
/// error rather than panicking the caller.
pub async fn submit_set(
    tx: &mpsc::Sender<WriteOp>,
    objects: HashMap<String, Object>,
) -> Result<HashMap<String, geodb_types::ObjectDetail>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(WriteOp::Set { objects, reply: reply_tx })
        .await
        .map_err(|_| Error::internal("writer channel closed"))?;
    reply_rx.await.map_err(|_| Error::internal("writer dropped the reply"))?
}

pub async fn submit_delete(tx: &mpsc::Sender<WriteOp>, keys: Vec<String>) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(WriteOp::Delete { keys, reply: reply_tx })
        .await
        .map_err(|_| Error::internal("writer channel closed"))?;
    reply_rx.await.map_err(|_| Error::internal("writer dropped the reply"))?
}

pub async fn submit_put_detail(tx: &mpsc::Sender<WriteOp>, detail: ObjectDetail) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(WriteOp::PutDetail { detail, reply: reply_tx })
        .await
        .map_err(|_| Error::internal("writer channel closed"))?;
    reply_rx.await.map_err(|_| Error::internal("writer dropped the reply"))?
}
