//! Driver loop.
//!
//! The host decodes transport traffic into [`Msg`]s and feeds them to
//! [`run`], which owns the [`JobManager`] on a single task: inbound
//! messages, the batch timer, and housekeeping timers are the only
//! interleaving points, mirroring the single-threaded reactor the
//! protocol was designed for.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::housekeeping::TargetStatus;
use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{ClientId, Request};
use crate::traits::{AllocResponse, StartResponse};

/// Everything that can wake the job manager.
#[derive(Debug)]
pub enum Msg {
    Request(Request),
    AllocResponse(AllocResponse),
    FreeResponse(JobId),
    StartResponse(StartResponse),
    SchedulerError(String),
    ExecError,
    HousekeepingFinish {
        id: JobId,
        rank: u32,
        status: TargetStatus,
    },
    Disconnect(ClientId),
    Shutdown,
}

async fn commit_open_batch(jm: &mut JobManager) {
    if let Some(batch) = jm.flush_batch() {
        let kvs = jm.kvs_handle();
        let result = kvs.commit(batch.txn.clone()).await;
        let ok = result.is_ok();
        jm.complete_batch(batch, ok).await;
        jm.drain_sched_queue().await;
        jm.run_effects().await;
    }
}

/// Drive the job manager until the inbox closes, a shutdown message
/// arrives, or `shutdown` is cancelled. Returns the manager so the host
/// can inspect it; a fatal condition (KVS commit failure) surfaces as an
/// error after a clean flush attempt.
pub async fn run(
    mut jm: JobManager,
    mut inbox: mpsc::Receiver<Msg>,
    shutdown: CancellationToken,
) -> Result<JobManager> {
    loop {
        if let Some(fatal) = jm.fatal_error() {
            return Err(anyhow!("job manager fatal error: {fatal}"));
        }
        let deadline = [jm.batch_deadline(), jm.housekeeping_next_deadline()]
            .into_iter()
            .flatten()
            .min();
        let msg = match deadline {
            Some(deadline) => {
                tokio::select! {
                    msg = inbox.recv() => msg,
                    _ = shutdown.cancelled() => break,
                    _ = sleep_until(deadline) => {
                        if jm.batch_deadline().map(|d| d <= Instant::now()).unwrap_or(false) {
                            commit_open_batch(&mut jm).await;
                        }
                        jm.handle_housekeeping_timer().await;
                        continue;
                    }
                }
            }
            None => {
                tokio::select! {
                    msg = inbox.recv() => msg,
                    _ = shutdown.cancelled() => break,
                }
            }
        };
        let Some(msg) = msg else {
            break;
        };
        match msg {
            Msg::Request(request) => jm.dispatch(request).await,
            Msg::AllocResponse(response) => jm.handle_alloc_response(response).await,
            Msg::FreeResponse(id) => jm.handle_free_response(id).await,
            Msg::StartResponse(response) => jm.handle_start_response(response).await,
            Msg::SchedulerError(reason) => jm.handle_scheduler_error(&reason),
            Msg::ExecError => jm.handle_exec_error(),
            Msg::HousekeepingFinish { id, rank, status } => {
                jm.handle_housekeeping_finish(id, rank, status).await
            }
            Msg::Disconnect(client) => jm.disconnect(client),
            Msg::Shutdown => break,
        }
    }
    info!("job manager shutting down");
    jm.shutdown().await?;
    Ok(jm)
}
