use crate::orchestrator::{FrameOutcome, SessionOrchestrator};
use image::RgbImage;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline queue is full; frame dropped")]
    Busy,
    #[error("pipeline thread exited")]
    ChannelClosed,
    #[error("failed to start pipeline runtime: {0}")]
    Runtime(std::io::Error),
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("cannot decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB frame.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// A frame queued for the pipeline thread.
struct FrameRequest {
    frame: RgbImage,
    session_id: String,
    reply: oneshot::Sender<FrameOutcome>,
}

/// Clone-safe handle to the pipeline thread.
///
/// Frames from every clone are processed one at a time in arrival order.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<FrameRequest>,
}

impl PipelineHandle {
    /// Queue a frame, waiting for space, and wait for its outcome.
    pub async fn submit(&self, frame: RgbImage, session_id: &str) -> Result<FrameOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(FrameRequest {
                frame,
                session_id: session_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Queue a frame only if there is space; live sources drop the frame on `Busy`.
    pub async fn try_submit(&self, frame: RgbImage, session_id: &str) -> Result<FrameOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(FrameRequest {
                frame,
                session_id: session_id.to_string(),
                reply: reply_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Busy,
                TrySendError::Closed(_) => EngineError::ChannelClosed,
            })?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Run `orchestrator` on a dedicated OS thread behind a bounded queue.
///
/// The thread builds its own current-thread runtime and exits once every
/// handle has been dropped.
pub fn spawn_pipeline(mut orchestrator: SessionOrchestrator, queue_depth: usize) -> Result<PipelineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<FrameRequest>(queue_depth.max(1));
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();

    std::thread::Builder::new()
        .name("rollcall-pipeline".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!(queue_depth, "pipeline thread started");
            while let Some(req) = rx.blocking_recv() {
                let outcome = runtime.block_on(orchestrator.process(&req.frame, &req.session_id));
                // The submitter may have stopped waiting.
                let _ = req.reply.send(outcome);
            }
            tracing::info!("pipeline thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    ready_rx
        .recv()
        .map_err(|_| EngineError::ChannelClosed)?
        .map_err(EngineError::Runtime)?;

    Ok(PipelineHandle { tx })
}
