//! Byte-stream front ends for the encoder and decoder.
//!
//! [`spawn_create_delta`] runs [`create_delta`] on a task and hands back a
//! [`DeltaReader`]; a pipeline failure shows up as an `io::Error` when the
//! reader reaches end of stream. [`spawn_apply_delta`] runs [`apply_delta`]
//! on a task fed by a [`DeltaWriter`] and reports the outcome on an event
//! channel: `Id` then `Close` on success, or the primary `Error`, any
//! cleanup `Error`s, then `Close` on failure. `Close` is always the last
//! event and is sent after cleanup has finished.

use crate::decoder::apply_delta;
use crate::encoder::{create_delta, CreateReport};
use crate::options::{ApplyOptions, CreateOptions};
use crate::DeltaError;
use imgdelta_schema::ImageId;
use imgdelta_store::ImageStore;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug)]
pub enum DeltaEvent {
    /// Apply succeeded; the new image's id.
    Id(ImageId),
    Error(DeltaError),
    /// Terminal. Always sent exactly once, after cleanup.
    Close,
}

/// Readable delta stream produced by a background [`create_delta`].
pub struct DeltaReader {
    inner: DuplexStream,
    task: Option<JoinHandle<Result<CreateReport, DeltaError>>>,
    outcome: Option<Result<CreateReport, DeltaError>>,
}

impl DeltaReader {
    /// Wait for the producer and return its report or its typed error.
    ///
    /// Dropping unread output makes the producer fail with a broken pipe, so
    /// read to end of stream first.
    pub async fn finish(mut self) -> Result<CreateReport, DeltaError> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.task.take() {
            Some(task) => flatten(task.await),
            None => Err(DeltaError::Io(io::Error::other(
                "delta producer outcome already consumed",
            ))),
        }
    }
}

fn flatten(
    joined: Result<Result<CreateReport, DeltaError>, tokio::task::JoinError>,
) -> Result<CreateReport, DeltaError> {
    joined.unwrap_or_else(|e| Err(DeltaError::Io(io::Error::other(e))))
}

impl AsyncRead for DeltaReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // End of stream: the producer has finished or failed.
        if let Some(task) = this.task.as_mut() {
            let outcome = flatten(ready!(Pin::new(task).poll(cx)));
            this.task = None;
            let failure = outcome.as_ref().err().map(ToString::to_string);
            this.outcome = Some(outcome);
            if let Some(message) = failure {
                return Poll::Ready(Err(io::Error::other(message)));
            }
        }
        if let Some(Err(e)) = &this.outcome {
            return Poll::Ready(Err(io::Error::other(e.to_string())));
        }
        Poll::Ready(Ok(()))
    }
}

/// Start [`create_delta`] in the background and return its output stream.
pub fn spawn_create_delta<S>(
    store: Arc<S>,
    src_image: impl Into<String>,
    dst_image: impl Into<String>,
    options: CreateOptions,
) -> DeltaReader
where
    S: ImageStore + ?Sized + 'static,
{
    let (mut tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let src_image = src_image.into();
    let dst_image = dst_image.into();
    let task = tokio::spawn(async move {
        let result = create_delta(&*store, &src_image, &dst_image, &options, &mut tx).await;
        if result.is_ok() {
            tx.shutdown().await?;
        }
        debug!("create task finished: {}", result.is_ok());
        result
    });
    DeltaReader {
        inner: rx,
        task: Some(task),
        outcome: None,
    }
}

/// Writable end feeding a background [`apply_delta`]. Shut it down (or drop
/// it) to mark the end of the delta.
pub struct DeltaWriter {
    inner: DuplexStream,
}

impl AsyncWrite for DeltaWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Start [`apply_delta`] in the background. Write the delta into the
/// returned writer and watch the receiver for the outcome.
pub fn spawn_apply_delta<S>(
    store: Arc<S>,
    src_image: Option<String>,
    options: ApplyOptions,
) -> (DeltaWriter, mpsc::UnboundedReceiver<DeltaEvent>)
where
    S: ImageStore + ?Sized + 'static,
{
    let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (events, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        match apply_delta(&*store, src_image.as_deref(), rx, &options).await {
            Ok(report) => {
                let _ = events.send(DeltaEvent::Id(report.image_id));
            }
            Err(failure) => {
                let _ = events.send(DeltaEvent::Error(failure.primary));
                for secondary in failure.secondary {
                    let _ = events.send(DeltaEvent::Error(secondary));
                }
            }
        }
        let _ = events.send(DeltaEvent::Close);
    });
    (DeltaWriter { inner: tx }, receiver)
}
