use crate::options::CreateOptions;
use crate::scope::with_root_mounted;
use crate::DeltaError;
use imgdelta_runtime::{create_batch_stream, BatchStream, SupervisedProcess, FORCE_KILL_SIGNAL};
use imgdelta_schema::{encode_header, DeltaMetadata, ProtocolError};
use imgdelta_store::ImageStore;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateReport {
    /// Total bytes written to the output, header included.
    pub bytes_written: u64,
    /// Header bytes including the separator; zero in legacy mode.
    pub header_len: u64,
}

/// Write a delta turning `src_image` into `dst_image` to `out`.
///
/// Both roots stay mounted until rsync has exited. The output is flushed but
/// not shut down.
pub async fn create_delta<S, W>(
    store: &S,
    src_image: &str,
    dst_image: &str,
    options: &CreateOptions,
    out: &mut W,
) -> Result<CreateReport, DeltaError>
where
    S: ImageStore + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    with_root_mounted(store, src_image, move |src_root| async move {
        with_root_mounted(store, dst_image, move |dst_root| async move {
            stream_delta(store, dst_image, &src_root, &dst_root, options, out).await
        })
        .await
    })
    .await
}

async fn stream_delta<S, W>(
    store: &S,
    dst_image: &str,
    src_root: &Path,
    dst_root: &Path,
    options: &CreateOptions,
    out: &mut W,
) -> Result<CreateReport, DeltaError>
where
    S: ImageStore + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    options.progress.emit(format!(
        "Invoking rsync from {} to {}",
        src_root.display(),
        dst_root.display()
    ));

    let (config, generated) = tokio::join!(
        store.inspect(dst_image),
        create_batch_stream(&options.tools, src_root, dst_root, options.io_timeout),
    );
    let (config, (process, mut batch)) = match (config, generated) {
        (Ok(config), Ok(generated)) => (config, generated),
        (Err(e), Ok((process, batch))) => {
            abort_generator(&process, batch).await;
            return Err(e.into());
        }
        (Ok(_), Err(e)) => return Err(e.into()),
        (Err(inspect), Err(generate)) => {
            warn!("batch generation failed too: {generate}");
            return Err(inspect.into());
        }
    };
    options.progress.emit("Extracted image config");

    let written = write_delta(config, &mut batch, options, out).await;

    if let Err(e) = batch.close() {
        warn!("failed to remove batch temp dir: {e}");
    }
    if written.is_err() {
        if let Err(e) = process.kill(FORCE_KILL_SIGNAL) {
            warn!("{e}");
        }
    }
    let exited = process.wait().await;
    options.progress.emit("rsync exited");

    match (written, exited) {
        (Ok(report), Ok(())) => {
            info!(
                "delta written: {} bytes ({} header)",
                report.bytes_written, report.header_len
            );
            Ok(report)
        }
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), exited) => {
            if let Err(exit) = exited {
                debug!("rsync after output failure: {exit}");
            }
            Err(e)
        }
    }
}

async fn write_delta<W>(
    config: serde_json::Value,
    batch: &mut BatchStream,
    options: &CreateOptions,
    out: &mut W,
) -> Result<CreateReport, DeltaError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut report = CreateReport::default();
    if options.header.has_header() {
        let header =
            encode_header(&DeltaMetadata::new(config)).map_err(ProtocolError::InvalidJson)?;
        out.write_all(&header).await?;
        report.header_len = header.len() as u64;
    }
    let copied = tokio::io::copy(batch, out).await?;
    out.flush().await?;
    report.bytes_written = report.header_len + copied;
    Ok(report)
}

/// Stop a generator whose output will never be read.
async fn abort_generator(process: &SupervisedProcess, batch: BatchStream) {
    if let Err(e) = batch.close() {
        warn!("failed to remove batch temp dir: {e}");
    }
    if let Err(e) = process.kill(FORCE_KILL_SIGNAL) {
        warn!("{e}");
    }
    if let Err(e) = process.wait().await {
        debug!("aborted rsync: {e}");
    }
}
