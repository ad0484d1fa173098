use crate::lifecycle::{ApplyLifecycle, ApplyState};
use crate::options::ApplyOptions;
use crate::scope::with_root_mounted_collecting;
use crate::{ApplyError, DeltaError};
use imgdelta_runtime::{
    replay_args, run_to_completion, BaselinePlan, SupervisedProcess, FORCE_KILL_SIGNAL,
};
use imgdelta_schema::{Consumed, DeltaMetadata, DriverKind, HeaderParser, ImageId};
use imgdelta_store::ImageStore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub image_id: ImageId,
    /// Batch bytes handed to rsync (everything after the header).
    pub bytes_forwarded: u64,
}

/// Apply the delta read from `input`, starting from `src_image` if given.
///
/// On success the new image's id is returned. On failure the destination
/// image created along the way is removed. A source root that fails to
/// unmount and a failed removal are reported in [`ApplyError::secondary`],
/// in that order.
pub async fn apply_delta<S, R>(
    store: &S,
    src_image: Option<&str>,
    input: R,
    options: &ApplyOptions,
) -> Result<ApplyReport, ApplyError>
where
    S: ImageStore + ?Sized,
    R: AsyncRead + Unpin + Send,
{
    let mut lifecycle = ApplyLifecycle::new();
    let mut created: Option<ImageId> = None;
    let mut release_failures = Vec::new();

    let result = {
        let lifecycle = &mut lifecycle;
        let created = &mut created;
        match src_image {
            Some(src) => {
                let body = move |root: PathBuf| async move {
                    let source = Source { image: src, root };
                    run_apply(store, Some(source), input, options, lifecycle, created).await
                };
                with_root_mounted_collecting(store, src, &mut release_failures, body).await
            }
            None => run_apply(store, None, input, options, lifecycle, created).await,
        }
    };

    let primary = match result {
        Ok(report) => return Ok(report),
        Err(e) => e,
    };

    if let Err(e) = lifecycle.advance(ApplyState::ErrorCleanup) {
        warn!("{e}");
    }
    warn!("apply failed ({}): {primary}", primary.kind());
    options.progress.emit(format!("Error: {primary}"));

    let mut failure = ApplyError::new(primary);
    failure.secondary.append(&mut release_failures);
    if let Some(id) = created {
        match store.remove_image(&id).await {
            Ok(()) => options.progress.emit(format!("Removed image {id}")),
            Err(e) => {
                warn!("failed to remove image {id} after failed apply: {e}");
                failure.secondary.push(e.into());
            }
        }
    }
    Err(failure)
}

struct Source<'a> {
    image: &'a str,
    root: PathBuf,
}

async fn run_apply<S, R>(
    store: &S,
    source: Option<Source<'_>>,
    mut input: R,
    options: &ApplyOptions,
    lifecycle: &mut ApplyLifecycle,
    created: &mut Option<ImageId>,
) -> Result<ApplyReport, DeltaError>
where
    S: ImageStore + ?Sized,
    R: AsyncRead + Unpin + Send,
{
    let progress = &options.progress;

    let (config, remainder) = if options.header.has_header() {
        let (metadata, remainder) = read_header(&mut input, options.max_header_len).await?;
        progress.emit("Extracted image config");
        (metadata.docker_config, remainder)
    } else {
        (serde_json::Value::Object(serde_json::Map::new()), Vec::new())
    };

    let source_ref = source.as_ref().map(|s| (s.image, s.root.as_path()));
    let (image, plan) = tokio::join!(
        store.create_empty_image(&config),
        plan_baseline(store, source_ref),
    );
    let image_id = image?;
    *created = Some(image_id.clone());
    progress.emit(format!("Created empty image {image_id}"));
    let plan = plan?;

    let dst_root = store.root_dir(&image_id).await?;
    plan.execute(&dst_root, &options.tools).await?;
    progress.emit(format!("Prepared {plan} at {}", dst_root.display()));
    lifecycle.advance(ApplyState::BaselineReady)?;

    let mut cmd = options.tools.rsync(replay_args(&dst_root));
    cmd.stdin(Stdio::piped()).stderr(Stdio::null());
    progress.emit(format!(
        "Spawning rsync with arguments {}",
        replay_args(&dst_root)
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    ));
    let mut process = SupervisedProcess::spawn(&mut cmd);
    lifecycle.advance(ApplyState::BatchStreaming)?;

    let bytes_forwarded =
        match forward_batch(&mut process, remainder, &mut input, options.timeout).await {
            Ok(n) => n,
            Err(e) => return Err(abort_replay(&process, e, options.exit_timeout).await),
        };
    progress.emit("Batch input stream ended; waiting for rsync...");
    lifecycle.advance(ApplyState::ProcessExiting)?;

    match process.wait_timeout(options.exit_timeout).await {
        Some(Ok(())) => progress.emit("rsync exited cleanly"),
        Some(Err(e)) => return Err(DeltaError::from_replay(e)),
        None => {
            let timeout = DeltaError::Timeout {
                stage: "rsync exit",
                after: options.exit_timeout,
            };
            return Err(abort_replay(&process, timeout, options.exit_timeout).await);
        }
    }

    lifecycle.advance(ApplyState::Fsync)?;
    progress.emit("fsync'ing...");
    run_to_completion(&mut options.tools.sync()).await?;

    lifecycle.advance(ApplyState::Done)?;
    progress.emit(format!("All done. Image ID: {image_id}"));
    info!("applied delta as image {image_id} ({bytes_forwarded} batch bytes)");
    Ok(ApplyReport {
        image_id,
        bytes_forwarded,
    })
}

/// Choose how to build the destination root before replay.
///
/// Without a source image there is nothing to copy and the driver is not
/// consulted. An unsupported driver fails before anything is touched.
pub async fn plan_baseline<S>(
    store: &S,
    source: Option<(&str, &Path)>,
) -> Result<BaselinePlan, DeltaError>
where
    S: ImageStore + ?Sized,
{
    let Some((image, root)) = source else {
        return Ok(BaselinePlan::Empty);
    };
    match store.driver_kind().await? {
        DriverKind::Btrfs => Ok(BaselinePlan::Snapshot {
            source: root.to_path_buf(),
        }),
        DriverKind::Overlay => Ok(BaselinePlan::HardlinkCopy {
            source: root.to_path_buf(),
            link_dests: vec![root.to_path_buf()],
        }),
        DriverKind::Aufs | DriverKind::Overlay2 => Ok(BaselinePlan::HardlinkCopy {
            source: root.to_path_buf(),
            link_dests: store.layer_diff_paths(image).await?,
        }),
        DriverKind::Unsupported(name) => Err(DeltaError::UnsupportedDriver(name)),
    }
}

async fn read_header<R>(
    input: &mut R,
    max_len: usize,
) -> Result<(DeltaMetadata, Vec<u8>), DeltaError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut parser = HeaderParser::with_limit(max_len);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = input.read(&mut chunk).await?;
        if n == 0 {
            return Err(parser.finish().into());
        }
        if let Consumed::Complete {
            metadata,
            remainder,
        } = parser.push(&chunk[..n])?
        {
            debug!(
                "header complete, {} payload bytes already buffered",
                remainder.len()
            );
            return Ok((metadata, remainder));
        }
    }
}

/// Feed the buffered remainder and the rest of `input` into rsync's stdin,
/// then close it.
async fn forward_batch<R>(
    process: &mut SupervisedProcess,
    remainder: Vec<u8>,
    input: &mut R,
    timeout: Option<Duration>,
) -> Result<u64, DeltaError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let Some(mut stdin) = process.take_stdin() else {
        // Only happens when rsync never started; report why.
        process.wait().await.map_err(DeltaError::from_replay)?;
        return Err(std::io::Error::other("rsync stdin is not available").into());
    };

    let mut batch = std::io::Cursor::new(remainder).chain(input);
    let copy = async {
        let n = tokio::io::copy(&mut batch, &mut stdin).await?;
        stdin.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let forwarded = match timeout {
        Some(limit) => tokio::time::timeout(limit, copy)
            .await
            .map_err(|_| DeltaError::Timeout {
                stage: "batch forwarding",
                after: limit,
            })??,
        None => copy.await?,
    };
    drop(stdin);
    Ok(forwarded)
}

/// Longest wait for rsync to exit on its own after it closed its input.
const CLOSED_INPUT_SETTLE: Duration = Duration::from_secs(10);

/// Force rsync down after `cause`, wait for it (bounded by `grace`), and pick
/// the error to report.
///
/// A broken pipe while forwarding means rsync stopped reading, usually
/// because it is exiting. Its exit status is then the real cause, so it is
/// collected first and the process is only killed if it keeps running.
async fn abort_replay(
    process: &SupervisedProcess,
    cause: DeltaError,
    grace: Duration,
) -> DeltaError {
    if is_broken_pipe(&cause) {
        match process.wait_timeout(grace.min(CLOSED_INPUT_SETTLE)).await {
            Some(Err(exit)) => return DeltaError::from_replay(exit),
            Some(Ok(())) => {
                debug!("rsync exited cleanly before reading the whole batch");
                return cause;
            }
            None => debug!("rsync closed its input but is still running"),
        }
    }

    warn!("killing rsync with force due to error: {cause}");
    let signalled = match process.kill(FORCE_KILL_SIGNAL) {
        Ok(sent) => sent,
        Err(e) => {
            warn!("{e}");
            true
        }
    };
    match process.wait_timeout(grace).await {
        Some(Err(exit)) if !signalled => DeltaError::from_replay(exit),
        Some(exit) => {
            debug!("rsync stopped: {exit:?}");
            cause
        }
        None => {
            warn!("rsync still running {grace:?} after being killed");
            cause
        }
    }
}

fn is_broken_pipe(error: &DeltaError) -> bool {
    matches!(error, DeltaError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgdelta_schema::encode_header;
    use imgdelta_store::MockStore;

    #[tokio::test]
    async fn no_source_plans_empty_baseline() {
        let store = MockStore::with_driver("zfs").unwrap();
        let plan = plan_baseline(&store, None).await.unwrap();
        assert_eq!(plan, BaselinePlan::Empty);
    }

    #[tokio::test]
    async fn plans_follow_driver() {
        let store = MockStore::new().unwrap();
        let id = store
            .create_empty_image(&serde_json::json!({}))
            .await
            .unwrap();
        let root = store.root_dir(&id).await.unwrap();
        let source = Some((id.as_str(), root.as_path()));

        store.set_driver(DriverKind::Btrfs);
        assert_eq!(
            plan_baseline(&store, source).await.unwrap(),
            BaselinePlan::Snapshot {
                source: root.clone()
            }
        );

        store.set_driver(DriverKind::Overlay);
        assert_eq!(
            plan_baseline(&store, source).await.unwrap(),
            BaselinePlan::HardlinkCopy {
                source: root.clone(),
                link_dests: vec![root.clone()]
            }
        );

        for driver in [DriverKind::Aufs, DriverKind::Overlay2] {
            store.set_driver(driver);
            assert_eq!(
                plan_baseline(&store, source).await.unwrap(),
                BaselinePlan::HardlinkCopy {
                    source: root.clone(),
                    link_dests: store.layer_diff_paths(&id).await.unwrap()
                }
            );
        }

        store.set_driver(DriverKind::from("devicemapper"));
        let err = plan_baseline(&store, source).await.unwrap_err();
        assert!(matches!(err, DeltaError::UnsupportedDriver(ref d) if d == "devicemapper"));
    }

    #[tokio::test]
    async fn header_split_across_reads_keeps_remainder() {
        let mut framed =
            encode_header(&DeltaMetadata::new(serde_json::json!({"x": 1}))).unwrap();
        framed.extend_from_slice(b"PAYLOAD");
        let (mut tx, mut rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            tx.write_all(&framed).await.unwrap();
        });

        let (metadata, remainder) = read_header(&mut rx, 1024).await.unwrap();
        writer.await.unwrap();
        let mut rest = Vec::new();
        rx.read_to_end(&mut rest).await.unwrap();

        assert_eq!(metadata.docker_config, serde_json::json!({"x": 1}));
        let mut payload = remainder;
        payload.extend(rest);
        assert_eq!(payload, b"PAYLOAD");
    }

    #[tokio::test]
    async fn stream_without_separator_is_truncated() {
        let mut input: &[u8] = br#"{"version":2"#;
        let err = read_header(&mut input, 1024).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut input: &[u8] = &[b' '; 4096];
        let err = read_header(&mut input, 100).await.unwrap_err();
        assert!(matches!(
            err,
            DeltaError::Protocol(imgdelta_schema::ProtocolError::HeaderTooLarge { limit: 100 })
        ));
    }
}
