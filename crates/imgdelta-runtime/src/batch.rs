use crate::process::{SupervisedProcess, FORCE_KILL_SIGNAL};
use crate::tools::Tools;
use crate::RuntimeError;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

/// File name of the named pipe inside the batch temp directory.
pub const PIPE_NAME: &str = "rsync.pipe";

/// rsync arguments that write the batch turning `base_root` into
/// `target_root` into `pipe`.
///
/// A batch records the changes that make rsync's destination match its
/// source, so the new image root is rsync's source and the old image root
/// is its destination. `--only-write-batch` leaves the destination untouched.
pub fn generate_args(
    pipe: &Path,
    base_root: &Path,
    target_root: &Path,
    io_timeout: Duration,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--archive",
        "--compress",
        "--checksum",
        "--no-i-r",
        "--delete",
        "--hard-links",
        "--timeout",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(io_timeout.as_secs().to_string().into());
    args.push("--compress-level=9".into());
    args.push("--one-file-system".into());
    args.push("--only-write-batch".into());
    args.push(pipe.into());
    args.push(dir_arg(target_root));
    args.push(dir_arg(base_root));
    args
}

/// rsync arguments that replay a batch read from stdin onto `dst_root`.
pub fn replay_args(dst_root: &Path) -> Vec<OsString> {
    vec![
        "--archive".into(),
        "--delete".into(),
        "--read-batch".into(),
        "-".into(),
        dir_arg(dst_root),
    ]
}

/// rsync arguments for a hardlink copy of `src_root` into `dst_root`.
/// Unchanged files found under any of `link_dests` are hardlinked instead of
/// copied.
pub fn hardlink_copy_args(src_root: &Path, dst_root: &Path, link_dests: &[PathBuf]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--archive".into(), "--delete".into()];
    for dest in link_dests {
        args.push("--link-dest".into());
        args.push(dest.into());
    }
    args.push(dir_arg(src_root));
    args.push(dir_arg(dst_root));
    args
}

/// Directory argument with a trailing slash, so rsync copies contents rather
/// than the directory itself.
fn dir_arg(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_owned();
    if !arg.as_bytes().ends_with(b"/") {
        arg.push("/");
    }
    arg
}

/// Readable end of the batch pipe.
///
/// Owns the temp directory holding the pipe; dropping the stream (or calling
/// [`close`](Self::close)) removes it.
pub struct BatchStream {
    file: tokio::fs::File,
    pipe: PathBuf,
    dir: Option<TempDir>,
}

impl BatchStream {
    pub fn pipe_path(&self) -> &Path {
        &self.pipe
    }

    /// Close the pipe and remove the temp directory, reporting removal errors.
    pub fn close(mut self) -> std::io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl AsyncRead for BatchStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// Stage a temp dir and named pipe, start rsync writing the batch from
/// `base_root` to `target_root` into it, and open the pipe for reading.
///
/// If the pipe cannot be opened (including rsync dying before it opens its
/// end), rsync is killed with [`FORCE_KILL_SIGNAL`], its exit awaited, the
/// temp dir removed, and the failure returned.
pub async fn create_batch_stream(
    tools: &Tools,
    base_root: &Path,
    target_root: &Path,
    io_timeout: Duration,
) -> Result<(SupervisedProcess, BatchStream), RuntimeError> {
    let dir = tempfile::Builder::new().prefix("imgdelta-batch-").tempdir()?;
    let pipe = dir.path().join(PIPE_NAME);
    mkfifo(&pipe, 0o600)?;

    let mut cmd = tools.rsync(generate_args(&pipe, base_root, target_root, io_timeout));
    cmd.stderr(Stdio::null());
    let process = SupervisedProcess::spawn(&mut cmd);

    match open_pipe(&pipe, &process).await {
        Ok(file) => {
            debug!("batch pipe {} open", pipe.display());
            Ok((
                process,
                BatchStream {
                    file: tokio::fs::File::from_std(file),
                    pipe,
                    dir: Some(dir),
                },
            ))
        }
        Err(e) => {
            warn!("failed to open batch pipe for reading, killing rsync: {e}");
            if let Err(kill_err) = process.kill(FORCE_KILL_SIGNAL) {
                warn!("{kill_err}");
            }
            match process.wait().await {
                Ok(()) => debug!("rsync exited"),
                Err(exit) => warn!("rsync exited with error: {exit}"),
            }
            if let Err(rm) = dir.close() {
                warn!("failed to remove batch temp dir: {rm}");
            }
            Err(e)
        }
    }
}

/// Open the read end of `pipe`, racing the writer's exit.
///
/// Opening a FIFO for reading blocks until a writer shows up. If rsync exits
/// first, the pending open is released by briefly holding a read-write handle
/// on the pipe (which never blocks on Linux and counts as a writer).
async fn open_pipe(
    pipe: &Path,
    process: &SupervisedProcess,
) -> Result<std::fs::File, RuntimeError> {
    let path = pipe.to_path_buf();
    let mut open = tokio::task::spawn_blocking(move || std::fs::File::open(path));

    tokio::select! {
        biased;
        opened = &mut open => Ok(flatten_join(opened)?),
        outcome = process.outcome() => {
            let unblock = std::fs::OpenOptions::new().read(true).write(true).open(pipe);
            if let Err(e) = &unblock {
                warn!("failed to release pending pipe open: {e}");
            }
            let opened = flatten_join(open.await);
            drop(unblock);
            outcome.into_result(process.program())?;
            // rsync finished cleanly and its batch is already buffered in
            // the pipe.
            Ok(opened?)
        }
    }
}

fn flatten_join(
    joined: Result<std::io::Result<std::fs::File>, tokio::task::JoinError>,
) -> std::io::Result<std::fs::File> {
    joined.map_err(std::io::Error::other)?
}

#[allow(unsafe_code)]
fn mkfifo(path: &Path, mode: libc::mode_t) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), mode) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
