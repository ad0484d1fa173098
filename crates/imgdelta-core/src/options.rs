use imgdelta_runtime::Tools;
use imgdelta_schema::{HeaderMode, DEFAULT_MAX_HEADER_LEN};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on waiting for the replay rsync to exit once its input is
/// complete, independent of the caller's forwarding timeout.
pub const RSYNC_EXIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Sink for human-readable progress milestones. Every message is also
/// logged at debug level.
#[derive(Clone)]
pub struct Progress(Option<Arc<dyn Fn(&str) + Send + Sync>>);

impl Progress {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(sink)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!("{message}");
        if let Some(sink) = &self.0 {
            sink(message);
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Progress(sink)"
        } else {
            "Progress(none)"
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub header: HeaderMode,
    /// rsync `--timeout`; zero disables it.
    pub io_timeout: Duration,
    pub progress: Progress,
    pub tools: Tools,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub header: HeaderMode,
    /// Bound on forwarding the batch into rsync. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Bound on rsync exiting after its input is closed.
    pub exit_timeout: Duration,
    /// Most header bytes accepted before the separator.
    pub max_header_len: usize,
    pub progress: Progress,
    pub tools: Tools,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            header: HeaderMode::V2,
            timeout: None,
            exit_timeout: RSYNC_EXIT_TIMEOUT,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            progress: Progress::none(),
            tools: Tools::default(),
        }
    }
}
