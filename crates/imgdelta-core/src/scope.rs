use crate::DeltaError;
use imgdelta_store::ImageStore;
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Mount `image`'s root, run `body` with its path, and unmount it on every
/// exit path.
///
/// A failed unmount after a successful body is the result. When the body has
/// already failed its error wins and the unmount failure is logged.
pub async fn with_root_mounted<S, F, Fut, T>(
    store: &S,
    image: &str,
    body: F,
) -> Result<T, DeltaError>
where
    S: ImageStore + ?Sized,
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, DeltaError>>,
{
    with_root_mounted_collecting(store, image, &mut Vec::new(), body).await
}

/// Like [`with_root_mounted`], but an unmount failure that follows a failed
/// body is also pushed onto `secondary` so the caller can report it.
pub async fn with_root_mounted_collecting<S, F, Fut, T>(
    store: &S,
    image: &str,
    secondary: &mut Vec<DeltaError>,
    body: F,
) -> Result<T, DeltaError>
where
    S: ImageStore + ?Sized,
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, DeltaError>>,
{
    let root = store.mount_root(image).await?;
    debug!("mounted {image} at {}", root.display());

    let result = body(root).await;

    match (result, store.unmount_root(image).await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(release.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release)) => {
            warn!("failed to unmount {image} after error: {release}");
            secondary.push(release.into());
            Err(e)
        }
    }
}
