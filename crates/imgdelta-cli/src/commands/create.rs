use super::{finish_spinner, json_pretty, CommandError, CommandResult, Context, EXIT_SUCCESS};
use imgdelta_core::{create_delta, CreateOptions, CreateReport};
use imgdelta_schema::HeaderMode;
use std::path::Path;
use tokio::io::AsyncWrite;

pub async fn run(
    ctx: &Context,
    src: &str,
    dst: &str,
    output: Option<&Path>,
    legacy: bool,
    io_timeout: Option<u64>,
) -> CommandResult {
    let store = ctx.open_store()?;
    let (pb, progress) = ctx.progress("Computing delta...");
    let options = CreateOptions {
        header: if legacy {
            HeaderMode::Legacy
        } else {
            HeaderMode::V2
        },
        io_timeout: ctx.config.io_timeout(io_timeout),
        progress,
        tools: ctx.config.tools.clone(),
    };

    let result = match output {
        Some(path) => write_to_file(&store, src, dst, &options, path).await,
        None => {
            let mut stdout = tokio::io::stdout();
            write_to(&store, src, dst, &options, &mut stdout).await
        }
    };
    finish_spinner(pb.as_ref(), &result, "delta created", "delta failed");
    let report = result?;

    // The summary only goes to stdout when the delta itself does not.
    let summary = if ctx.json {
        json_pretty(&serde_json::json!({
            "source": src,
            "target": dst,
            "bytes_written": report.bytes_written,
            "header_len": report.header_len,
        }))?
    } else {
        format!(
            "delta {src} -> {dst}: {} bytes ({} header)",
            report.bytes_written, report.header_len
        )
    };
    if output.is_some() {
        println!("{summary}");
    } else {
        eprintln!("{summary}");
    }
    Ok(EXIT_SUCCESS)
}

async fn write_to<W>(
    store: &imgdelta_store::DirStore,
    src: &str,
    dst: &str,
    options: &CreateOptions,
    out: &mut W,
) -> Result<CreateReport, CommandError>
where
    W: AsyncWrite + Unpin,
{
    Ok(create_delta(store, src, dst, options, out).await?)
}

/// Write into `path`, removing the partial file on failure.
async fn write_to_file(
    store: &imgdelta_store::DirStore,
    src: &str,
    dst: &str,
    options: &CreateOptions,
    path: &Path,
) -> Result<CreateReport, CommandError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| format!("failed to create {}: {e}", path.display()))?;
    let result = write_to(store, src, dst, options, &mut file).await;
    let synced = match &result {
        Ok(_) => file.sync_all().await,
        Err(_) => Ok(()),
    };
    drop(file);
    if result.is_err() || synced.is_err() {
        let _ = tokio::fs::remove_file(path).await;
    }
    synced.map_err(|e| format!("failed to sync {}: {e}", path.display()))?;
    result
}
