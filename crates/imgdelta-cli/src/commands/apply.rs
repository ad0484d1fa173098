use super::{finish_spinner, json_pretty, CommandResult, Context, EXIT_SUCCESS};
use imgdelta_core::{apply_delta, ApplyOptions};
use imgdelta_schema::HeaderMode;
use std::path::Path;

pub async fn run(
    ctx: &Context,
    source: Option<&str>,
    input: Option<&Path>,
    legacy: bool,
    timeout: Option<u64>,
) -> CommandResult {
    let store = ctx.open_store()?;
    let (pb, progress) = ctx.progress("Applying delta...");
    let mut options = ApplyOptions {
        header: if legacy {
            HeaderMode::Legacy
        } else {
            HeaderMode::V2
        },
        timeout: ctx.config.apply_timeout(timeout),
        progress,
        tools: ctx.config.tools.clone(),
        ..ApplyOptions::default()
    };
    if let Some(exit_timeout) = ctx.config.exit_timeout() {
        options.exit_timeout = exit_timeout;
    }

    let result = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
            apply_delta(&store, source, file, &options).await
        }
        None => apply_delta(&store, source, tokio::io::stdin(), &options).await,
    };
    finish_spinner(pb.as_ref(), &result, "delta applied", "delta failed");
    let report = result?;

    if ctx.json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({
                "image_id": report.image_id,
                "source": source,
                "bytes_forwarded": report.bytes_forwarded,
            }))?
        );
    } else {
        println!("{}", report.image_id);
    }
    Ok(EXIT_SUCCESS)
}
