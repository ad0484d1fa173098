use super::{json_pretty, CommandResult, Context, EXIT_SUCCESS};
use std::path::Path;

/// Copy a directory tree into the store as a new single-layer image.
pub async fn run(
    ctx: &Context,
    dir: &Path,
    name: Option<&str>,
    config: Option<&Path>,
) -> CommandResult {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()).into());
    }
    let image_config = match config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("invalid image config {}: {e}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let store = ctx.open_store()?;
    let record = store.import(dir, image_config, name).await?;

    if ctx.json {
        println!("{}", json_pretty(&record)?);
    } else {
        println!("{}", record.id);
    }
    Ok(EXIT_SUCCESS)
}
