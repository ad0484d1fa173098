use super::{json_pretty, CommandResult, Context, EXIT_SUCCESS};
use imgdelta_store::ImageStore;

pub async fn run(ctx: &Context, image: &str) -> CommandResult {
    let store = ctx.open_store()?;
    let record = store.resolve(image)?;
    store.remove_image(&record.id).await?;
    if ctx.json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({ "removed": record.id }))?
        );
    } else {
        println!("removed image {}", record.short_id);
    }
    Ok(EXIT_SUCCESS)
}
