use super::{json_pretty, CommandResult, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context) -> CommandResult {
    let store = ctx.open_store()?;
    let images = store.list()?;
    if ctx.json {
        println!("{}", json_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images found");
    } else {
        println!("{:<14} {:<16} {:<26} IMAGE_ID", "SHORT_ID", "NAME", "CREATED");
        for image in &images {
            println!(
                "{:<14} {:<16} {:<26} {}",
                image.short_id,
                image.name.as_deref().unwrap_or(""),
                image.created_at,
                image.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
