mod commands;
mod config;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandError, CommandResult, Context, EXIT_FAILURE};
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "imgdelta",
    version,
    about = "Binary filesystem deltas between container images"
)]
struct Cli {
    /// Path to the image store directory [default: ~/.local/share/imgdelta].
    #[arg(long, global = true)]
    store: Option<String>,

    /// Configuration file [default: ~/.config/imgdelta/config.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute the delta that turns SRC into DST.
    Create {
        /// Image the receiver already has.
        src: String,
        /// Image to reproduce on the receiver.
        dst: String,
        /// Write the delta to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Emit a header-less delta for old receivers.
        #[arg(long, default_value_t = false)]
        legacy: bool,
        /// rsync I/O timeout in seconds (0 disables it).
        #[arg(long)]
        io_timeout: Option<u64>,
    },
    /// Apply a delta and print the id of the new image.
    Apply {
        /// Image the delta was computed against. Omit for a delta from an empty image.
        #[arg(long)]
        source: Option<String>,
        /// Read the delta from a file instead of stdin.
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// The delta has no header.
        #[arg(long, default_value_t = false)]
        legacy: bool,
        /// Abort if forwarding the delta takes longer than this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the metadata header of a delta.
    Header {
        /// Read the delta from a file instead of stdin.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Import a directory tree as a new image.
    Import {
        dir: PathBuf,
        /// Human-readable name for the image.
        #[arg(long)]
        name: Option<String>,
        /// JSON file holding the image configuration.
        #[arg(long = "image-config")]
        image_config: Option<PathBuf>,
    },
    /// List all images in the store.
    Images,
    /// Remove an image.
    Rm {
        /// Image ID (full, short or prefix) or name.
        image: String,
    },
    /// Run diagnostic checks on the system and store.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IMGDELTA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e.message);
            ExitCode::from(e.code)
        }
    }
}

fn run(cli: Cli) -> CommandResult {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let ctx = Context {
        store_root: config.store_root(cli.store.as_deref()),
        config,
        json: cli.json,
    };

    // Commands that never touch the engine run without a runtime.
    let command = match cli.command {
        Commands::Header { input } => return commands::header::run(input.as_deref(), ctx.json),
        Commands::Images => return commands::images::run(&ctx),
        Commands::Doctor => return commands::doctor::run(&ctx),
        Commands::Completions { shell } => return commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => return commands::man_pages::run::<Cli>(&dir),
        other => other,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CommandError::new(EXIT_FAILURE, format!("failed to start runtime: {e}")))?;
    runtime.block_on(dispatch(&ctx, command))
}

async fn dispatch(ctx: &Context, command: Commands) -> CommandResult {
    match command {
        Commands::Create {
            src,
            dst,
            output,
            legacy,
            io_timeout,
        } => commands::create::run(ctx, &src, &dst, output.as_deref(), legacy, io_timeout).await,
        Commands::Apply {
            source,
            input,
            legacy,
            timeout,
        } => {
            commands::apply::run(ctx, source.as_deref(), input.as_deref(), legacy, timeout).await
        }
        Commands::Import {
            dir,
            name,
            image_config,
        } => commands::import::run(ctx, &dir, name.as_deref(), image_config.as_deref()).await,
        Commands::Rm { image } => commands::rm::run(ctx, &image).await,
        Commands::Header { .. }
        | Commands::Images
        | Commands::Doctor
        | Commands::Completions { .. }
        | Commands::ManPages { .. } => Err(CommandError::new(
            EXIT_FAILURE,
            "command does not run on the async runtime",
        )),
    }
}
