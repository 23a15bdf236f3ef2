mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::RunArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vvw_core::VerificationType;

const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "vvw", version, about = "Vending-machine visual-verification workflow CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed a checking or reference image fixture under `--root`.
    SeedImage {
        /// Local directory standing in for the object store's bucket root.
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Bucket name (e.g. `checking`, `reference`).
        #[arg(long)]
        bucket: String,
        /// Object key within the bucket.
        #[arg(long)]
        key: String,
        /// Number of zero bytes to write.
        #[arg(long, default_value_t = 4096)]
        bytes: u64,
    },

    /// Seed a layout fixture under `--root`.
    SeedLayout {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Numeric layout id.
        #[arg(long)]
        layout_id: i64,
        /// Layout prefix string.
        #[arg(long)]
        layout_prefix: String,
    },

    /// Run the full verification pipeline locally against a mock backend.
    Run {
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Caller-supplied verification id, for idempotent replay.
        #[arg(long)]
        verification_id: Option<String>,

        #[arg(long)]
        vending_machine_id: String,

        #[arg(long, value_enum, default_value_t = VerificationTypeArg::LayoutVsChecking)]
        verification_type: VerificationTypeArg,

        #[arg(long)]
        checking_image_url: String,

        #[arg(long)]
        reference_image_url: Option<String>,

        #[arg(long)]
        layout_id: Option<i64>,

        #[arg(long)]
        layout_prefix: Option<String>,

        #[arg(long)]
        previous_verification_id: Option<String>,

        #[arg(long, default_value = "checking")]
        checking_bucket: String,

        #[arg(long, default_value = "reference")]
        reference_bucket: String,

        #[arg(long, default_value = "state")]
        state_bucket: String,

        /// Print the verification summary as pretty JSON instead of a
        /// one-line summary.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerificationTypeArg {
    LayoutVsChecking,
    PreviousVsCurrent,
}

impl From<VerificationTypeArg> for VerificationType {
    fn from(v: VerificationTypeArg) -> Self {
        match v {
            VerificationTypeArg::LayoutVsChecking => VerificationType::LayoutVsChecking,
            VerificationTypeArg::PreviousVsCurrent => VerificationType::PreviousVsCurrent,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("vvw=debug") } else { EnvFilter::new("vvw=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = run(cli.command).await;
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::SeedImage { root, bucket, key, bytes } => {
            commands::cmd_seed_image(&root, &bucket, &key, bytes).await
        }
        Commands::SeedLayout { root, layout_id, layout_prefix } => {
            commands::cmd_seed_layout(&root, layout_id, &layout_prefix).await
        }
        Commands::Run {
            root,
            verification_id,
            vending_machine_id,
            verification_type,
            checking_image_url,
            reference_image_url,
            layout_id,
            layout_prefix,
            previous_verification_id,
            checking_bucket,
            reference_bucket,
            state_bucket,
            json,
        } => {
            commands::cmd_run(RunArgs {
                root,
                verification_id,
                vending_machine_id,
                verification_type: verification_type.into(),
                checking_image_url,
                reference_image_url,
                layout_id,
                layout_prefix,
                previous_verification_id,
                checking_bucket,
                reference_bucket,
                state_bucket,
                json,
            })
            .await
        }
    }
}
