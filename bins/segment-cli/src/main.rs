mod commands;

use clap::{Parser, Subcommand};
use anyhow::Result;

#[derive(Parser)]
#[command(name = "segment-cli")]
#[command(about = "Segment CLI - Scaffold and audit the segmentation worker configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create config/worker.json and the packaged task script
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Worker image
        #[arg(short, long, default_value = "qchen99/suprem:v1")]
        image: String,

        /// Worker backend (docker or process)
        #[arg(short, long, default_value = "docker")]
        backend: String,

        /// Overwrite existing files
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Validate a worker descriptor
    Check {
        /// Descriptor path
        #[arg(short, long, default_value = "config/worker.json")]
        config: String,
    },

    /// Print the exact worker invocation for a case without running it
    Render {
        /// Descriptor path
        #[arg(short, long, default_value = "config/worker.json")]
        config: String,

        /// Work root holding inputs/ and outputs/
        #[arg(short, long, default_value = ".")]
        work_root: String,

        /// Case id (a fresh one is generated when omitted)
        #[arg(long)]
        case_id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            path,
            image,
            backend,
            force,
        } => {
            commands::init_project(&path, &image, &backend, force)?;
        }
        Commands::Check { config } => {
            commands::check_config(&config)?;
        }
        Commands::Render {
            config,
            work_root,
            case_id,
        } => {
            commands::render_invocation(&config, &work_root, case_id.as_deref())?;
        }
    }

    Ok(())
}
