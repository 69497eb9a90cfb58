use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use scoutbox_runtime::logging::init_logging;
use scoutbox_runtime::{Capability, Config};

mod commands;

#[derive(Parser)]
#[command(name = "scoutbox")]
#[command(about = "Scoutbox - safety analysis and sandboxed execution of generated plotting code")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that build submissions
#[derive(Args, Debug, Clone)]
pub struct SubmissionArgs {
    /// Capability granted to the submission (repeatable; all when omitted)
    #[arg(long = "capability", value_name = "CAPABILITY")]
    pub capabilities: Vec<Capability>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a source file without running it
    Check {
        /// Python source file
        file: PathBuf,

        #[command(flatten)]
        submission: SubmissionArgs,
    },
    /// Analyze and run a source file in the sandbox
    Run {
        /// Python source file
        file: PathBuf,

        /// Dataset as JSON (table or array of records)
        #[arg(long, value_name = "FILE")]
        dataset: PathBuf,

        /// Wall-clock limit in seconds
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Address-space limit in bytes
        #[arg(long, value_name = "BYTES")]
        memory: Option<u64>,

        /// Directory to write figures and text output to
        #[arg(long, value_name = "DIR")]
        artifacts_dir: Option<PathBuf>,

        #[command(flatten)]
        submission: SubmissionArgs,
    },
    /// Extract code blocks from a model response
    Extract {
        /// Markdown response file
        response: PathBuf,

        /// Dataset as JSON, used to repair column names
        #[arg(long, value_name = "FILE")]
        dataset: PathBuf,

        /// Submit every extracted block
        #[arg(long)]
        run: bool,

        /// Directory to write figures and text output to
        #[arg(long, value_name = "DIR")]
        artifacts_dir: Option<PathBuf>,

        #[command(flatten)]
        submission: SubmissionArgs,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Invalid configuration: {}", e);
            process::exit(2);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("✗ Failed to initialize logging: {}", e);
        process::exit(2);
    }

    let outcome = match cli.command {
        Commands::Check { file, submission } => commands::check::run(&config, &file, &submission),
        Commands::Run {
            file,
            dataset,
            timeout,
            memory,
            artifacts_dir,
            submission,
        } => {
            let options = commands::run::RunOptions {
                file,
                dataset,
                timeout,
                memory,
                artifacts_dir,
                submission,
            };
            commands::run::run(config, options).await
        }
        Commands::Extract {
            response,
            dataset,
            run,
            artifacts_dir,
            submission,
        } => {
            let options = commands::extract::ExtractOptions {
                response,
                dataset,
                run,
                artifacts_dir,
                submission,
            };
            commands::extract::run(config, options).await
        }
    };

    match outcome {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("✗ {:#}", e);
            process::exit(2);
        }
    }
}
