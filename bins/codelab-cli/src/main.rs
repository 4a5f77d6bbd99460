mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codelab-cli")]
#[command(about = "Codelab CLI - Run and check submissions locally, manage configuration", long_about = None)]
struct Cli {
    /// Language configuration file (defaults to config/languages.json, then built-ins)
    #[arg(long, global = true, env = "LANGUAGES_CONFIG")]
    languages: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file against a challenge and print the verdict
    Run {
        /// Challenge id
        #[arg(short, long)]
        challenge: String,

        /// Language (python, javascript, sql)
        #[arg(short, long)]
        language: String,

        /// Source file to submit
        source: PathBuf,

        /// Challenge file
        #[arg(long, env = "CHALLENGES_PATH", default_value = "config/challenges.json")]
        challenges: PathBuf,

        /// Isolation backend (process, docker); overrides CODELAB_ISOLATION
        #[arg(short, long)]
        isolation: Option<String>,

        /// Print hidden test case output too
        #[arg(long, default_value = "false")]
        reveal: bool,

        /// Print the verdict as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Syntax-check a source file without running it
    Check {
        /// Language (python, javascript, sql)
        #[arg(short, long)]
        language: String,

        /// Source file to check
        source: PathBuf,
    },

    /// List configured languages
    Languages,

    /// Write default configuration files
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let languages = cli.languages.as_deref();

    let success = match cli.command {
        Commands::Run {
            challenge,
            language,
            source,
            challenges,
            isolation,
            reveal,
            json,
        } => {
            let options = commands::RunOptions {
                challenges: &challenges,
                challenge_id: &challenge,
                language: &language,
                source: &source,
                isolation: isolation.as_deref(),
                reveal,
                json,
            };
            commands::run_submission(languages, options).await?
        }
        Commands::Check { language, source } => commands::check_syntax(languages, &language, &source).await?,
        Commands::Languages => {
            commands::list_languages(languages)?;
            true
        }
        Commands::Init { path } => {
            commands::init_project(&path)?;
            true
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
