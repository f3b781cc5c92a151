mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "skilleval-cli")]
#[command(about = "SkillEval CLI - Submit, inspect and cancel skill evaluations", long_about = None)]
struct Cli {
    /// Redis URL (defaults to $REDIS_URL, then redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a test suite against a skill package
    Submit {
        /// Skill version identifier
        #[arg(short = 'v', long)]
        skill_version: String,

        /// Path of the skill package directory, as seen by the workers
        #[arg(short = 'p', long)]
        skill_path: String,

        /// JSON file with the test cases (array, or object with "testCases")
        #[arg(short, long)]
        tests: String,

        /// Block until the evaluation finishes
        #[arg(long, default_value = "false")]
        wait: bool,
    },

    /// Show the current state of an evaluation
    Status {
        job_id: String,

        /// Poll until the evaluation is COMPLETED or FAILED
        #[arg(long, default_value = "false")]
        wait: bool,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Print the raw JSON result
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Request cancellation of a pending or running evaluation
    Cancel { job_id: String },

    /// Move jobs whose worker lease expired back to pending
    RequeueStale,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let queue = commands::connect(cli.redis_url.as_deref()).await?;

    match cli.command {
        Commands::Submit {
            skill_version,
            skill_path,
            tests,
            wait,
        } => {
            let job_id = commands::submit(&queue, &skill_version, &skill_path, &tests).await?;
            if wait {
                commands::status(&queue, &job_id, true, 1000, false).await?;
            }
        }
        Commands::Status {
            job_id,
            wait,
            interval_ms,
            json,
        } => {
            commands::status(&queue, &job_id, wait, interval_ms, json).await?;
        }
        Commands::Cancel { job_id } => {
            commands::cancel(&queue, &job_id).await?;
        }
        Commands::RequeueStale => {
            commands::requeue_stale(&queue).await?;
            println!("Pending jobs: {}", queue.pending_len().await?);
        }
    }

    Ok(())
}
