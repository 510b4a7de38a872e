use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use insight_engine::insight::build_driver;
use insight_engine::insight::conversation::ConversationDriver;
use insight_engine::shared::config::{expand_path, InsightConfig};
use insight_engine::shared::logging;
use insight_engine::shared::models::ConversationRequest;

#[derive(Parser)]
#[command(name = "insight")]
#[command(about = "Insight - answer business questions with a tool-using text model")]
struct Args {
    /// Config file (JSON). Defaults apply when it does not exist.
    #[arg(long, env = "INSIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Subject (tenant) the questions are about
    #[arg(long, env = "INSIGHT_SUBJECT_ID")]
    subject: String,

    /// Directory of .csv/.json tables; overrides data.dir
    #[arg(long, env = "INSIGHT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print the full turn transcript instead of only the response
    #[arg(long)]
    transcript: bool,

    /// Question to answer; read line by line from stdin when omitted
    question: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_path) = match &args.config {
        Some(path) if path.exists() => (InsightConfig::load_from_path(path)?, path.clone()),
        Some(path) => {
            anyhow::bail!("Config file {} does not exist", path.display())
        }
        None => InsightConfig::load_default()?,
    };

    let _ = logging::init_service_logging(
        &config.logging.dir,
        &config.logging.service_name,
    );
    tracing::info!("Using config {}", config_path.display());

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| expand_path(config.data.dir.to_string_lossy().into_owned()));
    let driver = build_driver(&config, &data_dir)?;

    if !args.question.is_empty() {
        let question = args.question.join(" ");
        answer(&driver, &args, &question).await?;
        return Ok(());
    }

    tracing::info!("Reading questions from stdin");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        answer(&driver, &args, question).await?;
    }
    Ok(())
}

async fn answer(driver: &ConversationDriver, args: &Args, question: &str) -> Result<()> {
    let output = if args.transcript {
        let transcript = driver
            .run_conversation(ConversationRequest::new(args.subject.clone(), question))
            .await;
        serde_json::to_string_pretty(&transcript)?
    } else {
        let response = driver.process_question(&args.subject, question).await;
        serde_json::to_string(&response)?
    };

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", output)?;
    stdout.flush()?;
    Ok(())
}
