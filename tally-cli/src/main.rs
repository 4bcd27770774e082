use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tally_catalog::{PolicyCatalog, SharedCatalog};
use tally_core::{Providers, TallyConfig, TallyKernel};
use tally_guard::guard_with;
use tally_receipts::{tail, verify_log};
use tally_types::{TurnEvent, TurnRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tally")]
struct Cli {
    /// YAML config file; falls back to TALLY_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one analytics turn against the configured providers.
    Ask {
        message: String,
        #[arg(long)]
        session: Option<String>,
        /// Print status lines and the answer as it is produced.
        #[arg(long)]
        stream: bool,
    },
    /// Evaluate a SQL candidate against the catalog policy.
    Guard {
        sql: String,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Print the catalog summary handed to prompts.
    Catalog {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    Receipts {
        #[command(subcommand)]
        action: ReceiptCommand,
        #[arg(long, default_value = "./receipts.jsonl")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ReceiptCommand {
    Tail { #[arg(long, default_value_t = 10)] lines: usize },
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask {
            message,
            session,
            stream,
        } => {
            let config = TallyConfig::load(cli.config.as_deref())?;
            let catalog = Arc::new(SharedCatalog::from_path(&config.catalog_path)?);
            let kernel = Arc::new(TallyKernel::new(catalog, Providers::from_config(&config)?, &config));
            let req = TurnRequest {
                session_id: session,
                message,
                ..Default::default()
            };
            if stream {
                ask_streaming(kernel, req).await?;
            } else {
                let result = kernel.run_turn(req).await?;
                println!("{}", result.response.answer);
                println!();
                println!("confidence: {:?}", result.response.confidence);
                for a in &result.response.assumptions {
                    println!("- {a}");
                }
            }
        }
        Command::Guard { sql, catalog } => {
            let config = TallyConfig::load(cli.config.as_deref())?;
            let catalog = PolicyCatalog::load(catalog.unwrap_or(config.catalog_path))?;
            let guarded = guard_with(&sql, &catalog, &config.guard);
            println!("{}", serde_json::to_string_pretty(&guarded)?);
        }
        Command::Catalog { catalog } => {
            let config = TallyConfig::load(cli.config.as_deref())?;
            let catalog = PolicyCatalog::load(catalog.unwrap_or(config.catalog_path))?;
            println!("{}", catalog.summary());
        }
        Command::Receipts { action, path } => match action {
            ReceiptCommand::Tail { lines } => {
                for receipt in tail(&path, lines)? {
                    println!("{}", serde_json::to_string(&receipt)?);
                }
            }
            ReceiptCommand::Verify => {
                let n = verify_log(&path)?;
                println!("receipt log ok ({n} receipt(s))");
            }
        },
    }

    Ok(())
}

async fn ask_streaming(kernel: Arc<TallyKernel>, req: TurnRequest) -> anyhow::Result<()> {
    let mut rx = kernel.stream(req);
    let mut out = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Status { message } => eprintln!("[{message}]"),
            TurnEvent::AnswerDelta { delta } => {
                write!(out, "{delta}")?;
                out.flush()?;
            }
            TurnEvent::Response { .. } => {}
            TurnEvent::Error { message } => anyhow::bail!(message),
            TurnEvent::Done => println!(),
        }
    }
    Ok(())
}
