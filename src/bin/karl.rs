//! KaRL command-line evaluator.
//!
//! Usage: `karl [FILE]... [-e EXPR]... [--config FILE] [--print-knowledge]`
//!
//! Files and expressions are evaluated in order against one fresh
//! knowledge base.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use karl::{EvalSettings, KarlResult, KnowledgeBase, KnowledgeBaseConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "karl")]
#[command(about = "Evaluate KaRL logic against a fresh knowledge base")]
struct Args {
    /// KaRL source files, evaluated in order
    files: Vec<PathBuf>,

    /// Inline expression, evaluated after the files
    #[arg(short = 'e', long = "expression")]
    expressions: Vec<String>,

    /// JSON knowledge base configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dump the final knowledge as JSON on stdout
    #[arg(long)]
    print_knowledge: bool,

    /// Skip constant folding
    #[arg(long)]
    no_prune: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::new(std::env::var("KARL_LOG").unwrap_or_else(|_| "karl=info".into()));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

fn run(args: &Args) -> KarlResult<()> {
    let config = match &args.config {
        Some(path) => KnowledgeBaseConfig::from_json_file(path)?,
        None => KnowledgeBaseConfig::default(),
    };
    let kb = KnowledgeBase::new(config);
    let settings = EvalSettings::default();

    let mut sources = Vec::with_capacity(args.files.len() + args.expressions.len());
    for path in &args.files {
        let text = fs::read_to_string(path)
            .map_err(|e| karl::KarlError::config(format!("read {}: {e}", path.display())))?;
        sources.push((path.display().to_string(), text));
    }
    sources.extend(args.expressions.iter().map(|e| ("-e".to_string(), e.clone())));

    for (origin, source) in &sources {
        let expression = if args.no_prune {
            karl::compile_unpruned(&kb.context(), source)?
        } else {
            kb.compile(source)?
        };
        let result = kb.evaluate(&expression, &settings)?;
        info!(source = %origin, result = %result, "evaluated");
    }

    if args.print_knowledge {
        let knowledge = kb.context().to_json()?;
        let text = serde_json::to_string_pretty(&knowledge)
            .map_err(|e| karl::KarlError::internal(format!("render knowledge: {e}")))?;
        println!("{text}");
    }
    kb.close();
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_format);

    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(1);
    }
}
