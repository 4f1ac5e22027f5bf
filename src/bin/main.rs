use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use financial_sms_extractor::{
    config::{EnrichMode, LlmConfig, PipelineConfig},
    models::RawMessage,
    pipeline::Pipeline,
    store::{InMemoryStore, TransactionStore},
};

/// Extract structured transactions from bank and UPI SMS dumps.
#[derive(Debug, Parser)]
#[command(name = "pipeline", version, about)]
struct Cli {
    /// Input JSON file: an array of messages, or an object with a
    /// `financial_sms` or `sms` array.
    #[arg(long)]
    input: PathBuf,

    /// Model name sent to the chat completions endpoint.
    #[arg(long)]
    model: Option<String>,

    /// Base batch size before adaptive adjustment.
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Batches processed concurrently per group.
    #[arg(long, default_value_t = 3)]
    parallel_batches: usize,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Where to write dead-lettered messages as NDJSON.
    #[arg(long, default_value = "failures.ndjson")]
    failures: PathBuf,

    /// Backfill missing LLM fields from the rule-based extractor.
    #[arg(long, value_parser = parse_enrich, default_value = "safe")]
    enrich: EnrichMode,

    /// Skip the LLM entirely and run rule-based extraction only.
    #[arg(long)]
    no_llm: bool,
}

fn parse_enrich(s: &str) -> Result<EnrichMode, String> {
    match s {
        "off" => Ok(EnrichMode::Off),
        "safe" => Ok(EnrichMode::Safe),
        other => Err(format!("unknown enrich mode '{other}', expected off|safe")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    info!("Financial SMS extraction pipeline starting");

    let messages = load_messages(&cli.input)?;
    info!(count = messages.len(), input = %cli.input.display(), "loaded messages");

    let config = PipelineConfig {
        batch_size: cli.batch_size.max(1),
        parallel_batches: cli.parallel_batches.max(1),
        enrich: cli.enrich,
        use_llm: !cli.no_llm,
        ..PipelineConfig::default()
    };

    let llm_config = if config.use_llm {
        let mut llm_config = LlmConfig::from_env()?;
        if let Some(model) = cli.model {
            llm_config.model = model;
        }
        if let Some(temperature) = cli.temperature {
            llm_config.temperature = temperature;
        }
        if let Some(top_p) = cli.top_p {
            llm_config.top_p = top_p;
        }
        if let Some(max_tokens) = cli.max_tokens {
            llm_config.max_tokens = max_tokens;
        }
        Some(llm_config)
    } else {
        None
    };

    let store: Arc<dyn TransactionStore> = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::new(config, llm_config, store)?;

    let summary = pipeline.run(&messages).await?;

    println!("\n=== RUN SUMMARY ===");
    println!("Messages:          {}", summary.total_messages);
    println!(
        "Financial:         {} ({:.1}%)",
        summary.financial_messages,
        summary.filter_stats.financial_percentage()
    );
    println!("Skipped (settled): {}", summary.skipped_settled);
    println!("Extracted:         {}", summary.succeeded);
    println!("Dead-lettered:     {}", summary.dead_lettered);
    for (intent, count) in &summary.intent_breakdown {
        println!("  intent {intent}: {count}");
    }
    println!(
        "Cache:             {} entries, {:.1}% hit rate",
        summary.cache_stats.entries,
        summary.cache_stats.hit_rate() * 100.0
    );
    println!(
        "Elapsed:           {:.1}s",
        summary.elapsed.as_secs_f64()
    );

    let dead_letters = pipeline.recovery().export_dead_letters()?;
    if !dead_letters.is_empty() {
        tokio::fs::write(&cli.failures, dead_letters).await?;
        println!("Failures written to {}", cli.failures.display());
    }

    if summary.succeeded == 0 && summary.financial_messages > summary.skipped_settled {
        std::process::exit(1);
    }
    Ok(())
}

/// Accept a bare array or the wrapped export formats.
fn load_messages(path: &PathBuf) -> Result<Vec<RawMessage>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;

    let array = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(object) => object
            .get("financial_sms")
            .or_else(|| object.get("sms"))
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or("expected a messages array or a financial_sms/sms field")?,
        _ => return Err("expected a JSON array or object".into()),
    };

    let messages = array
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<RawMessage>, _>>()?;
    Ok(messages)
}
