//! Dump OpenCode usage events as JSON lines, followed by per-model totals
//!
//! Run with: cargo run --bin usage_dump -- [--data-dir DIR] [--session ID]
//!           [--since MS|RFC3339] [--limit N] [--watch SECS]

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use opencode_usage_tracker_lib::usage::{
    ActivityCallback, ParseRequest, SessionStore, StoreConfig, UsageEvent,
};

#[derive(Debug, Default)]
struct Args {
    data_dir: Option<String>,
    session: Option<String>,
    since: Option<i64>,
    limit: Option<usize>,
    watch_secs: Option<u64>,
}

fn parse_since(value: &str) -> Result<i64, String> {
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("invalid --since '{}': {}", value, e))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(flag) = iter.next() {
        let mut value = || iter.next().ok_or_else(|| format!("missing value for {}", flag));
        match flag.as_str() {
            "--data-dir" => args.data_dir = Some(value()?),
            "--session" => args.session = Some(value()?),
            "--since" => args.since = Some(parse_since(&value()?)?),
            "--limit" => {
                let raw = value()?;
                args.limit = Some(raw.parse().map_err(|_| format!("invalid --limit '{}'", raw))?);
            }
            "--watch" => {
                let raw = value()?;
                args.watch_secs = Some(raw.parse().map_err(|_| format!("invalid --watch '{}'", raw))?);
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    Ok(args)
}

#[derive(Debug, Default)]
struct ModelTotals {
    events: u64,
    input: u64,
    output: u64,
    reasoning: u64,
    cache_read: u64,
    cache_write: u64,
    total: u64,
}

fn totals_by_model(events: &[UsageEvent]) -> BTreeMap<String, ModelTotals> {
    let mut totals: BTreeMap<String, ModelTotals> = BTreeMap::new();
    for event in events {
        let key = format!("{}/{}", event.provider_id, event.model_id);
        let entry = totals.entry(key).or_default();
        entry.events += 1;
        entry.input += event.tokens.input;
        entry.output += event.tokens.output;
        entry.reasoning += event.tokens.reasoning.unwrap_or(0);
        entry.cache_read += event.tokens.cache_read.unwrap_or(0);
        entry.cache_write += event.tokens.cache_write.unwrap_or(0);
        entry.total += event.tokens.total();
    }
    totals
}

fn format_time(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("usage_dump: {}", e);
            eprintln!("usage: usage_dump [--data-dir DIR] [--session ID] [--since MS|RFC3339] [--limit N] [--watch SECS]");
            return ExitCode::FAILURE;
        }
    };

    let mut config = StoreConfig::default();
    if let Some(dir) = args.data_dir.clone() {
        config = config.with_data_dir(dir);
    }
    let store = SessionStore::new(config);
    eprintln!("Reading OpenCode data from {}", store.paths().data_dir.display());

    let request = ParseRequest::new()
        .with_session(args.session.clone())
        .with_limit(args.limit)
        .with_since(args.since);
    let events = store.parse_sessions(&request).await;

    for event in &events {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("usage_dump: failed to encode event: {}", e),
        }
    }

    println!();
    println!("=== Totals by model ({} events) ===", events.len());
    for (model, t) in totals_by_model(&events) {
        println!(
            "{:<40} events: {:>6}  input: {:>10}  output: {:>10}  reasoning: {:>8}  cache read: {:>10}  cache write: {:>8}  total: {:>12}",
            model, t.events, t.input, t.output, t.reasoning, t.cache_read, t.cache_write, t.total
        );
    }
    if let Some(latest) = events.iter().map(|e| e.session_updated_at).max() {
        println!("Latest session update: {}", format_time(latest));
    }
    println!(
        "Cache sizes: aggregate {}, metadata index {}",
        store.aggregate_cache_len(),
        store.metadata_index_len()
    );

    if let Some(secs) = args.watch_secs {
        println!();
        println!("=== Streaming activity for {}s ===", secs);
        let callback: ActivityCallback = Arc::new(|update| match serde_json::to_string(&update) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("usage_dump: failed to encode update: {}", e),
        });
        store.start_activity_watch(callback);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    store.shutdown();
    ExitCode::SUCCESS
}
