use clap::Parser;
use luaspell::{EngineConfig, ExecContext, ScriptEngine};
use std::io::{self, Read};
use std::time::Duration;

/// Execute a Lua script through the engine and emit a JSON result.
#[derive(Parser, Debug)]
#[command(name = "luaspell-cli", about = "Execute Lua code and emit JSON result")]
struct Args {
    /// Read Lua source from file instead of stdin
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    /// Per-execution timeout in milliseconds
    #[arg(long, default_value_t = 5_000u64)]
    timeout_ms: u64,

    /// JSON object of named parameters installed as script globals
    #[arg(long)]
    params: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let source = if let Some(path) = args.file {
        std::fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("Error reading file: {e}");
            std::process::exit(1);
        })
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {e}");
            std::process::exit(1);
        });
        buf
    };

    let params = args.params.map(|raw| {
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Error parsing --params: {e}");
            std::process::exit(1);
        });
        match luaspell::from_native(value) {
            luaspell::ScriptValue::Object(map) => map,
            _ => {
                eprintln!("Error: --params must be a JSON object");
                std::process::exit(1);
            }
        }
    });

    let config = EngineConfig {
        timeout_limit_ms: args.timeout_ms,
        ..EngineConfig::default()
    };
    let engine = ScriptEngine::new(config).unwrap_or_else(|e| {
        eprintln!("Error initializing engine: {e}");
        std::process::exit(1);
    });

    let ctx = ExecContext::with_timeout(Duration::from_millis(args.timeout_ms));
    let outcome = engine.execute(&ctx, &source, params).await;
    let _ = engine.shutdown().await;

    // Errors are encoded in the JSON, not the exit code.
    let json = match outcome {
        Ok(value) => serde_json::json!({ "ok": true, "value": luaspell::to_native(&value).ok() }),
        Err(e) => serde_json::json!({ "ok": false, "error": e }),
    };
    println!("{json}");
}
