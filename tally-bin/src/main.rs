use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tally_core::checkpoint::FsCheckpointStore;
use tally_core::config::EngineConfig;
use tally_core::{CheckpointStore, Sink};
use tally_ops::{Engine, EngineOptions, RunReport};

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Event-time windowed invoice aggregation", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the aggregation from a tally.toml
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
    /// Print the latest checkpoint in a checkpoint directory
    Inspect {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            tracing::info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            if http_port != 0 {
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tracing::info!("serving /metrics on {}", addr);
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            let report = run_pipeline(config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Inspect { dir } => {
            println!("{}", inspect(dir).await?);
            Ok(())
        }
    }
}

async fn metrics() -> String {
    tally_core::metrics::render_prometheus()
}

async fn run_pipeline(path: PathBuf) -> anyhow::Result<RunReport> {
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg = EngineConfig::from_toml_str(&text)?;
    let opts = EngineOptions::try_from(&cfg)?;

    let sink = build_sink(&cfg)?;
    let checkpoints = Arc::new(FsCheckpointStore::new(cfg.checkpoint.dir.clone(), cfg.checkpoint.keep_last));
    let engine = Arc::new(Engine::new(opts, sink, checkpoints));

    tracing::info!(source = %cfg.source.kind, sink = %cfg.sink.kind, checkpoints = %cfg.checkpoint.dir.display(), "starting");
    let report = match cfg.source.kind.as_str() {
        "file" => engine.run(tally_io::FileSource::new(cfg.source.paths.clone())).await?,
        #[cfg(feature = "kafka")]
        "kafka" => {
            let src = tally_io::KafkaSource::new(&cfg.source.brokers, &cfg.source.group_id, cfg.source.topics.clone());
            engine.run(src).await?
        }
        other => anyhow::bail!("source kind {other:?} is not available in this build"),
    };
    Ok(report)
}

fn build_sink(cfg: &EngineConfig) -> anyhow::Result<Arc<dyn Sink>> {
    match cfg.sink.kind.as_str() {
        "json" => Ok(Arc::new(tally_io::JsonSink::new(cfg.sink.out_dir.clone()))),
        #[cfg(feature = "parquet")]
        "parquet" => Ok(Arc::new(tally_io::ParquetSink::new(tally_io::ParquetSinkConfig {
            out_dir: cfg.sink.out_dir.clone(),
            ..Default::default()
        }))),
        other => anyhow::bail!("sink kind {other:?} is not available in this build"),
    }
}

async fn inspect(dir: PathBuf) -> anyhow::Result<String> {
    let store = FsCheckpointStore::new(dir, usize::MAX);
    let ids = store.list().await?;
    let latest = store.load_latest().await?.map(|cp| cp.summary());
    let out = serde_json::json!({ "checkpoints": ids, "latest": latest });
    Ok(serde_json::to_string_pretty(&out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let app = app();
        // Touch a metric
        tally_core::metrics::WINDOWS_EMITTED.inc();
        let res = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.status().is_success());
        let body = body::to_bytes(res.into_body(), 1_048_576).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("tally_windows_emitted_total"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["tally", "run", "--config", "tally.toml", "--http-port", "9100"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { http_port: 9100, .. }));
        let cli = Cli::try_parse_from(["tally", "inspect", "--dir", "/tmp/checkpoints"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { .. }));
    }

    fn invoice(no: &str, country: &str, qty: i64, date: &str) -> String {
        serde_json::json!({
            "InvoiceNo": no,
            "StockCode": "22633",
            "Description": "HAND WARMER UNION JACK",
            "Quantity": qty,
            "InvoiceDate": date,
            "UnitPrice": 1.85,
            "CustomerID": "17850",
            "Country": country
        })
        .to_string()
    }

    #[tokio::test]
    async fn file_pipeline_runs_end_to_end_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("low_quantity.jsonl");
        let lines = [
            invoice("536365", "United Kingdom", 6, "12/1/2010 8:26"),
            invoice("536365", "United Kingdom", 2, "12/1/2010 8:28"),
            invoice("536366", "Germany", 6, "12/1/2010 8:28"),
            "{broken".to_string(),
            invoice("536367", "France", 1, "12/1/2010 9:30"),
        ];
        tokio::fs::write(&input, lines.join("\n") + "\n").await.unwrap();

        let config = dir.path().join("tally.toml");
        let toml = format!(
            r#"
            [source]
            kind = "file"
            paths = [{input:?}]

            [sink]
            kind = "json"
            out_dir = {out:?}

            [checkpoint]
            dir = {chk:?}
            interval = "1s"

            [run]
            max_duration = "30s"
            "#,
            input = input.display().to_string(),
            out = dir.path().join("out").display().to_string(),
            chk = dir.path().join("chk").display().to_string(),
        );
        tokio::fs::write(&config, toml).await.unwrap();

        let report = run_pipeline(config.clone()).await.unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.filtered, 1);
        assert_eq!(report.rejected_total(), 1);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.open_windows, 1);

        let written = dir.path().join("out").join("dt=2010-12-01");
        let files: Vec<_> = std::fs::read_dir(&written).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(files[0].path()).unwrap()).unwrap();
        assert_eq!(v["InvoiceNo"], "536365");
        assert_eq!(v["TotalQuantity"], 8);

        // same input again: every position is already committed
        let again = run_pipeline(config).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.emitted, 0);
        assert_eq!(again.open_windows, 1);

        let printed = inspect(dir.path().join("chk")).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&printed).unwrap();
        assert_eq!(v["latest"]["open_windows"], 1);
    }

    #[tokio::test]
    async fn inspect_empty_directory_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let printed = inspect(dir.path().to_path_buf()).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&printed).unwrap();
        assert!(v["latest"].is_null());
    }
}
