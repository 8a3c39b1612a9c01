//! Clipcast CLI - Command-line interface for the Clipcast daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9630";

#[derive(Parser)]
#[command(name = "clipcast")]
#[command(about = "Clipcast encoding pipeline CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "CLIPCAST_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Hand an uploaded clip to the encoder
    Enqueue {
        /// Clip ID
        clip_id: String,

        /// Uploaded file to import as the clip's source
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Show encoding progress for one or more clips
    Progress {
        /// Clip IDs
        #[arg(required = true)]
        clip_ids: Vec<String>,

        /// Keep polling every N seconds until no clip is tracked
        #[arg(short, long)]
        watch: Option<u64>,
    },

    /// Delete a clip and stop its encode
    Cancel {
        /// Clip ID
        clip_id: String,
    },

    /// Show a clip's state, live job and published artifacts
    Status {
        /// Clip ID
        clip_id: String,
    },

    /// Show daemon statistics
    Stats,

    /// Purge settled jobs past retention and compact the database
    Maintenance {
        /// Compact even if the database is below the configured size
        #[arg(long)]
        force_compact: bool,

        /// One retention window for done, failed and cancelled jobs, this run only
        #[arg(long)]
        retention_days: Option<i64>,
    },
}

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: serde_json::Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Deserialize, Tabled)]
struct EnqueueResult {
    job_id: String,
    clip_id: String,
    progress: i32,
}

#[derive(Deserialize)]
struct ProgressResult {
    clips: BTreeMap<String, i32>,
}

#[derive(Tabled)]
struct ProgressRow {
    clip_id: String,
    progress: String,
}

/// -1 queued, -2 failed, otherwise a percentage
fn describe_progress(value: i32) -> String {
    match value {
        -1 => "queued".to_string(),
        -2 => "failed".to_string(),
        v => format!("{}%", v),
    }
}

async fn call_rpc(url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
        id: 1,
    };

    let client = reqwest::Client::new();
    let response: JsonRpcResponse = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("Failed to connect to daemon")?
        .json()
        .await
        .context("Failed to parse response")?;

    if let Some(error) = response.error {
        anyhow::bail!("RPC error ({}): {}", error.code, error.message);
    }

    response
        .result
        .ok_or_else(|| anyhow::anyhow!("No result in response"))
}

async fn print_progress(url: &str, clip_ids: &[String]) -> Result<usize> {
    let result = call_rpc(url, "clips.progress.v1", json!({ "clip_ids": clip_ids })).await?;
    let progress: ProgressResult = serde_json::from_value(result)?;

    if progress.clips.is_empty() {
        println!("{}", "No tracked clips".yellow());
        return Ok(0);
    }

    let rows: Vec<ProgressRow> = progress
        .clips
        .iter()
        .map(|(clip_id, value)| ProgressRow {
            clip_id: clip_id.clone(),
            progress: describe_progress(*value),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(progress.clips.len())
}

fn mb(value: &serde_json::Value) -> f64 {
    value.as_i64().unwrap_or(0) as f64 / (1024.0 * 1024.0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue { clip_id, source } => {
            let params = json!({
                "clip_id": clip_id,
                "source_path": source,
            });

            let result = call_rpc(&cli.rpc_url, "clips.enqueue.v1", params).await?;
            let enqueue_result: EnqueueResult = serde_json::from_value(result)?;

            println!("{}", "✓ Clip enqueued successfully".green().bold());
            println!();

            let table = Table::new(vec![enqueue_result]).to_string();
            println!("{}", table);
        }

        Commands::Progress { clip_ids, watch } => match watch {
            None => {
                print_progress(&cli.rpc_url, &clip_ids).await?;
            }
            Some(secs) => {
                let interval = Duration::from_secs(secs.max(1));
                while print_progress(&cli.rpc_url, &clip_ids).await? > 0 {
                    tokio::time::sleep(interval).await;
                    println!();
                }
            }
        },

        Commands::Cancel { clip_id } => {
            let result = call_rpc(&cli.rpc_url, "clips.cancel.v1", json!({ "clip_id": clip_id })).await?;

            if result["cancelled"].as_bool().unwrap_or(false) {
                println!("{}", format!("✓ Clip {} cancelled", clip_id).green().bold());
            } else {
                println!("{}", format!("Nothing known about clip {}", clip_id).yellow());
            }
        }

        Commands::Status { clip_id } => {
            let status = call_rpc(&cli.rpc_url, "clips.status.v1", json!({ "clip_id": clip_id })).await?;

            println!("{}", format!("Clip {}", clip_id).cyan().bold());
            println!();
            let state = status["state"].as_str().unwrap_or("UNKNOWN");
            println!("  {} {}", "State:".bold(), state);
            if let Some(progress) = status["progress"].as_i64() {
                println!("  {} {}", "Progress:".bold(), describe_progress(progress as i32));
            }

            let job = &status["job"];
            if !job.is_null() {
                println!();
                println!("  {} {}", "Job:".bold(), job["job_id"].as_str().unwrap_or("-"));
                println!("  {} {}", "Job State:".bold(), job["state"].as_str().unwrap_or("-"));
                println!("  {} {}", "Phase:".bold(), job["phase"].as_str().unwrap_or("-"));
                println!("  {} {}/{}", "Attempt:".bold(), job["attempt"], job["max_attempts"]);
                if let Some(error) = job["last_error"].as_str() {
                    println!("  {} {}", "Last Error:".bold(), error.red());
                }
            }

            let artifacts = &status["artifacts"];
            if !artifacts.is_null() {
                println!();
                println!("  {} {}", "Manifest:".bold(), artifacts["manifest"].as_str().unwrap_or("-"));
                println!("  {} {}", "Thumbnail:".bold(), artifacts["thumbnail"].as_str().unwrap_or("-"));
                if let Some(renditions) = artifacts["renditions"].as_array() {
                    for rendition in renditions {
                        println!(
                            "  {} {}x{} @ {} kbps",
                            "•".bold(),
                            rendition["width"],
                            rendition["height"],
                            rendition["bitrate_kbps"]
                        );
                    }
                }
            }
        }

        Commands::Stats => {
            println!("{}", "System Status".cyan().bold());
            println!();

            match call_rpc(&cli.rpc_url, "admin.stats.v1", json!({})).await {
                Ok(stats) => {
                    println!("  {} {}", "RPC URL:".bold(), cli.rpc_url);
                    println!("  {} {}", "Status:".bold(), "ONLINE".green());
                    println!();
                    let jobs = &stats["jobs"];
                    println!("  {} {}", "Queued:".bold(), jobs["queued"]);
                    println!("  {} {}", "In Flight:".bold(), jobs["in_flight"]);
                    println!("  {} {}", "Done:".bold(), jobs["done"]);
                    println!("  {} {}", "Failed:".bold(), jobs["failed"]);
                    println!("  {} {}", "Cancelled:".bold(), jobs["cancelled"]);
                    println!();
                    println!("  {} {}", "Clips:".bold(), stats["clips"]);
                    println!("  {} {}", "Encoding Now:".bold(), stats["encoding_now"]);
                    println!("  {} {}", "Tracked Progress:".bold(), stats["tracked_progress"]);
                    println!();
                    println!("  {} {:.2} MB", "DB Size:".bold(), mb(&stats["db_size_bytes"]));
                    println!("  {} {:.2} MB", "DB Free:".bold(), mb(&stats["db_free_bytes"]));
                    println!("  {} {} seconds", "Uptime:".bold(), stats["uptime_seconds"]);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "ERROR".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }

        Commands::Maintenance {
            force_compact,
            retention_days,
        } => {
            println!("{}", "Running maintenance...".cyan().bold());
            println!();

            if force_compact {
                println!("  {} Forced compaction", "•".bold());
            }

            let params = json!({
                "force_compact": force_compact,
                "retention_days": retention_days,
            });

            match call_rpc(&cli.rpc_url, "admin.maintenance.v1", params).await {
                Ok(result) => {
                    println!("  ✓ Maintenance completed");
                    println!();
                    let purged = &result["purged"];
                    println!(
                        "  {} purged {} done, {} failed, {} cancelled jobs",
                        "✓".green(),
                        purged["done"],
                        purged["failed"],
                        purged["cancelled"]
                    );
                    if result["compacted"].as_bool().unwrap_or(false) {
                        println!("  {} Database compacted", "✓".green());
                    } else {
                        println!("  ○ Compaction skipped (not needed)");
                    }
                    println!();
                    let size_before_mb = mb(&result["db_size_before"]);
                    let size_after_mb = mb(&result["db_size_after"]);
                    println!(
                        "  {} {:.2} MB → {:.2} MB",
                        "DB Size:".bold(),
                        size_before_mb,
                        size_after_mb
                    );
                }
                Err(e) => {
                    println!("  {} Maintenance failed: {}", "✗".red(), e);
                }
            }
        }
    }

    Ok(())
}
