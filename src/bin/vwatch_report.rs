//! vwatch_report - read back stored detections and alerts

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use violence_watch::analytics::{filter, hourly_pattern, summarize, to_csv, to_json, LogFilter};
use violence_watch::config::split_csv;
use violence_watch::{DetectionStore, SqliteDetectionStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection database.
    #[arg(long, env = "VWATCH_DB_PATH", default_value = "vwatch.db")]
    db_path: String,
    /// Class counted as alert-worthy in summaries.
    #[arg(long, default_value = "violence")]
    alert_class: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Counts per class, average confidence and the hourly pattern.
    Summary {
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
    /// List the most recent alerts.
    Alerts {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Mark an alert as acknowledged.
    Ack { id: i64 },
    /// Export detections, optionally filtered by class and date.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long)]
        output: Option<String>,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: String,
        /// Comma-separated class names.
        #[arg(long)]
        classes: Option<String>,
        /// First day included (YYYY-MM-DD, UTC).
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day included (YYYY-MM-DD, UTC).
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut store = SqliteDetectionStore::open(&args.db_path)?;

    match args.command {
        Command::Summary { limit } => {
            let entries = store.recent_detections(limit)?;
            let summary = summarize(&entries, &args.alert_class);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            for (label, hours) in hourly_pattern(&entries) {
                let cells: Vec<String> = hours.iter().map(|c| c.to_string()).collect();
                println!("{:>16} | {}", label, cells.join(" "));
            }
        }
        Command::Alerts { limit } => {
            for alert in store.list_alerts(limit)? {
                println!(
                    "#{:<6} {} {:<24} {:<14} conf={:.2} {:<6} {}",
                    alert.id,
                    alert.event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.event.source,
                    alert.event.alert_type,
                    alert.event.confidence,
                    alert.event.severity.as_str(),
                    if alert.acknowledged { "ack" } else { "open" }
                );
            }
        }
        Command::Ack { id } => {
            if !store.acknowledge_alert(id)? {
                return Err(anyhow!("no alert with id {}", id));
            }
            log::info!("alert {} acknowledged", id);
        }
        Command::Export {
            output,
            format,
            classes,
            from,
            to,
            limit,
        } => {
            let selection = LogFilter {
                classes: classes.as_deref().map(split_csv).unwrap_or_default(),
                from,
                to,
            };
            let entries = filter(&store.recent_detections(limit)?, &selection)?;
            let rendered = match format.as_str() {
                "csv" => to_csv(&entries),
                "json" => to_json(&entries)?,
                other => return Err(anyhow!("unsupported export format '{}'", other)),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {}", path))?;
                    log::info!("exported {} detection(s) to {}", entries.len(), path);
                }
                None => print!("{}", rendered),
            }
        }
    }
    Ok(())
}
