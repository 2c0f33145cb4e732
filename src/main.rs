use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tabcapture::{
    accumulator::{Clock as _, SystemClock},
    config::{Config, ConfigSource},
    entry::{FinalizedEntry, TabId},
    har_export, har_import,
    history::HistoryStore,
    logging,
    persistence::PersistenceBridge,
    reconcile::{self, ToleranceMatcher},
    service::{self, CorrelatorHandle},
    storage::SqliteArea,
    transport,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};

#[derive(Debug, Parser)]
#[command(name = "tabcapture")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read capture events from stdin as JSON lines and answer queries on stdout.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print a tab's persisted entries as JSON.
    Entries {
        #[arg(long, allow_negative_numbers = true)]
        tab: TabId,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Export a tab's persisted entries as a HAR 1.2 document.
    Export {
        #[arg(long, allow_negative_numbers = true)]
        tab: TabId,
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove a tab's entries from the durable store.
    Clear {
        #[arg(long, allow_negative_numbers = true)]
        tab: TabId,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Reconcile a HAR file into a tab's persisted entries.
    Import {
        #[arg(long, allow_negative_numbers = true)]
        tab: TabId,
        file: PathBuf,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OfflineCommand {
    Entries { tab: TabId },
    Export { tab: TabId, out: Option<PathBuf> },
    Clear { tab: TabId },
    Import { tab: TabId, file: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
enum OfflineOutcome {
    Entries {
        entries: Vec<FinalizedEntry>,
    },
    Exported {
        tab: TabId,
        count: usize,
        out: Option<PathBuf>,
        document: String,
    },
    Cleared {
        tab: TabId,
        removed: bool,
    },
    Imported {
        tab: TabId,
        novel: usize,
        duplicates: usize,
        evicted: usize,
    },
}

fn require_bridge(config: &Config) -> anyhow::Result<PersistenceBridge> {
    let (Some(storage), Some(path)) = (config.storage.as_ref(), config.storage_path()?) else {
        bail!("storage not configured; set `[storage].path` in config");
    };
    let area = SqliteArea::open(path.clone())
        .with_context(|| format!("open capture store {}", path.display()))?;
    Ok(PersistenceBridge::new(Arc::new(area), storage.timeout()))
}

async fn load_history(config: &Config, bridge: &PersistenceBridge) -> anyhow::Result<HistoryStore> {
    let persisted = bridge.try_load_all().await?;
    Ok(HistoryStore::from_persisted(
        persisted,
        config.capture.max_entries_per_tab,
    ))
}

async fn run_offline_command(
    config: &Config,
    command: OfflineCommand,
) -> anyhow::Result<OfflineOutcome> {
    let bridge = require_bridge(config)?;
    let mut history = load_history(config, &bridge).await?;

    match command {
        OfflineCommand::Entries { tab } => Ok(OfflineOutcome::Entries {
            entries: history.snapshot(tab),
        }),
        OfflineCommand::Export { tab, out } => {
            let entries = history.snapshot(tab);
            let document = har_export::to_har_json(&entries).context("render HAR document")?;
            if let Some(path) = out.as_ref() {
                fs::write(path, &document)
                    .with_context(|| format!("write HAR document {}", path.display()))?;
            }
            Ok(OfflineOutcome::Exported {
                tab,
                count: entries.len(),
                out,
                document,
            })
        }
        OfflineCommand::Clear { tab } => {
            let removed = history.clear(tab);
            if removed {
                bridge.try_save_all(&history.to_persisted()).await?;
            }
            Ok(OfflineOutcome::Cleared { tab, removed })
        }
        OfflineCommand::Import { tab, file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("read HAR file {}", file.display()))?;
            let incoming = har_import::parse_har_str(&text, SystemClock.now_ms())
                .with_context(|| format!("import HAR file {}", file.display()))?;
            let matcher = ToleranceMatcher {
                tolerance_ms: config.reconcile.tolerance_ms,
            };
            let report = reconcile::reconcile(&mut history, tab, incoming, &matcher);
            if report.changed() {
                bridge.try_save_all(&history.to_persisted()).await?;
            }
            Ok(OfflineOutcome::Imported {
                tab,
                novel: report.novel,
                duplicates: report.duplicates,
                evicted: report.evicted,
            })
        }
    }
}

fn print_offline_outcome(outcome: OfflineOutcome) -> anyhow::Result<()> {
    match outcome {
        OfflineOutcome::Entries { entries } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("render entries")?
            );
        }
        OfflineOutcome::Exported {
            tab,
            count,
            out,
            document,
        } => match out {
            Some(path) => println!(
                "exported {count} entries for tab {tab} to {}",
                path.display()
            ),
            None => println!("{document}"),
        },
        OfflineOutcome::Cleared { tab, removed } => {
            if removed {
                println!("cleared tab {tab}");
            } else {
                println!("tab {tab} has no entries");
            }
        }
        OfflineOutcome::Imported {
            tab,
            novel,
            duplicates,
            evicted,
        } => {
            println!(
                "imported into tab {tab}: {novel} novel, {duplicates} duplicate, {evicted} evicted"
            );
        }
    }
    Ok(())
}

/// Feeds `input` lines to the service and writes replies to `output` until
/// EOF or Ctrl-C.
async fn pump_lines<R, W>(handle: &CorrelatorHandle, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            signal = &mut interrupt => {
                signal.context("listen for ctrl-c")?;
                tracing::info!("interrupt received; shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("read event line")? else { break };
                if let Some(reply) = transport::dispatch_line(handle, &line).await? {
                    let mut encoded = reply.to_line().context("encode reply")?;
                    encoded.push('\n');
                    output
                        .write_all(encoded.as_bytes())
                        .await
                        .context("write reply")?;
                    output.flush().await.context("flush reply")?;
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, command) = match cli.command {
        Command::Serve { config, log_level } => {
            let (config, source) = Config::load_with_source(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            eprintln!("{}", startup_summary(&config, &source));

            let running = service::start(&config).await?;
            let handle = running.handle();
            let pumped = pump_lines(
                &handle,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await;
            drop(handle);
            running.shutdown().await?;
            return pumped;
        }
        Command::Entries { tab, config } => (config, OfflineCommand::Entries { tab }),
        Command::Export { tab, out, config } => (config, OfflineCommand::Export { tab, out }),
        Command::Clear { tab, config } => (config, OfflineCommand::Clear { tab }),
        Command::Import { tab, file, config } => (config, OfflineCommand::Import { tab, file }),
    };

    let config = Config::load(config.as_deref())?;
    let outcome = run_offline_command(&config, command).await?;
    print_offline_outcome(outcome)
}

fn startup_summary(config: &Config, source: &ConfigSource) -> String {
    let storage_path = config
        .storage
        .as_ref()
        .map(|storage| storage.path.display().to_string())
        .unwrap_or_else(|| "in-memory".to_owned());

    format!(
        "startup config: source={}, storage_path={}, max_entries_per_tab={}, pending_idle_ms={}, tolerance_ms={}, clear_on_navigate={}",
        source,
        storage_path,
        config.capture.max_entries_per_tab,
        config.capture.pending_idle_ms,
        config.reconcile.tolerance_ms,
        config.capture.clear_on_navigate
    )
}
