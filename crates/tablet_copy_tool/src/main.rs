mod observability;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tablet_common::config::NodeConfig;
use tablet_common::types::{HostPort, TabletId};
use tablet_copy::{
    CopyMetricsSnapshot, InProcessConnector, LocalTabletSource, LoggingProgressListener,
    TabletCopyClient,
};
use tablet_storage::{BlockManager, FileBlockManager, FsLayout, TabletMetadata};

/// Address the source data root is registered under.
const LOCAL_SOURCE: (&str, u16) = ("local-source", 0);

#[derive(Parser, Debug)]
#[command(name = "tablet-copy", about = "Copy a tablet replica between data roots")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "tablet-copy.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a tablet from a source data root into the local one.
    Copy {
        #[arg(long)]
        tablet_id: String,

        /// Data root holding the source replica.
        #[arg(long)]
        source_dir: PathBuf,

        /// Destination data root (overrides config).
        #[arg(long)]
        dest_dir: Option<String>,

        /// Maximum bytes per chunk (overrides config).
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Blocks downloaded concurrently (overrides config).
        #[arg(long)]
        parallel: Option<usize>,

        /// Serve Prometheus metrics on this address while copying.
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Print the local metadata of a tablet.
    Show {
        #[arg(long)]
        tablet_id: String,

        /// Data root (overrides config).
        #[arg(long)]
        data_dir: Option<String>,
    },

    /// Print the default configuration as TOML and exit.
    PrintDefaultConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::PrintDefaultConfig = cli.command {
        let toml_str = toml::to_string_pretty(&NodeConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    observability::init_tracing();
    let mut config = NodeConfig::load_or_default(Path::new(&cli.config));

    match cli.command {
        Command::Copy {
            tablet_id,
            source_dir,
            dest_dir,
            chunk_size,
            parallel,
            metrics_addr,
        } => {
            apply_copy_overrides(&mut config, dest_dir, chunk_size, parallel);
            if let Err(e) = config.validate() {
                bail!("invalid configuration: {}", e);
            }
            if let Some(addr) = metrics_addr {
                if let Err(e) = observability::init_metrics(&addr) {
                    tracing::warn!("Failed to initialize metrics: {}", e);
                }
            }
            let tablet_id = TabletId::new(tablet_id);
            let summary = run_copy(&config, &tablet_id, &source_dir)?;
            println!(
                "Copied tablet {}: {} blocks, {} WAL segments, {} bytes",
                tablet_id,
                summary.blocks_downloaded,
                summary.wal_segments_downloaded,
                summary.bytes_downloaded
            );
        }
        Command::Show {
            tablet_id,
            data_dir,
        } => {
            if let Some(dir) = data_dir {
                config.fs.root_dir = dir;
            }
            print!("{}", describe_tablet(&config, &TabletId::new(tablet_id))?);
        }
        Command::PrintDefaultConfig => {}
    }
    Ok(())
}

fn apply_copy_overrides(
    config: &mut NodeConfig,
    dest_dir: Option<String>,
    chunk_size: Option<u64>,
    parallel: Option<usize>,
) {
    if let Some(dir) = dest_dir {
        config.fs.root_dir = dir;
    }
    if let Some(n) = chunk_size {
        config.copy.transfer_chunk_size_bytes = n;
    }
    if let Some(n) = parallel {
        config.copy.max_concurrent_downloads = n;
    }
}

/// Copy `tablet_id` from the data root at `source_dir` into the configured
/// data root. A failed copy is rolled back before the error is returned.
fn run_copy(
    config: &NodeConfig,
    tablet_id: &TabletId,
    source_dir: &Path,
) -> Result<CopyMetricsSnapshot> {
    let dest_layout = FsLayout::new(&config.fs.root_dir);
    let dest_root = dest_layout.root();
    dest_layout
        .create_initial_layout()
        .with_context(|| format!("creating data root {}", dest_root.display()))?;
    if same_dir(source_dir, dest_root) {
        bail!(
            "source and destination are the same data root: {}",
            source_dir.display()
        );
    }

    let source_layout = FsLayout::new(source_dir);
    let source_blocks = FileBlockManager::open(&source_layout.data_dir())
        .with_context(|| format!("opening source blocks in {}", source_dir.display()))?;
    let source = LocalTabletSource::new(source_layout, Arc::new(source_blocks));
    let addr = HostPort::new(LOCAL_SOURCE.0, LOCAL_SOURCE.1);
    let connector = InProcessConnector::new();
    connector.register(addr.clone(), Arc::new(source));

    let dest_blocks = FileBlockManager::open(&dest_layout.data_dir())
        .with_context(|| format!("opening blocks in {}", dest_root.display()))?;
    let mut client = TabletCopyClient::new(
        tablet_id.clone(),
        dest_layout,
        Arc::new(dest_blocks) as Arc<dyn BlockManager>,
        Arc::new(connector),
        config.copy.clone(),
    );

    client
        .start(&addr)
        .with_context(|| format!("starting copy of tablet {}", tablet_id))?;
    if let Err(e) = client.fetch_all(Some(&LoggingProgressListener)) {
        if let Err(abort_err) = client.abort() {
            tracing::error!("Failed to roll back copy of {}: {}", tablet_id, abort_err);
        }
        return Err(e).with_context(|| format!("copying tablet {}", tablet_id));
    }
    Ok(client.metrics())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn describe_tablet(config: &NodeConfig, tablet_id: &TabletId) -> Result<String> {
    let layout = FsLayout::new(&config.fs.root_dir);
    let meta = TabletMetadata::load(&layout, tablet_id)
        .with_context(|| format!("loading metadata of tablet {}", tablet_id))?;
    let superblock = meta.superblock();
    let wal_segments = layout.list_wal_segments(tablet_id)?;

    let mut out = String::new();
    out.push_str(&format!("tablet:       {}\n", tablet_id));
    out.push_str(&format!("table:        {}\n", superblock.table_name));
    out.push_str(&format!("data state:   {}\n", meta.data_state()));
    out.push_str(&format!("rowsets:      {}\n", superblock.rowsets.len()));
    out.push_str(&format!("blocks:       {}\n", superblock.count_blocks()));
    out.push_str(&format!("wal segments: {:?}\n", wal_segments));
    if let Some(seqno) = meta.tombstone_last_logged_seqno() {
        out.push_str(&format!("tombstoned at WAL segment {}\n", seqno));
    }
    Ok(out)
}
