use std::{
    fs::File,
    io::{self, BufReader, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gix_object::Kind;
use indicatif::{ProgressBar, ProgressStyle};

use git_ledger::{
    commands::{self, push::PushRequest},
    config::ServiceConfig,
    pack::{objects::kind_name, ObjectId, PackObserver, PackfileDecoder, Seekable},
    protocol::GitService,
    refs::RefUpdateCommand,
    storage::{FilesystemStore, RepoNamespace},
};

#[derive(Parser)]
#[command(name = "git-ledger", version, about = "Store Git pushes in a key-value namespace")]
struct Cli {
    /// Store directory (overrides config and GIT_LEDGER_STORE_DIR)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a pack and apply reference updates
    Push {
        /// Repository as owner/name
        repo: String,
        #[arg(long)]
        author: String,
        /// Pack file to ingest (empty pack if omitted)
        #[arg(long)]
        pack: Option<PathBuf>,
        /// Reference update as <old>:<new>:<ref>
        #[arg(long = "update", required = true)]
        updates: Vec<String>,
        /// Apply all updates or none
        #[arg(long)]
        atomic: bool,
    },
    /// List references with their hashes
    ListRefs { repo: String },
    /// Print advertised references as JSON
    AdvertisedRefs { repo: String },
    /// Print capabilities offered to pushing clients
    Capabilities,
    /// Decode a pack file and print its objects
    IndexPack { pack: PathBuf },
}

/// Drives a progress bar from decoder callbacks
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {msg} [{bar:40.cyan/blue}] {pos}/{len} objects ({eta})")
                .context("Failed to create progress template")?
                .progress_chars("█▓░"),
        );
        bar.set_message("Resolving objects");
        Ok(Self { bar })
    }
}

impl PackObserver for ProgressObserver {
    fn on_header(&mut self, count: u32) -> git_ledger::Result<()> {
        self.bar.set_length(count as u64);
        Ok(())
    }

    fn on_inflated_object_content(
        &mut self,
        _id: ObjectId,
        _offset: u64,
        _crc32: u32,
        _content: &[u8],
    ) -> git_ledger::Result<()> {
        self.bar.inc(1);
        Ok(())
    }

    fn on_footer(&mut self, _checksum: ObjectId) -> git_ledger::Result<()> {
        self.bar.finish_and_clear();
        Ok(())
    }
}

/// Prints one `id kind size offset` line per object
struct ListingObserver<W> {
    output: W,
    pending: Option<(Kind, u64)>,
}

impl<W: Write> PackObserver for ListingObserver<W> {
    fn on_inflated_object_header(
        &mut self,
        kind: Kind,
        size: u64,
        _offset: u64,
    ) -> git_ledger::Result<()> {
        self.pending = Some((kind, size));
        Ok(())
    }

    fn on_inflated_object_content(
        &mut self,
        id: ObjectId,
        offset: u64,
        _crc32: u32,
        _content: &[u8],
    ) -> git_ledger::Result<()> {
        if let Some((kind, size)) = self.pending.take() {
            writeln!(self.output, "{} {} {} {}", id, kind_name(kind), size, offset)?;
        }
        Ok(())
    }
}

fn open_service(cli_store: Option<PathBuf>, atomic: bool) -> Result<GitService<FilesystemStore>> {
    let mut config = ServiceConfig::load()?;
    if let Some(store) = cli_store {
        config.store_dir = store;
    }
    config.atomic_ref_updates |= atomic;
    tracing::debug!("using store at {:?}", config.store_dir);
    let store = FilesystemStore::new(&config.store_dir)?;
    Ok(GitService::new(Arc::new(store), config))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Push {
            repo,
            author,
            pack,
            updates,
            atomic,
        } => {
            let commands = updates
                .iter()
                .map(|u| u.parse::<RefUpdateCommand>())
                .collect::<git_ledger::Result<Vec<_>>>()?;
            let packfile = match pack {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read pack file {:?}", path))?,
                None => Vec::new(),
            };

            let service = open_service(cli.store, atomic)?;
            let report = service.push(&PushRequest {
                namespace: repo,
                author,
                commands,
                packfile,
                shallow: None,
            })?;
            report.write_report(&mut out)?;
            if !report.accepted() {
                anyhow::bail!("push rejected");
            }
        }
        Command::ListRefs { repo } => {
            let service = open_service(cli.store, false)?;
            let repo = RepoNamespace::parse(&repo)?;
            commands::list::handle(service.store().as_ref(), &repo, &mut out)?;
        }
        Command::AdvertisedRefs { repo } => {
            let service = open_service(cli.store, false)?;
            let repo = RepoNamespace::parse(&repo)?;
            commands::advertise::handle(service.store().as_ref(), &repo, &mut out)?;
        }
        Command::Capabilities => {
            commands::capabilities::handle(&mut out)?;
        }
        Command::IndexPack { pack } => {
            let file = File::open(&pack).with_context(|| format!("Failed to open {:?}", pack))?;
            let config = ServiceConfig::load()?;
            let mut progress = ProgressObserver::new()?;
            let mut listing = ListingObserver {
                output: &mut out,
                pending: None,
            };
            let checksum = PackfileDecoder::new(Seekable(BufReader::new(file)))
                .with_options(config.decoder_options())
                .observer(&mut progress)
                .observer(&mut listing)
                .decode()
                .with_context(|| format!("Failed to decode {:?}", pack))?;
            writeln!(out, "{}", checksum)?;
        }
    }

    out.flush()?;
    Ok(())
}
