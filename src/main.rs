//! transit - copy, move and delete across local disks, archives and object storage.
//!
//! Usage:
//!   transit copy SOURCES... DEST     Copy entries into a directory
//!   transit move SOURCES... DEST     Move entries into a directory
//!   transit delete TARGETS...        Delete entries
//!
//! Sources may name an entry inside an archive as `ARCHIVE#inner/path`.
//! Arguments naming an existing local path are never split.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tracing_subscriber::EnvFilter;

use transit_core::TransferConfig;
use transit_ops::{
    ConfirmReply, ConflictPrompt, ConflictReply, OperationRequest, OperationResult, OperationUi,
    ProgressSnapshot, RenameReply, Resolution, TransferService, numbered_name,
};
use transit_storage::{ArchiveBackend, ArchiveFormat, LocalBackend, PathHandle};

#[derive(Parser)]
#[command(
    name = "transit",
    version,
    about = "Copy, move and delete across local disks, archives and object storage",
    long_about = "transit runs file operations with conflict detection, progress \
                  reporting and cancellation.\n\n\
                  Archive entries can be used as sources with `ARCHIVE#inner/path`."
)]
struct Cli {
    /// Do not ask for confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// What to do when a destination already exists
    #[arg(long, global = true, default_value = "ask")]
    on_conflict: ConflictPolicy,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Read settings from a TOML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy entries into a directory
    Copy {
        /// Entries to copy
        #[arg(required = true)]
        sources: Vec<String>,

        /// Destination directory
        destination: PathBuf,
    },

    /// Move entries into a directory
    Move {
        /// Entries to move
        #[arg(required = true)]
        sources: Vec<String>,

        /// Destination directory
        destination: PathBuf,
    },

    /// Delete entries
    Delete {
        /// Entries to delete
        #[arg(required = true)]
        targets: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum ConflictPolicy {
    /// Ask on the terminal
    #[default]
    Ask,
    Skip,
    Overwrite,
    /// Write next to the existing entry as "name (n).ext"
    Rename,
    /// Cancel the whole operation
    Abort,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TransferConfig::load(path).wrap_err("Cannot load config")?,
        None => TransferConfig::default(),
    };
    if cli.yes {
        config.confirm_copy = false;
        config.confirm_move = false;
        config.confirm_delete = false;
    }
    tracing::debug!(?config, "Configuration resolved");

    let mut resolver = SourceResolver::new(config.memory_materialize_limit);
    let request = match cli.command {
        Command::Copy {
            sources,
            destination,
        } => OperationRequest::copy(resolver.resolve_all(&sources)?, local(&destination)?),
        Command::Move {
            sources,
            destination,
        } => OperationRequest::move_to(resolver.resolve_all(&sources)?, local(&destination)?),
        Command::Delete { targets } => OperationRequest::delete(resolver.resolve_all(&targets)?),
    };
    let request = request.with_default_overwrite(cli.on_conflict == ConflictPolicy::Overwrite);

    let ui = Arc::new(ConsoleUi::new(cli.on_conflict, cli.json));
    let mut service = TransferService::new(config);
    let handle = service.start(request, ui.clone());
    service.run_until_idle().await;

    let result = service
        .result(handle.id())
        .cloned()
        .ok_or_else(|| eyre!("Operation ended without a result"))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_report(&result);
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn local(path: &Path) -> Result<PathHandle> {
    let path = std::path::absolute(path).wrap_err_with(|| format!("Invalid path: {}", path.display()))?;
    Ok(LocalBackend::handle(path))
}

/// Turns command-line arguments into handles, opening each archive once.
struct SourceResolver {
    memory_limit: u64,
    archives: HashMap<PathBuf, Arc<ArchiveBackend>>,
}

impl SourceResolver {
    fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            archives: HashMap::new(),
        }
    }

    fn resolve_all(&mut self, args: &[String]) -> Result<Vec<PathHandle>> {
        args.iter().map(|arg| self.resolve(arg)).collect()
    }

    fn resolve(&mut self, arg: &str) -> Result<PathHandle> {
        let Some((archive, inner)) = split_archive_arg(arg) else {
            return local(Path::new(arg));
        };

        let archive = std::path::absolute(archive).wrap_err_with(|| format!("Invalid path: {archive}"))?;
        let backend = match self.archives.get(&archive) {
            Some(backend) => Arc::clone(backend),
            None => {
                let backend = ArchiveBackend::open_with_limit(&archive, self.memory_limit)
                    .wrap_err_with(|| format!("Cannot open archive {}", archive.display()))?;
                self.archives.insert(archive, Arc::clone(&backend));
                backend
            }
        };

        let inner = inner.trim_matches('/');
        Ok(if inner.is_empty() {
            backend.root()
        } else {
            backend.entry(inner)
        })
    }
}

/// Split `ARCHIVE#inner` at the first `#` preceded by an archive file name.
fn split_archive_arg(arg: &str) -> Option<(&str, &str)> {
    if Path::new(arg).symlink_metadata().is_ok() {
        return None;
    }
    arg.match_indices('#')
        .map(|(i, _)| (&arg[..i], &arg[i + 1..]))
        .find(|(archive, _)| ArchiveFormat::detect(Path::new(archive)).is_some())
}

/// Terminal front end. Questions are read on a helper thread so the
/// control loop never waits on the keyboard.
struct ConsoleUi {
    policy: ConflictPolicy,
    quiet: bool,
    /// Suffix number for the next automatic rename.
    rename_attempt: AtomicUsize,
    last_line: Mutex<usize>,
}

impl ConsoleUi {
    fn new(policy: ConflictPolicy, quiet: bool) -> Self {
        Self {
            policy,
            quiet,
            rename_attempt: AtomicUsize::new(1),
            last_line: Mutex::new(0),
        }
    }

    fn clear_progress(&self) {
        let mut last = self.last_line.lock().unwrap_or_else(|p| p.into_inner());
        if *last > 0 {
            eprint!("\r{}\r", " ".repeat(*last));
            *last = 0;
        }
    }
}

/// Print `question` and hand the typed line to `answer` on another thread.
/// `None` means stdin was closed.
fn ask(question: String, answer: impl FnOnce(Option<String>) + Send + 'static) {
    std::thread::spawn(move || {
        eprint!("{question}");
        let _ = io::stderr().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => answer(None),
            Ok(_) => answer(Some(line.trim().to_string())),
        }
    });
}

impl OperationUi for ConsoleUi {
    fn show_confirmation(&self, request: &OperationRequest, reply: ConfirmReply) {
        self.clear_progress();
        let mut question = format!("{} {} item(s)", request.kind, request.sources.len());
        if let Some(destination) = &request.destination {
            question.push_str(&format!(" to {destination}"));
        }
        question.push_str("? [y/N] ");

        ask(question, move |line| match line.as_deref() {
            Some("y" | "Y" | "yes") => reply.confirm(),
            _ => reply.reject(),
        });
    }

    fn show_conflict_dialog(&self, prompt: &ConflictPrompt, reply: ConflictReply) {
        self.clear_progress();
        let conflict = &prompt.conflict;

        match self.policy {
            ConflictPolicy::Skip => reply.skip(true),
            ConflictPolicy::Overwrite => reply.overwrite(true),
            ConflictPolicy::Abort => {
                eprintln!("{}: {}", conflict.destination, conflict.kind);
                reply.cancel_all();
            }
            ConflictPolicy::Rename => {
                // A notice means the previous proposal was taken.
                let n = if prompt.notice.is_some() {
                    self.rename_attempt.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.rename_attempt.store(1, Ordering::Relaxed);
                    1
                };
                let name = numbered_name(&conflict.destination.name(), n);
                reply.resolve(Resolution::Rename(name), false);
            }
            ConflictPolicy::Ask => {
                if let Some(notice) = &prompt.notice {
                    eprintln!("{notice}");
                }
                let question = format!(
                    "[{}/{}] {}: {}\n  [o]verwrite, [s]kip, [r]ename, [a]bort (O/S apply to all): ",
                    prompt.index + 1,
                    prompt.total,
                    conflict.kind,
                    conflict.destination
                );
                ask(question, move |line| match line.as_deref() {
                    Some("o") => reply.overwrite(false),
                    Some("O") => reply.overwrite(true),
                    Some("s") => reply.skip(false),
                    Some("S") => reply.skip(true),
                    Some("r" | "R") => reply.rename(),
                    _ => reply.cancel_all(),
                });
            }
        }
    }

    fn show_rename_dialog(&self, _source: &PathHandle, destination: &PathHandle, reply: RenameReply) {
        self.clear_progress();
        let suggestion = numbered_name(&destination.name(), 1);
        let question = format!("New name for {destination} [{suggestion}]: ");
        ask(question, move |line| match line {
            None => reply.cancel(),
            Some(name) if name.is_empty() => reply.submit(suggestion),
            Some(name) => reply.submit(name),
        });
    }

    fn report_progress(&self, snapshot: &ProgressSnapshot) {
        if self.quiet {
            return;
        }
        let mut line = format!(
            "{:>5.1}%  {} / {}  ({} of {} files)",
            snapshot.percentage(),
            format_size(snapshot.bytes_done),
            format_size(snapshot.bytes_total),
            snapshot.files_done,
            snapshot.files_total
        );
        if let Some(item) = &snapshot.current_item {
            line.push_str("  ");
            line.push_str(&truncate(item, 50));
        }

        let mut last = self.last_line.lock().unwrap_or_else(|p| p.into_inner());
        let width = line.chars().count();
        eprint!("\r{line}{}", " ".repeat(last.saturating_sub(width)));
        *last = width;
    }

    fn report_completion(&self, _result: &OperationResult) {
        self.clear_progress();
    }
}

fn print_report(result: &OperationResult) {
    println!("{}", result.summary());
    if result.bytes_processed > 0 {
        println!("  {} processed", format_size(result.bytes_processed));
    }
    for failure in &result.failed {
        println!("  failed: {failure}");
    }
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        s.to_string()
    } else {
        let tail: String = s.chars().skip(count - (max_len - 3)).collect();
        format!("...{tail}")
    }
}
