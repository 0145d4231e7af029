//! `rfs`: command-line front end for the `remote-fs` bridge.
//!
//! Every command takes one or more `sftp://[user@]host[:port]/path`
//! locators.  Configuration is read from `$XDG_CONFIG_HOME/remote-fs/config.toml`
//! unless `--config` names another file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use remote_fs::{
    Config, ConnectionManager, DeleteOptions, FileKind, FileStat, RemoteFs, RenameOptions,
    ResourceHandle, SessionInfo, Transfer, WriteOptions,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "rfs",
    version,
    about = "Work with files on SSH hosts as if they were local"
)]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/remote-fs/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User for locators that do not name one
    #[arg(short, long, global = true, env = "REMOTE_FS_USER")]
    user: Option<String>,

    /// Log protocol round trips and cache activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the kind, size and modification time of a remote path
    Stat { locator: String },

    /// List a remote directory
    Ls { locator: String },

    /// Print a remote file to stdout
    Cat { locator: String },

    /// Write stdin to a remote file
    Put {
        locator: String,
        /// Fail if the file already exists
        #[arg(long)]
        no_clobber: bool,
    },

    /// Download a remote file to a local path
    Get {
        locator: String,
        local: PathBuf,
        /// Report bytes copied on stderr
        #[arg(short, long)]
        progress: bool,
    },

    /// Upload a local file to a remote path
    Upload {
        local: PathBuf,
        locator: String,
        /// Fail if the remote file already exists
        #[arg(long)]
        no_clobber: bool,
        /// Report bytes copied on stderr
        #[arg(short, long)]
        progress: bool,
    },

    /// Remove a remote file or directory
    Rm {
        locator: String,
        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },

    /// Rename a remote path on the same host
    Mv {
        from: String,
        to: String,
        /// Replace the target if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Create a remote directory
    Mkdir { locator: String },

    /// Connect to the given hosts and show the pooled sessions
    Connections {
        #[arg(required = true)]
        locators: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let default_user = cli
        .user
        .clone()
        .or_else(|| config.connection.default_user.clone())
        .or_else(|| std::env::var("USER").ok());

    let manager = Arc::new(
        ConnectionManager::new(Arc::new(config.sftp_transport()))
            .with_default_credentials(config.credentials()),
    );
    let cache = Arc::new(config.open_cache().context("failed to open the content cache")?);
    let fs = RemoteFs::new(manager.clone(), cache, config.bridge_config());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let result = run(&fs, cli.command, default_user.as_deref(), cancel).await;
    manager.dispose().await;
    result
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn locate(locator: &str, default_user: Option<&str>) -> Result<ResourceHandle> {
    ResourceHandle::parse(locator, default_user).with_context(|| format!("bad locator '{locator}'"))
}

async fn run(
    fs: &RemoteFs,
    command: Commands,
    user: Option<&str>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    match command {
        Commands::Stat { locator } => {
            let handle = locate(&locator, user)?;
            let stat = fs.stat(&handle).await.with_context(|| format!("stat {handle}"))?;
            stdout.write_all(format_stat(&stat).as_bytes()).await?;
        }

        Commands::Ls { locator } => {
            let handle = locate(&locator, user)?;
            let mut entries = fs.list(&handle).await.with_context(|| format!("ls {handle}"))?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            let mut out = String::new();
            for entry in entries {
                out.push_str(&entry.name);
                if entry.kind == FileKind::Directory {
                    out.push('/');
                }
                out.push('\n');
            }
            stdout.write_all(out.as_bytes()).await?;
        }

        Commands::Cat { locator } => {
            let handle = locate(&locator, user)?;
            let transfer = fs.transfer().cancel_on(cancel);
            let data = fs
                .read_with(&handle, &transfer)
                .await
                .with_context(|| format!("cat {handle}"))?;
            stdout.write_all(&data).await?;
        }

        Commands::Put { locator, no_clobber } => {
            let handle = locate(&locator, user)?;
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("failed to read stdin")?;
            let transfer = fs.transfer().cancel_on(cancel);
            fs.write_with(&handle, Bytes::from(data), write_options(no_clobber), &transfer)
                .await
                .with_context(|| format!("put {handle}"))?;
        }

        Commands::Get {
            locator,
            local,
            progress,
        } => {
            let handle = locate(&locator, user)?;
            let report = progress_printer(&local);
            let mut transfer = Transfer::new(fs.config().chunk_size).cancel_on(cancel);
            if progress {
                transfer = transfer.on_progress(&report);
            }
            let copied = fs
                .read_to(&handle, &local, &transfer)
                .await
                .with_context(|| format!("get {handle}"))?;
            debug!(bytes = copied, local = %local.display(), "download complete");
        }

        Commands::Upload {
            local,
            locator,
            no_clobber,
            progress,
        } => {
            let handle = locate(&locator, user)?;
            let report = progress_printer(&local);
            let mut transfer = Transfer::new(fs.config().chunk_size).cancel_on(cancel);
            if progress {
                transfer = transfer.on_progress(&report);
            }
            let copied = fs
                .write_from(&handle, &local, write_options(no_clobber), &transfer)
                .await
                .with_context(|| format!("upload {} to {handle}", local.display()))?;
            debug!(bytes = copied, local = %local.display(), "upload complete");
        }

        Commands::Rm { locator, recursive } => {
            let handle = locate(&locator, user)?;
            fs.delete(&handle, DeleteOptions { recursive })
                .await
                .with_context(|| format!("rm {handle}"))?;
        }

        Commands::Mv { from, to, force } => {
            let from = locate(&from, user)?;
            let to = locate(&to, user)?;
            fs.rename(&from, &to, RenameOptions { overwrite: force })
                .await
                .with_context(|| format!("mv {from} {to}"))?;
        }

        Commands::Mkdir { locator } => {
            let handle = locate(&locator, user)?;
            fs.mkdir(&handle)
                .await
                .with_context(|| format!("mkdir {handle}"))?;
        }

        Commands::Connections { locators } => {
            for locator in &locators {
                let handle = locate(locator, user)?;
                fs.manager()
                    .acquire(&handle.identity)
                    .await
                    .with_context(|| format!("connect to {}", handle.identity))?;
            }
            let mut out = String::new();
            for info in fs.manager().list() {
                out.push_str(&format_session(&info));
            }
            stdout.write_all(out.as_bytes()).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn write_options(no_clobber: bool) -> WriteOptions {
    WriteOptions {
        create: true,
        overwrite: !no_clobber,
    }
}

fn progress_printer(local: &Path) -> impl Fn(u64) + Send + Sync + use<> {
    let name = local.display().to_string();
    move |bytes| eprint!("\r{name}: {bytes} bytes")
}

fn format_stat(stat: &FileStat) -> String {
    let kind = match stat.kind {
        FileKind::File => "file",
        FileKind::Directory => "directory",
    };
    let modified = stat
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("kind: {kind}\nsize: {}\nmodified: {modified}\n", stat.size)
}

fn format_session(info: &SessionInfo) -> String {
    let mut line = format!(
        "{}\t{}\tops={}\tbytes={}\trate={:.0}B/s\t{}\n",
        info.identity,
        info.state,
        info.stats.operations,
        info.stats.bytes_transferred,
        info.stats.transfer_rate,
        info.description,
    );
    if let Some(err) = &info.last_error {
        line.push_str(&format!("  last error: {err}\n"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_recursive_delete() {
        let cli = Cli::try_parse_from(["rfs", "rm", "-r", "sftp://h/tmp/x"]).unwrap();
        match cli.command {
            Commands::Rm { locator, recursive } => {
                assert_eq!(locator, "sftp://h/tmp/x");
                assert!(recursive);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "rfs",
            "mv",
            "sftp://h/a",
            "sftp://h/b",
            "--force",
            "-v",
            "--user",
            "deploy",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.user.as_deref(), Some("deploy"));
        assert!(matches!(cli.command, Commands::Mv { force: true, .. }));
    }

    #[test]
    fn connections_needs_a_locator() {
        assert!(Cli::try_parse_from(["rfs", "connections"]).is_err());
    }

    #[test]
    fn no_clobber_disables_overwrite() {
        assert!(write_options(false).overwrite);
        let opts = write_options(true);
        assert!(opts.create);
        assert!(!opts.overwrite);
    }

    #[test]
    fn stat_output() {
        let stat = FileStat {
            kind: FileKind::Directory,
            size: 4096,
            modified: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        };
        assert_eq!(
            format_stat(&stat),
            "kind: directory\nsize: 4096\nmodified: 1700000000\n"
        );
    }
}
