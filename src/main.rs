use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use hostdeck::{
    AuthConfig, ConflictDecision, ConnectionManager, ListOptions, NullNotifier, RemoteIdentity,
    RemoteRegistry, Result, SshConnector, TransferOutcome, init_tracing,
};
use tracing::info;

/// Manage SSH hosts: run commands, browse files and hold port forwards.
#[derive(Parser, Debug)]
#[command(name = "hostdeck")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured remotes
    Remotes,

    /// Add a remote
    Add(AddArgs),

    /// Remove a remote
    Rm {
        /// Remote id or name
        remote: String,
    },

    /// Run a command on a remote and print its output
    Exec {
        /// Remote id or name
        remote: String,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// List a remote directory
    Ls {
        /// Remote id or name
        remote: String,

        #[arg(default_value = ".")]
        path: String,

        /// Include `.` and `..`
        #[arg(short, long)]
        all: bool,

        /// Descend into subdirectories
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Hold a saved tunnel open until Ctrl-C
    Tunnel {
        /// Remote id or name
        remote: String,

        /// Tunnel id or name
        tunnel: String,
    },

    /// Download a file or directory
    Get {
        /// Remote id or name
        remote: String,

        remote_path: String,

        local_path: PathBuf,

        /// Replace local files that already exist
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Args, Debug)]
struct AddArgs {
    /// Display name, defaults to the host
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    host: String,

    #[arg(long, default_value = "22")]
    port: u16,

    #[arg(long)]
    user: String,

    /// Private key file
    #[arg(long, value_name = "FILE")]
    key: Option<String>,

    /// Passphrase for the private key (saved encrypted)
    #[arg(long)]
    passphrase: Option<String>,

    /// Password (saved encrypted)
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = match cli.config {
        Some(path) => path,
        None => RemoteRegistry::default_config_path()?,
    };
    let log_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)?;
    init_tracing(&cli.log_level, &log_dir)?;

    let registry = Arc::new(RemoteRegistry::with_path(&config_path)?);
    let manager = ConnectionManager::new(
        registry.clone(),
        Arc::new(SshConnector),
        Arc::new(NullNotifier),
    );

    match cli.command {
        Commands::Remotes => {
            for remote in registry.remotes()? {
                println!(
                    "{:<36}  {:<16}  {}@{}  tunnels={} shortcuts={}",
                    remote.id,
                    remote.name,
                    remote.user,
                    remote.host_port(),
                    remote.tunnels.len(),
                    remote.shortcuts.len()
                );
            }
            Ok(0)
        }
        Commands::Add(args) => {
            let mut auth = match args.key {
                Some(key) => AuthConfig::key_file(key, args.passphrase),
                None => AuthConfig::default(),
            };
            if let Some(password) = args.password {
                auth.password = Some(password);
                auth.store_password = true;
            }
            let mut remote = RemoteIdentity::new(args.host, args.port, args.user, auth);
            if let Some(name) = args.name {
                remote.name = name;
            }
            let id = registry.add_remote(remote)?;
            println!("{}", id);
            Ok(0)
        }
        Commands::Rm { remote } => {
            let remote = registry.resolve(&remote)?;
            registry.remove_remote(&remote.id)?;
            Ok(0)
        }
        Commands::Exec { remote, command } => {
            let id = registry.resolve(&remote)?.id;
            manager.connect(&id).await?;
            let output = manager.exec(&id, &command.join(" ")).await;
            manager.disconnect(&id).await;
            let output = output?;

            std::io::stdout().write_all(&output.stdout)?;
            std::io::stderr().write_all(&output.stderr)?;
            Ok(output.exit_code as i32)
        }
        Commands::Ls {
            remote,
            path,
            all,
            recursive,
        } => {
            let id = registry.resolve(&remote)?.id;
            manager.connect(&id).await?;
            let listing = match manager.files(&id).await {
                Ok(files) => {
                    let options = ListOptions {
                        add_dot_folders: all,
                        recursive,
                    };
                    files.list(&path, options).await
                }
                Err(e) => Err(e),
            };
            manager.disconnect(&id).await;

            for file in listing? {
                println!(
                    "{} {:<8} {:<8} {:>10} {}",
                    file.mode_string(),
                    file.owner_display(),
                    file.group_display(),
                    file.size,
                    if recursive { &file.path } else { &file.name }
                );
            }
            Ok(0)
        }
        Commands::Tunnel { remote, tunnel } => {
            let id = registry.resolve(&remote)?.id;
            manager.connect(&id).await?;
            let addr = match manager.connect_tunnel(&id, &tunnel).await {
                Ok(addr) => addr,
                Err(e) => {
                    manager.disconnect(&id).await;
                    return Err(e);
                }
            };

            println!("Forwarding on {}, Ctrl-C to stop", addr);
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, closing tunnel {}", tunnel);
            manager.disconnect_all().await;
            Ok(0)
        }
        Commands::Get {
            remote,
            remote_path,
            local_path,
            overwrite,
        } => {
            let id = registry.resolve(&remote)?.id;
            manager.connect(&id).await?;
            let result = download(&manager, &id, &remote_path, &local_path, overwrite).await;
            manager.disconnect(&id).await;
            result
        }
    }
}

async fn download(
    manager: &ConnectionManager,
    id: &str,
    remote_path: &str,
    local_path: &Path,
    overwrite: bool,
) -> Result<i32> {
    let files = manager.files(id).await?;
    let decision = if overwrite {
        ConflictDecision::OverwriteAll
    } else {
        ConflictDecision::SkipAll
    };

    if files.stat(remote_path).await?.is_dir() {
        let report = files
            .download_folder(remote_path, local_path, |_| decision)
            .await?;
        for (path, error) in &report.failed {
            eprintln!("failed: {}: {}", path, error);
        }
        println!(
            "{} downloaded, {} skipped, {} failed",
            report.downloaded.len(),
            report.skipped.len(),
            report.failed.len()
        );
        return Ok(if report.failed.is_empty() { 0 } else { 1 });
    }

    match files.download_file(remote_path, local_path, |_| decision).await? {
        TransferOutcome::Transferred => println!("{} -> {}", remote_path, local_path.display()),
        TransferOutcome::Skipped => println!("{} exists, skipped", local_path.display()),
    }
    Ok(0)
}
