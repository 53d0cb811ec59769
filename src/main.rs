use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sshdeck::command::{parse_count, EntryType, SearchOptions, MAX_LINES, MIN_LINES};
use sshdeck::config::{expand_home, parse_openssh_config, HostConfig};
use sshdeck::error::{EngineError, EngineResult};
use sshdeck::keychain::SecretPrompt;
use sshdeck::sftp::RemoteFile;
use sshdeck::ssh::Credential;
use sshdeck::{Connection, Engine, EngineOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sshdeck", version, about = "Browse, search and tail files on remote hosts over SSH")]
struct Cli {
    /// Config directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Authenticate with this private key only
    #[arg(long, global = true)]
    key: Option<String>,

    /// Keychain id of the key passphrase
    #[arg(long, global = true, requires = "key")]
    passphrase_id: Option<String>,

    /// Authenticate with the password stored under this keychain id only
    #[arg(long, global = true, conflicts_with = "key")]
    password_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    Ls {
        target: String,
        #[arg(default_value = "~")]
        path: String,
    },
    /// Print a remote file
    Cat { target: String, path: String },
    /// Print the first lines of a remote file
    Head {
        target: String,
        path: String,
        #[arg(short = 'n', long, default_value = "10")]
        lines: String,
    },
    /// Print the last lines of a remote file
    Tail {
        target: String,
        path: String,
        #[arg(short = 'n', long, default_value = "10")]
        lines: String,
    },
    /// Search file names, or contents with --content
    Search {
        target: String,
        pattern: String,
        #[arg(default_value = "~")]
        paths: Vec<String>,
        #[arg(long)]
        content: bool,
        #[arg(long)]
        regex: bool,
        #[arg(long)]
        case_sensitive: bool,
        /// Comma separated globs a file must match
        #[arg(long)]
        include: Option<String>,
        /// Comma separated globs to skip, as files and as directories
        #[arg(long)]
        exclude: Option<String>,
        #[arg(long)]
        max_results: Option<u32>,
        /// Only report files or directories
        #[arg(long, value_parser = parse_entry_type)]
        r#type: Option<EntryType>,
    },
    /// Run a command through the remote shell
    Exec {
        target: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show metadata for a remote path
    Stat { target: String, path: String },
    /// Forward a local port through the remote host until Ctrl-C
    Forward {
        target: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    /// Manage saved hosts
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
}

#[derive(Subcommand)]
enum HostsAction {
    /// List saved hosts
    List,
    /// Save a host under an alias
    Add {
        name: String,
        /// user@host[:port]
        target: String,
    },
    /// Forget a saved host
    Remove { name: String },
    /// Import hosts from an OpenSSH client config
    Import {
        #[arg(default_value = "~/.ssh/config")]
        path: String,
    },
}

fn parse_entry_type(raw: &str) -> Result<EntryType, String> {
    match raw {
        "f" | "file" => Ok(EntryType::File),
        "d" | "dir" | "directory" => Ok(EntryType::Directory),
        "any" => Ok(EntryType::Any),
        other => Err(format!("unknown entry type '{}'", other)),
    }
}

/// Reads secrets from the terminal without echo
struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn prompt(&self, message: &str) -> EngineResult<Option<String>> {
        let secret = dialoguer::Password::new()
            .with_prompt(message)
            .allow_empty_password(true)
            .interact()
            .map_err(|e| EngineError::Keychain(format!("Prompt failed: {}", e)))?;
        Ok(Some(secret).filter(|s| !s.is_empty()))
    }
}

impl Cli {
    fn credential(&self) -> Option<Credential> {
        if let Some(ref path) = self.key {
            return Some(Credential::PrivateKey {
                path: path.clone(),
                passphrase_id: self.passphrase_id.clone(),
            });
        }
        self.password_id.as_ref().map(|id| Credential::Password {
            credential_id: id.clone(),
        })
    }
}

fn print_listing(files: &[RemoteFile]) {
    for file in files {
        let kind = if file.is_directory { 'd' } else { '-' };
        let modified = chrono::DateTime::from_timestamp_millis(file.modified)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{}{} {:>6} {:>6} {:>10} {} {}",
            kind,
            file.permissions.as_deref().unwrap_or("?????????"),
            file.owner.as_deref().unwrap_or("-"),
            file.group.as_deref().unwrap_or("-"),
            file.size,
            modified,
            file.name
        );
    }
}

async fn connect(engine: &Engine, cli: &Cli, target: &str) -> Result<Connection> {
    engine
        .connect_target(target, cli.credential())
        .await
        .with_context(|| format!("Failed to connect to {}", target))
}

async fn run(engine: &Engine, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Ls { target, path } => {
            let connection = connect(engine, cli, target).await?;
            print_listing(&connection.list_files(path).await?);
        }
        Commands::Cat { target, path } => {
            let connection = connect(engine, cli, target).await?;
            let contents = connection.read_file(path).await?;
            print!("{}", String::from_utf8_lossy(&contents));
        }
        Commands::Head { target, path, lines } => {
            let connection = connect(engine, cli, target).await?;
            let count = parse_count(lines, MIN_LINES, MAX_LINES);
            print!("{}", connection.read_file_first_lines(path, count).await?);
        }
        Commands::Tail { target, path, lines } => {
            let connection = connect(engine, cli, target).await?;
            let count = parse_count(lines, MIN_LINES, MAX_LINES);
            print!("{}", connection.read_file_last_lines(path, count).await?);
        }
        Commands::Search {
            target,
            pattern,
            paths,
            content,
            regex,
            case_sensitive,
            include,
            exclude,
            max_results,
            r#type,
        } => {
            let connection = connect(engine, cli, target).await?;
            let options = SearchOptions {
                search_content: *content,
                regex: *regex,
                case_sensitive: *case_sensitive,
                include_pattern: include.clone(),
                exclude_pattern: exclude.clone(),
                max_results: max_results.unwrap_or(engine.settings().search.max_results),
                entry_type: r#type.unwrap_or_default(),
            };
            let matches = connection
                .search_files(paths.clone(), pattern, &options, None)
                .await?;
            for m in &matches {
                match (m.line, &m.preview) {
                    (Some(line), Some(preview)) => println!("{}:{}: {}", m.path, line, preview),
                    _ => println!("{}", m.path),
                }
            }
            eprintln!("{} match(es)", matches.len());
        }
        Commands::Exec { target, command } => {
            let connection = connect(engine, cli, target).await?;
            print!("{}", connection.exec(&command.join(" ")).await?);
        }
        Commands::Stat { target, path } => {
            let connection = connect(engine, cli, target).await?;
            let stat = connection.stat(path).await?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Commands::Forward {
            target,
            local_port,
            remote_host,
            remote_port,
        } => {
            let connection = connect(engine, cli, target).await?;
            let bound = connection
                .forward_port(*local_port, remote_host, *remote_port)
                .await?;
            println!(
                "Forwarding 127.0.0.1:{} -> {}:{} (Ctrl-C to stop)",
                bound, remote_host, remote_port
            );
            tokio::signal::ctrl_c().await?;
            connection.stop_forward(bound);
        }
        Commands::Hosts { action } => run_hosts(engine, action)?,
    }
    Ok(())
}

fn run_hosts(engine: &Engine, action: &HostsAction) -> Result<()> {
    match action {
        HostsAction::List => {
            for host in engine.hosts().read().list() {
                let auth = match host.credential {
                    Some(Credential::PrivateKey { ref path, .. }) => format!("key {}", path),
                    Some(Credential::Password { ref credential_id }) => format!("password {}", credential_id),
                    None => "auto".to_string(),
                };
                println!(
                    "{:<20} {}@{}:{} ({})",
                    host.name, host.username, host.host, host.port, auth
                );
            }
        }
        HostsAction::Add { name, target } => {
            let mut host = HostConfig::parse_target(target)?;
            host.name = name.clone();
            engine.hosts().write().add(host)?;
            println!("Saved {}", name);
        }
        HostsAction::Remove { name } => {
            engine.hosts().write().remove(name)?;
            println!("Removed {}", name);
        }
        HostsAction::Import { path } => {
            let path = expand_home(path);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let imported = parse_openssh_config(&content);
            let mut book = engine.hosts().write();
            for host in &imported {
                book.add(host.clone())?;
            }
            println!("Imported {} host(s) from {}", imported.len(), path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sshdeck=info,warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = Engine::init(EngineOptions {
        config_dir: cli.config_dir.clone(),
        prompt: Some(Arc::new(TerminalPrompt)),
        log_to_file: true,
        ..EngineOptions::default()
    })?;

    let result = run(&engine, &cli).await;
    engine.shutdown().await;
    result
}
