// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use stowage::{InstallOptions, InstallerConfig, ManagedArtifact, ModuleManager};
use tracing::info;

const DEFAULT_STATE_DIR: &str = "/var/lib/stowage";

#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about = "Versioned module installer with checksum idempotence and rollback", long_about = None)]
struct Cli {
    /// State directory holding the artifact record and module registry
    #[arg(short, long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: String,

    /// Regex of symbolic names that are always persisted
    #[arg(long, global = true)]
    persist_allow: Option<String>,

    /// Regex of symbolic names that are not persisted unless allowed
    #[arg(long, global = true)]
    persist_deny: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory
    Init,
    /// Install a module archive from a file, a URL or the registry
    Install {
        /// Archive path or URL; omit to refer to an installed module
        source: Option<String>,
        /// Symbolic name the archive must carry
        #[arg(short, long)]
        name: Option<String>,
        /// Version the archive must carry
        #[arg(long = "module-version")]
        version: Option<String>,
        /// URL to record for an archive read from a local file
        #[arg(short, long)]
        url: Option<String>,
        /// Registry location of an installed module to bring under management
        #[arg(short, long)]
        location: Option<String>,
        /// Replace non-snapshot versions and shadow other modules' items
        #[arg(short, long)]
        force: bool,
        /// Do not start the module
        #[arg(long)]
        no_start: bool,
        /// Do not load declared items
        #[arg(long)]
        no_items: bool,
        /// Accept declared items without validating them
        #[arg(long)]
        no_validate: bool,
    },
    /// Stop managing a module and remove it
    Uninstall {
        /// Symbolic name
        name: String,
        /// Module version
        version: String,
    },
    /// List managed artifacts
    List,
    /// Show install journal
    History,
    /// Print the content checksum of an archive
    Checksum {
        /// Archive path
        path: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn open_manager(cli: &Cli) -> Result<Arc<ModuleManager>> {
    let config = InstallerConfig {
        state_dir: cli.state_dir.clone().into(),
        persist_allow: cli.persist_allow.clone(),
        persist_deny: cli.persist_deny.clone(),
    };
    let manager = ModuleManager::open(&config)
        .with_context(|| format!("Failed to open state directory {}", cli.state_dir))?;
    Ok(Arc::new(manager))
}

/// Build the artifact and input stream for an install source
///
/// A source naming an existing file is read as a stream; anything else is
/// treated as a URL to fetch.
fn install_input(
    source: Option<&str>,
    url: Option<String>,
) -> Result<(ManagedArtifact, Option<Box<dyn Read + Send>>)> {
    match source {
        Some(source) if Path::new(source).is_file() => {
            let file = File::open(source).with_context(|| format!("Failed to open {}", source))?;
            let mut artifact = ManagedArtifact::new();
            artifact.url = url;
            Ok((artifact, Some(Box::new(BufReader::new(file)))))
        }
        Some(source) => Ok((ManagedArtifact::from_url(source), None)),
        None => {
            let mut artifact = ManagedArtifact::new();
            artifact.url = url;
            Ok((artifact, None))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Init) => {
            info!("Initializing Stowage state at: {}", cli.state_dir);
            open_manager(&cli)?;
            println!("State initialized successfully at: {}", cli.state_dir);
            Ok(())
        }
        Some(Commands::Install {
            source,
            name,
            version,
            url,
            location,
            force,
            no_start,
            no_items,
            no_validate,
        }) => {
            let manager = open_manager(&cli)?;
            let (mut artifact, input) = install_input(source.as_deref(), url.clone())?;
            if let (Some(name), Some(version)) = (name, version) {
                let mut supplied = ManagedArtifact::named(name.clone(), version.clone());
                supplied.url = artifact.url.take();
                artifact = supplied;
            } else if name.is_some() || version.is_some() {
                return Err(anyhow::anyhow!(
                    "--name and --module-version must be given together"
                ));
            }
            if let Some(location) = location {
                artifact = artifact.with_location(location.clone());
            }

            let options = InstallOptions {
                start: !*no_start,
                load_items: !*no_items,
                force: *force,
                validate_items: !*no_validate,
                ..InstallOptions::default()
            };

            let mut installer = manager.installer(artifact, input).with_options(options);
            let outcome = installer.install()?;

            println!("[{}] {}", outcome.code, outcome.message);
            if let Some(location) = &outcome.artifact.location {
                println!("  Location: {}", location);
            }
            if let Some(checksum) = &outcome.artifact.checksum {
                println!("  Checksum: {}", checksum);
            }
            if !outcome.items.is_empty() {
                println!("  Items: {}", outcome.items.len());
                for item in &outcome.items {
                    println!("    - {}", item);
                }
            }
            Ok(())
        }
        Some(Commands::Uninstall { name, version }) => {
            let manager = open_manager(&cli)?;
            let artifact = manager.uninstall(name, version)?;
            println!("Uninstalled {}", artifact);
            Ok(())
        }
        Some(Commands::List) => {
            let manager = open_manager(&cli)?;
            let rows = manager.record().list()?;

            if rows.is_empty() {
                println!("No managed artifacts.");
            } else {
                println!("Managed artifacts:");
                for row in &rows {
                    let state = manager
                        .registry()
                        .find_by_location(&row.location)
                        .map(|module| module.state.as_str().to_string())
                        .unwrap_or_else(|| "missing".to_string());
                    print!("  {} {} [{}]", row.symbolic_name, row.version, state);
                    let urls = match row.id {
                        Some(id) => manager.record().urls_of(id)?,
                        None => Vec::new(),
                    };
                    if !urls.is_empty() {
                        print!(" from {}", urls.join(", "));
                    }
                    println!();
                }
                println!("\nTotal: {} artifact(s)", rows.len());
            }
            Ok(())
        }
        Some(Commands::History) => {
            let manager = open_manager(&cli)?;
            let entries = manager.record().journal()?;

            if entries.is_empty() {
                println!("No install history.");
            } else {
                println!("Install history:");
                for entry in &entries {
                    let timestamp = entry
                        .finished_at
                        .as_deref()
                        .or(entry.created_at.as_deref())
                        .unwrap_or("pending");
                    println!(
                        "  [{}] {} - {} ({})",
                        entry.id.unwrap_or_default(),
                        timestamp,
                        entry.description,
                        entry.status.as_str()
                    );
                }
                println!("\nTotal: {} entr(ies)", entries.len());
            }
            Ok(())
        }
        Some(Commands::Checksum { path }) => {
            let checksum = stowage::archive::compute_checksum(Path::new(path))?;
            println!("{}  {}", checksum, path);
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(*shell, &mut Cli::command(), "stowage", &mut io::stdout());
            Ok(())
        }
        None => {
            println!("Stowage Module Installer v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'stowage --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_parses_flags() {
        let cli = Cli::parse_from([
            "stowage",
            "--state-dir",
            "/tmp/state",
            "install",
            "module.tar",
            "--name",
            "acme.core",
            "--module-version",
            "1.0",
            "--force",
            "--no-items",
        ]);
        assert_eq!(cli.state_dir, "/tmp/state");
        match cli.command {
            Some(Commands::Install {
                source,
                name,
                version,
                force,
                no_items,
                no_start,
                ..
            }) => {
                assert_eq!(source.as_deref(), Some("module.tar"));
                assert_eq!(name.as_deref(), Some("acme.core"));
                assert_eq!(version.as_deref(), Some("1.0"));
                assert!(force);
                assert!(no_items);
                assert!(!no_start);
            }
            _ => panic!("expected install command"),
        }
    }

    #[test]
    fn test_existing_file_is_read_as_stream() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();

        let (artifact, input) =
            install_input(Some(path), Some("https://example.com/a.tar".to_string())).unwrap();
        assert!(input.is_some());
        assert_eq!(artifact.url.as_deref(), Some("https://example.com/a.tar"));
    }

    #[test]
    fn test_unknown_source_is_treated_as_url() {
        let (artifact, input) =
            install_input(Some("https://example.com/missing.tar"), None).unwrap();
        assert!(input.is_none());
        assert_eq!(artifact.url.as_deref(), Some("https://example.com/missing.tar"));
    }
}
