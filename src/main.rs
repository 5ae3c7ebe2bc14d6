//! Folio - extension runtime host for the Folio PDF editor.
//!
//! Drives the package runtime from the command line: list, enable, disable,
//! install and uninstall packages, run their commands, or keep them running
//! and stream host events.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use folio::core::Config;
use folio::plugin::{
    ChannelNotifier, DocumentInfo, HostEvent, HostNotifier, LifecycleCoordinator, LogNotifier,
    PackageState, PackageSummary,
};

/// Extension runtime for the Folio PDF editor
#[derive(Parser)]
#[command(name = "folio")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// User-data directory (overrides the config file and FOLIO_DATA_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed packages
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Enable (activate) a package
    Enable {
        /// Package id
        id: String,
    },

    /// Disable (deactivate) a package
    Disable {
        /// Package id
        id: String,
    },

    /// Install a package from a directory or its manifest.json
    Install {
        /// Package directory or manifest path
        path: PathBuf,
    },

    /// Uninstall a package
    Uninstall {
        /// Package id
        id: String,

        /// Uninstall even if the package is enabled
        #[arg(short, long)]
        force: bool,
    },

    /// Stop every package and initialize again from disk
    Reload,

    /// Print the packages directory, creating it if needed
    Dir,

    /// Run a package command by its fully-qualified id
    Exec {
        /// Command id, e.g. `word-count.count`
        command: String,
    },

    /// Keep enabled packages running and stream host events as JSON lines
    Run {
        /// JSON file describing the open document
        #[arg(long, value_name = "FILE")]
        document: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let paths = Paths { data_dir: cli.data_dir.clone(), config: cli.config.clone() };

    match cli.command {
        Commands::List { format } => cmd_list(&paths, format)?,
        Commands::Enable { id } => cmd_enable(&paths, &id)?,
        Commands::Disable { id } => cmd_disable(&paths, &id)?,
        Commands::Install { path } => cmd_install(&paths, &path)?,
        Commands::Uninstall { id, force } => cmd_uninstall(&paths, &id, force)?,
        Commands::Reload => cmd_reload(&paths)?,
        Commands::Dir => cmd_dir(&paths)?,
        Commands::Exec { command } => cmd_exec(&paths, &command)?,
        Commands::Run { document } => cmd_run(&paths, document.as_deref())?,
        Commands::Config { path } => cmd_config(&paths, path)?,
        Commands::Completions { shell } => cmd_completions(shell),
    }

    Ok(())
}

/// Location overrides from global flags.
struct Paths {
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
}

/// Build a coordinator from configuration.
fn open_coordinator(
    paths: &Paths,
    notifier: Arc<dyn HostNotifier>,
) -> Result<LifecycleCoordinator> {
    let config = Config::load_or_default(paths.config.as_deref())?;
    let data_dir = config.data_dir(paths.data_dir.as_deref())?;
    let options = config.runtime_options(&data_dir);
    tracing::debug!(
        data_dir = %data_dir.display(),
        packages = %options.packages_dir.display(),
        "Opening package runtime"
    );

    Ok(LifecycleCoordinator::open(options, notifier)?)
}

fn state_icon(state: PackageState) -> &'static str {
    match state {
        PackageState::Enabled => "✓",
        PackageState::Disabled => "○",
        PackageState::Installed => "·",
        PackageState::Error => "✗",
    }
}

fn print_package(package: &PackageSummary) {
    println!(
        "  {} {} v{} [{}]",
        state_icon(package.state),
        package.id,
        package.version,
        package.state
    );
    if !package.description.is_empty() {
        println!("      {}", package.description);
    }
    if let Some(ref err) = package.error {
        println!("      Error: {}", err);
    }
}

/// Error text recorded on a package, for failure messages.
fn package_error(coordinator: &LifecycleCoordinator, id: &str) -> String {
    coordinator
        .get(id)
        .and_then(|p| p.error.clone())
        .unwrap_or_else(|| "see log for details".to_string())
}

/// List installed packages.
fn cmd_list(paths: &Paths, format: OutputFormat) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;
        let packages = coordinator.list_packages();
        coordinator.shutdown().await;

        match format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(&packages)?;
                println!("{json}");
            }
            OutputFormat::Text => {
                if packages.is_empty() {
                    println!("No packages installed.");
                    println!("\nInstall packages with:");
                    println!("  folio install ./my-package");
                    println!("\nPackages directory: {}", coordinator.packages_dir().display());
                } else {
                    println!("Installed packages:\n");
                    for package in &packages {
                        print_package(package);
                    }
                    println!("\nTotal: {} package(s)", packages.len());
                }
            }
        }

        Ok(())
    })
}

/// Enable a package.
fn cmd_enable(paths: &Paths, id: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;

        let activated = coordinator.activate(id).await;
        let error = package_error(&coordinator, id);
        coordinator.shutdown().await;

        if !activated {
            anyhow::bail!("Failed to enable '{id}': {error}");
        }
        println!("✓ Enabled {id}");
        Ok(())
    })
}

/// Disable a package.
fn cmd_disable(paths: &Paths, id: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;

        let Some(state) = coordinator.get(id).map(|p| p.state) else {
            anyhow::bail!("Package '{id}' is not installed");
        };

        if state != PackageState::Enabled {
            // A package that failed to start stays in the enabled-set until
            // the user disables it explicitly.
            let remembered = coordinator.settings().is_enabled(id);
            if remembered {
                coordinator.settings().disable(id)?;
            }
            coordinator.shutdown().await;

            if remembered {
                println!("○ Disabled {id} (it was not running: {state})");
            } else {
                println!("· {id} is not enabled, nothing to do");
            }
            return Ok(());
        }

        let deactivated = coordinator.deactivate(id).await;
        coordinator.shutdown().await;

        if !deactivated {
            anyhow::bail!("Failed to disable '{id}'");
        }
        println!("○ Disabled {id}");
        Ok(())
    })
}

/// Install a package.
fn cmd_install(paths: &Paths, source: &Path) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;

        let Some(package) = coordinator.install(source).await else {
            anyhow::bail!("Failed to install package from {}", source.display());
        };
        let summary = package.summary();
        coordinator.shutdown().await;

        println!("Installed {} v{} to {}", summary.id, summary.version, package.path.display());
        if let Some(err) = summary.error {
            println!("  Warning: package is in error state: {err}");
        } else {
            println!("\nEnable it with:");
            println!("  folio enable {}", summary.id);
        }
        Ok(())
    })
}

/// Uninstall a package.
fn cmd_uninstall(paths: &Paths, id: &str, force: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;

        let Some(package) = coordinator.get(id) else {
            anyhow::bail!("Package '{id}' is not installed");
        };

        if package.state == PackageState::Enabled && !force {
            coordinator.shutdown().await;
            anyhow::bail!("Package '{id}' is enabled. Disable it first or pass --force");
        }

        let removed = coordinator.uninstall(id).await;
        coordinator.shutdown().await;

        if !removed {
            anyhow::bail!("Failed to uninstall '{id}'");
        }
        println!("Uninstalled {id}");
        Ok(())
    })
}

/// Reload every package from disk.
fn cmd_reload(paths: &Paths) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;
        coordinator.reload().await;

        let packages = coordinator.list_packages();
        coordinator.shutdown().await;

        let enabled = packages.iter().filter(|p| p.state == PackageState::Enabled).count();
        let errors = packages.iter().filter(|p| p.state == PackageState::Error).count();
        println!("Reloaded {} package(s): {enabled} enabled, {errors} with errors", packages.len());
        Ok(())
    })
}

/// Print the packages directory.
fn cmd_dir(paths: &Paths) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        let dir = coordinator
            .open_packages_directory()
            .ok_or_else(|| anyhow::anyhow!("Could not create the packages directory"))?;
        println!("{}", dir.display());
        Ok(())
    })
}

/// Run a single package command.
fn cmd_exec(paths: &Paths, command: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut coordinator = open_coordinator(paths, Arc::new(LogNotifier))?;
        coordinator.initialize_packages().await;

        let ran = coordinator.execute_command(command).await;
        coordinator.shutdown().await;

        if !ran {
            anyhow::bail!("Command '{command}' was not found or failed");
        }
        Ok(())
    })
}

/// Keep packages running until Ctrl-C, printing host events.
fn cmd_run(paths: &Paths, document: Option<&Path>) -> Result<()> {
    let document: Option<DocumentInfo> = match document {
        Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let (notifier, mut events) = ChannelNotifier::channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });

        let mut coordinator = open_coordinator(paths, Arc::new(notifier))?;
        coordinator.initialize_packages().await;
        if document.is_some() {
            coordinator.set_current_document(document).await;
        }

        eprintln!("Packages running. Press Ctrl-C to stop.");
        let mut reap = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                _ = reap.tick() => {
                    coordinator.reap_faults();
                }
            }
        }

        coordinator.shutdown().await;
        drop(coordinator);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
        Ok(())
    })
}

fn print_event(event: &HostEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Could not serialize host event"),
    }
}

/// Show configuration.
fn cmd_config(paths: &Paths, show_path: bool) -> Result<()> {
    if show_path {
        match paths.config.clone().or_else(Config::config_path) {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine config directory"),
        }
        return Ok(());
    }

    let config = Config::load_or_default(paths.config.as_deref())?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "folio", &mut io::stdout());
}
