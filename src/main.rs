use anyhow::{anyhow, Context, Result};
use clap::Parser;
use clash6test::{
    proxy::discovery::{DEFAULT_CORE_DIR, DEFAULT_CORE_PREFIX},
    proxy::models::display_name,
    tui::{address_cell, ProbeApp, Summary},
    Config, CoreLauncher, HttpEcho, InstancePool, LaunchSettings, ProbeConfig, ProbeResult,
    ProbeRunner, ProfileBuilder, ProfileCatalog, ResultSink,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Test every node of a Clash profile for IPv4 and IPv6 connectivity
#[derive(Parser)]
#[command(name = "clash6test", version)]
#[command(about = "Test every node of a Clash profile for IPv4 and IPv6 connectivity")]
struct Cli {
    /// Clash profile to read nodes from
    source: Option<PathBuf>,

    /// Use a named profile from the profiles directory instead of a path
    #[arg(short, long, conflicts_with = "source")]
    profile: Option<String>,

    /// Profiles directory holding list.yml [default: ~/.config/clash/profiles]
    #[arg(long)]
    profiles_dir: Option<PathBuf>,

    /// Directory containing the proxy-core executable
    #[arg(long, default_value = DEFAULT_CORE_DIR)]
    core_dir: PathBuf,

    /// File name prefix of the proxy-core executable
    #[arg(long, default_value = DEFAULT_CORE_PREFIX)]
    core_prefix: String,

    /// Number of proxy-core instances run side by side
    #[arg(short = 'n', long, default_value = "10")]
    instances: usize,

    /// Timeout in seconds for each echo request
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Timeout in seconds for a proxy core to become ready
    #[arg(long, default_value = "5")]
    startup_timeout: u64,

    /// Delay in milliseconds between starting consecutive node tests
    #[arg(long, default_value = "200")]
    stagger_ms: u64,

    /// Print results line by line instead of the interactive view
    #[arg(long)]
    plain: bool,

    /// Write all results as JSON to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Only list the nodes known to the proxy core
    #[arg(long)]
    list_nodes: bool,

    /// Write logs to this file while the interactive view is shown
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Config {
        Config::new()
            .with_capacity(self.instances)
            .with_stagger(Duration::from_millis(self.stagger_ms))
            .with_launch(
                LaunchSettings::new().with_startup_timeout(Duration::from_secs(self.startup_timeout)),
            )
            .with_probe(ProbeConfig::new().with_timeout(Duration::from_secs(self.timeout)))
    }

    fn interactive(&self) -> bool {
        !self.plain && !self.list_nodes
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let source = resolve_source(&cli)?;
    let profiles = ProfileBuilder::from_source(&source)
        .with_context(|| format!("failed to load nodes from {}", source.display()))?;
    let nodes = profiles.node_names();
    info!(source = %source.display(), nodes = nodes.len(), "profile loaded");

    let executable = clash6test::locate_executable(&cli.core_dir, &cli.core_prefix)
        .await
        .context("failed to locate the proxy core")?;
    info!(executable = %executable.display(), "proxy core found");

    let config = cli.config();
    let launcher = CoreLauncher::new(executable, profiles).with_settings(config.launch.clone());
    let pool = Arc::new(InstancePool::new(launcher, config.capacity));

    let outcome = run(&cli, &config, Arc::clone(&pool), nodes).await;
    pool.shutdown_all();
    outcome
}

async fn run(cli: &Cli, config: &Config, pool: Arc<InstancePool>, nodes: Vec<String>) -> Result<()> {
    if cli.list_nodes {
        for node in pool.list_nodes().await.context("failed to list nodes")? {
            println!("{}", node);
        }
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No nodes to test.");
        return Ok(());
    }

    let echo = HttpEcho::with_config(config.probe.clone());
    let runner = ProbeRunner::new(pool, echo).with_stagger(config.stagger);
    let rx = runner.run_stream(nodes.clone());

    let results = if cli.interactive() {
        ProbeApp::new(nodes).run(rx).await?
    } else {
        print_plain(nodes, rx).await
    };

    let summary = Summary::from_results(&results);
    println!("{}", summary);

    if let Some(path) = &cli.json {
        write_json(path, &results)?;
        println!("Saved {} results to {:?}", results.len(), path);
    }

    Ok(())
}

/// Print rows in node order as soon as they are ready
async fn print_plain(
    nodes: Vec<String>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ProbeResult>,
) -> Vec<ProbeResult> {
    let width = nodes
        .iter()
        .map(|n| display_name(n).chars().count())
        .max()
        .unwrap_or(0);
    let mut sink = ResultSink::new(nodes);
    let mut results = Vec::new();

    while let Some(result) = rx.recv().await {
        sink.push(result);
        for row in sink.drain_ready() {
            println!(
                "{:>width$}  {:<42}  {}",
                display_name(&row.node),
                address_cell(row.ipv4.as_deref()),
                address_cell(row.ipv6.as_deref()),
                width = width
            );
            results.push(row);
        }
    }

    results
}

fn resolve_source(cli: &Cli) -> Result<PathBuf> {
    if let Some(source) = &cli.source {
        return Ok(source.clone());
    }

    let dir = match &cli.profiles_dir {
        Some(dir) => dir.clone(),
        None => ProfileCatalog::default_dir()
            .ok_or_else(|| anyhow!("no home directory; pass a profile path instead"))?,
    };
    let catalog = ProfileCatalog::load(&dir)?;

    match &cli.profile {
        Some(name) => Ok(catalog.resolve(name)?),
        None => Err(anyhow!(
            "no profile given; pass a path or --profile with one of: {}",
            catalog.names().join(", ")
        )),
    }
}

fn write_json(path: &Path, results: &[ProbeResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(file, results)
        .with_context(|| format!("failed to write results to {:?}", path))?;
    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if !cli.interactive() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        return Ok(());
    }

    // The interactive view owns the terminal; logs only go to a file
    if let Some(path) = &cli.log_file {
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .compact()
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["clash6test", "profile.yml"]);
        assert_eq!(cli.source, Some(PathBuf::from("profile.yml")));
        assert_eq!(cli.core_dir, PathBuf::from("lib"));
        assert_eq!(cli.core_prefix, "clash");
        assert!(cli.interactive());

        let config = cli.config();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.stagger, Duration::from_millis(200));
        assert_eq!(config.probe.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_cli_profile_conflicts_with_source() {
        assert!(Cli::try_parse_from(["clash6test", "a.yml", "--profile", "b"]).is_err());
    }

    #[test]
    fn test_resolve_source_lists_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("list.yml"),
            "files:\n  - name: Home\n    time: '1.yml'\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "clash6test",
            "--profiles-dir",
            dir.path().to_str().unwrap(),
        ]);
        let err = resolve_source(&cli).unwrap_err();
        assert!(err.to_string().contains("Home"));

        let cli = Cli::parse_from([
            "clash6test",
            "--profiles-dir",
            dir.path().to_str().unwrap(),
            "-p",
            "Home",
        ]);
        assert_eq!(resolve_source(&cli).unwrap(), dir.path().join("1.yml"));
    }
}
