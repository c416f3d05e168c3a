//! conductor CLI - test run orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use conductor::config::{self, Config};
use conductor::executor::{CommandSuiteRunner, OutputCallback, OutputLine};
use conductor::layout::LatestLayout;
use conductor::modules::{ALL_MODULES, discover_modules, select_modules};
use conductor::orchestrator::{Orchestrator, RunOptions};
use conductor::report::print_summary;
use conductor::supervisor::Supervisor;

const DEFAULT_CONFIG: &str = "conductor.toml";

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Runs test modules with failure reruns, merged results and managed devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test modules
    Run {
        /// Modules to run, or `all`
        #[arg(short = 'm', long = "module", num_args = 1.., default_value = ALL_MODULES)]
        modules: Vec<String>,

        /// Override the number of failures-only reruns
        #[arg(long)]
        retry_times: Option<usize>,

        /// Run once with the runner's debug arguments
        #[arg(long)]
        debug: bool,

        /// Run once and stop at the first failing test
        #[arg(long)]
        stop_on_failure: bool,

        /// Override the device to run device modules on
        #[arg(long)]
        device_name: Option<String>,

        /// Override the bridge server base port
        #[arg(long)]
        bridge_port: Option<u16>,

        /// Serve the generated report until Ctrl-C
        #[arg(long)]
        open_report: bool,
    },

    /// List discovered test modules
    Modules,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

/// Command-line overrides for a run.
struct RunArgs {
    modules: Vec<String>,
    retry_times: Option<usize>,
    device_name: Option<String>,
    bridge_port: Option<u16>,
    options: RunOptions,
    open_report: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(retry_times) = self.retry_times {
            config.conductor.retry_times = retry_times;
        }
        if let Some(device_name) = &self.device_name {
            config.conductor.device_name = Some(device_name.clone());
        }
        if let Some(port) = self.bridge_port {
            config.bridge.base_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            modules,
            retry_times,
            debug,
            stop_on_failure,
            device_name,
            bridge_port,
            open_report,
        } => {
            let args = RunArgs {
                modules,
                retry_times,
                device_name,
                bridge_port,
                options: RunOptions {
                    debug,
                    stop_on_failure,
                },
                open_report,
            };
            let code = run_modules(&cli.config, args).await?;
            std::process::exit(code);
        }
        Commands::Modules => list_modules(&cli.config),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

async fn run_modules(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    args.apply(&mut config);
    info!("Loaded configuration from {}", config_path.display());

    let discovered = discover_modules(&config.conductor.test_root)?;
    let modules = select_modules(&discovered, &args.modules);
    info!(
        "Selected modules: [{}]",
        modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current step");
                cancel.cancel();
            }
        });
    }

    let callback: OutputCallback = Arc::new(|module, line| match line {
        OutputLine::Stdout(s) => println!("[{}] {}", module, s),
        OutputLine::Stderr(s) => eprintln!("[{}] {}", module, s),
    });

    let supervisor = Supervisor::from_config(&config);
    let runner = CommandSuiteRunner::new(supervisor.control(), config.runner.clone())
        .with_modes(args.options.debug, args.options.stop_on_failure)
        .with_output_callback(callback);

    let mut orchestrator = Orchestrator::new(config, supervisor, runner).with_cancellation(cancel.clone());
    let summary = orchestrator.run(&modules, args.options).await?;
    print_summary(&summary);

    if args.open_report {
        match orchestrator.generator() {
            Some(generator) => {
                let latest = LatestLayout {
                    dir: summary.latest_dir.clone(),
                };
                let mut viewer = generator
                    .open(&latest.generated_report_dir())
                    .context("Failed to open the generated report")?;
                info!("Serving report, press Ctrl-C to stop");
                cancel.cancelled().await;
                viewer.teardown(orchestrator.supervisor().grace_period()).await;
            }
            None => warn!("Report generation is disabled, nothing to open"),
        }
    }

    Ok(summary.exit_code(args.options.stop_on_failure))
}

fn list_modules(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let modules = discover_modules(&config.conductor.test_root)?;

    println!(
        "Discovered {} modules in {}:",
        modules.len(),
        config.conductor.test_root.display()
    );
    for module in &modules {
        let device = if config
            .conductor
            .device_modules
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&module.name))
        {
            " [device]"
        } else {
            ""
        };
        println!("  {}{}", module.name, device);
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Test root: {}", config.conductor.test_root.display());
            println!("  Log root: {}", config.conductor.log_root.display());
            println!("  Retry times: {}", config.conductor.retry_times);
            println!(
                "  Device: {}",
                config.conductor.device_name.as_deref().unwrap_or("(none)")
            );
            println!("  Device modules: {}", config.conductor.device_modules.join(", "));
            println!("  Runner: {}", config.runner.command);
            println!("  Result format: {:?}", config.runner.junit_format);
            println!(
                "  Bridge: {}:{} (ports {:?})",
                config.bridge.host,
                config.bridge.base_port,
                config.bridge.port_layout().assign(config.bridge.base_port).ports()
            );
            if config.report.enabled {
                println!("  Report generator: {}", config.report.generator);
            } else {
                println!("  Report generator: disabled");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# conductor configuration file

[conductor]
test_root = "test_cases"
log_root = "logs"
retry_times = 1
# device_name = "Pixel_7_API_34"
device_modules = ["mobile"]

[runner]
command = "pytest {suite} --junitxml={output}"
rerun_command = "pytest {failed} --junitxml={output}"
junit_format = "pytest"
debug_args = ["-vv", "--log-cli-level=DEBUG"]
stop_on_failure_args = ["-x"]

[bridge]
base_port = 4723
command = "appium --port {port}"

[report]
generator = "allure"
enabled = true
"#;

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit manually.", DEFAULT_CONFIG);
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created {}", DEFAULT_CONFIG);
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  conductor run");

    Ok(())
}
