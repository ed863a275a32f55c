//! EVerest test harness CLI
//!
//! - `list` - List the built-in scenarios
//! - `run` - Run one scenario
//! - `suite` - Run every scenario and write a JUnit report
//! - `csms` - Run only the mock CSMS until Ctrl-C

use clap::{Parser, Subcommand};
use evt_core::MqttSettings;
use evt_harness::{get_scenario, list_scenarios, run_suite, HarnessConfig, ScenarioRunner};
use evt_ocpp::{CsmsConfig, CsmsMock, OcppVersion};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "evt-harness")]
#[command(about = "OCPP integration-test harness for EVerest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Clone)]
struct EverestArgs {
    /// EVerest installation prefix
    #[arg(long, env = "EVEREST_PREFIX")]
    everest_prefix: Option<PathBuf>,

    /// EVerest config template, the SIL OCPP config of the installation by default
    #[arg(long)]
    template: Option<PathBuf>,

    /// OCPP station config: 1.6 JSON, 2.x component config directory or CSV
    #[arg(long)]
    ocpp_template: Option<PathBuf>,

    /// Certificate tree copied into the session
    #[arg(long)]
    certs: Option<PathBuf>,

    #[arg(long, env = "EVEREST_MQTT_HOST", default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, env = "EVEREST_MQTT_PORT", default_value = "1883")]
    mqtt_port: u16,

    /// Seconds to wait for EVerest and the probe to become ready
    #[arg(long, default_value = "30")]
    startup_timeout: u64,

    /// Seconds to wait for each expected OCPP message
    #[arg(long, default_value = "30")]
    assertion_timeout: u64,

    /// Keep the session directory for inspection
    #[arg(long)]
    keep_temp: bool,
}

impl EverestArgs {
    fn harness_config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::default()
            .with_mqtt(MqttSettings {
                host: self.mqtt_host.clone(),
                port: self.mqtt_port,
                ..Default::default()
            })
            .with_startup_timeout(Duration::from_secs(self.startup_timeout))
            .with_assertion_timeout(Duration::from_secs(self.assertion_timeout));
        if let Some(prefix) = &self.everest_prefix {
            config = config.with_everest_prefix(prefix);
        }
        if let Some(template) = &self.template {
            config = config.with_template(template);
        }
        if let Some(template) = &self.ocpp_template {
            config = config.with_ocpp_template(template);
        }
        if let Some(certs) = &self.certs {
            config = config.with_certs(certs);
        }
        if self.keep_temp {
            config = config.keep_temp_dirs();
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in scenarios
    List,

    /// Run a single scenario
    Run {
        /// Scenario to run
        #[arg(short, long)]
        scenario: String,

        #[command(flatten)]
        everest: EverestArgs,
    },

    /// Run the full scenario suite
    Suite {
        /// Output JUnit XML file
        #[arg(long)]
        junit_xml: Option<PathBuf>,

        #[command(flatten)]
        everest: EverestArgs,
    },

    /// Run the mock CSMS with its default handlers
    Csms {
        #[arg(short, long, default_value = "9000")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// OCPP version: 1.6, 2.0.1 or 2.1
        #[arg(long = "ocpp-version", default_value = "1.6")]
        version: OcppVersion,

        /// Only accept this charging station identity
        #[arg(long)]
        station_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::List => {
            for scenario in list_scenarios() {
                let kind = if scenario.is_live() { "live" } else { "self-contained" };
                println!(
                    "{:<32} OCPP {:<6} {:<15} {}",
                    scenario.name,
                    scenario.ocpp_version.to_string(),
                    kind,
                    scenario.description
                );
            }
        }

        Commands::Run { scenario, everest } => {
            let scenario = get_scenario(&scenario)?;
            let result = ScenarioRunner::new(everest.harness_config()).run(scenario).await;

            if result.skipped {
                println!("{} SKIPPED: {}", result.name, result.failure.unwrap_or_default());
            } else if result.passed {
                println!("{} PASSED ({:.1}s)", result.name, result.duration.as_secs_f64());
            } else {
                println!("{} FAILED: {}", result.name, result.failure.unwrap_or_default());
                for line in &result.history {
                    println!("  {}", line);
                }
                std::process::exit(1);
            }
        }

        Commands::Suite { junit_xml, everest } => {
            info!("Running full scenario suite");

            let results = run_suite(everest.harness_config()).await;

            // Print summary
            println!("\nScenario Suite Results:");
            println!("  Total: {}", results.total);
            println!("  Passed: {}", results.passed);
            println!("  Failed: {}", results.failed);
            println!("  Skipped: {}", results.skipped);

            if let Some(xml_path) = junit_xml {
                let xml = results.to_junit_xml();
                std::fs::write(&xml_path, xml)?;
                info!("JUnit XML written to: {}", xml_path.display());
            }

            if !results.success() {
                std::process::exit(1);
            }
        }

        Commands::Csms {
            port,
            bind,
            version,
            station_id,
        } => {
            let mut config = CsmsConfig::new(version).with_bind_addr(SocketAddr::new(bind, port));
            if let Some(station_id) = station_id {
                config = config.with_station_id(station_id);
            }
            let csms = CsmsMock::start(config).await?;
            println!("CSMS mock listening on {}", csms.url());

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            csms.stop().await;
        }
    }

    Ok(())
}
