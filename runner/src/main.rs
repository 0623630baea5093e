use clap::{Args, Parser, Subcommand};
use funz_runner::{
    config::{ConfigErrors, RunConfig},
    daemon::{Daemon, DaemonConfig},
    design::{run_design, FixedDesign},
    resolve::{SearchPath, ToolResolver},
};
use indexmap::IndexMap;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::{OptionExt, ResultExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dispatch parameterized cases over local, remote and discovered calculators")]
struct Cli {
    /// log debug messages, RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every case of a configuration and print the combined results
    Run {
        config: PathBuf,
    },
    /// Offer codes to other hosts and run the jobs they submit
    Daemon(DaemonArgs),
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// `name=command`, the command runs inside the job directory
    #[arg(long = "code", value_parser = parse_code, required = true)]
    codes: Vec<(String, String)>,
    #[arg(long, default_value_t = 19001)]
    udp_port: u16,
    /// 0 picks a free port
    #[arg(long, default_value_t = 0)]
    tcp_port: u16,
    #[arg(long, default_value = "funz-jobs")]
    work_root: PathBuf,
    #[arg(long, default_value_t = 1)]
    capacity: usize,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

fn parse_code(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, command)) if !name.is_empty() && !command.is_empty() => {
            Ok((name.to_string(), command.to_string()))
        }
        _ => Err(format!("expected name=command, got '{value}'")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run { config } => match run(config) {
            Ok(code) => code,
            Err(error) => {
                error!("{error}");
                ExitCode::from(1)
            }
        },
        Commands::Daemon(args) => {
            daemon(args);
            ExitCode::SUCCESS
        }
    }
}

fn run(path: PathBuf) -> Result<ExitCode, ConfigErrors> {
    let config = RunConfig::load(&path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight);
    }

    let resolver: Arc<dyn ToolResolver> = Arc::new(SearchPath::default());
    let renderer = Arc::new(config.renderer()?);
    let dispatcher = config.dispatcher(renderer, resolver)?;
    let design = FixedDesign::new(config.design.assignments());

    let result = match run_design(&design, &dispatcher, 1) {
        Ok(result) => result,
        Err(error) => {
            error!("Run aborted: {error}");
            return Ok(ExitCode::from(2));
        }
    };

    if let Err(error) = result.report.write(dispatcher.store().root()) {
        error!("Failed to write report: {error}");
    }

    print!("{}", result.report.table());
    println!("{}", result.report.summary());
    if !result.analysis.is_empty() {
        println!("{}", result.analysis);
    }

    Ok(ExitCode::SUCCESS)
}

fn daemon(args: DaemonArgs) {
    let shell = SearchPath::default()
        .resolve("sh")
        .expect_or_log("A POSIX shell is required to run jobs");
    let codes: IndexMap<String, String> = args.codes.into_iter().collect();

    let mut config = DaemonConfig::new(codes, shell, args.work_root);
    config.capacity = args.capacity.max(1);
    config.udp_port = args.udp_port;
    config.tcp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.tcp_port);
    config.interval = Duration::from_millis(args.interval_ms.max(1));

    let daemon = Daemon::start(config).unwrap_or_log();
    info!(address = %daemon.address(), "Daemon ready");

    daemon.wait();
}
