//! Command-line Knights server.

mod broadcast;
mod config;
mod net;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use knights_engine::{ArenaFactory, GameConfig, Manifest};
use knights_resource::ResourceDir;
use knights_server::{ConfigLoader, KnightsServer, ServerParams};
use knights_session::{SystemClock, WorkerMode};

use crate::config::Config;

const DEFAULT_CONFIG_FILE: &str = "knights_config.txt";

/// Location of the asset/menu manifest within the data directory.
const MANIFEST_RESOURCE: &str = "manifest.json";

fn print_usage(program: &str) {
    println!(
        "Knights server (protocol version {})",
        knights_protocol::PROTOCOL_VERSION
    );
    println!("Usage: {program} [-c config_file_name]");
    println!("Default config file name (if -c is not given) is '{DEFAULT_CONFIG_FILE}'.");
}

fn parse_args() -> Result<String, ()> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "knightsd".to_owned());
    let mut config_filename = DEFAULT_CONFIG_FILE.to_owned();

    while let Some(opt) = args.next() {
        match opt.as_str() {
            "-c" => match args.next() {
                Some(value) => config_filename = value,
                None => {
                    print_usage(&program);
                    return Err(());
                }
            },
            _ => {
                print_usage(&program);
                return Err(());
            }
        }
    }
    Ok(config_filename)
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_file {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(file)
                        .with_ansi(false)
                        .init();
                }
                Err(err) => {
                    eprintln!("Failed to open log file {path}: {err}. Exiting.");
                    std::process::exit(1);
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn read_optional_file(path: &Option<String>) -> Option<String> {
    let path = path.as_deref()?;
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(err) => {
            eprintln!("Problem reading file {path}: {err}. Exiting.");
            std::process::exit(1);
        }
    }
}

fn main() -> ExitCode {
    let Ok(config_filename) = parse_args() else {
        return ExitCode::FAILURE;
    };

    let config_text = match std::fs::read_to_string(&config_filename) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Failed to open config file {config_filename}: {err}. Exiting.");
            return ExitCode::FAILURE;
        }
    };
    let config = match Config::parse(&config_text) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{config_filename}: {err}. Exiting.");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    let data_dir = ResourceDir::new(
        config
            .knights_data_dir
            .clone()
            .unwrap_or_else(|| "knights_data".to_owned()),
    );
    info!(dir = %data_dir.base().display(), "loading data files");

    // Asset tables and the quest menu come from the data manifest; with
    // no data directory installed the built-in arena set is used.
    let manifest = match data_dir.read(MANIFEST_RESOURCE) {
        Ok(bytes) => match Manifest::from_json(&bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                eprintln!("Bad manifest {MANIFEST_RESOURCE}: {err}. Exiting.");
                return ExitCode::FAILURE;
            }
        },
        Err(_) => {
            info!("no manifest found; using built-in configuration");
            Manifest::builtin()
        }
    };
    let manifest = Arc::new(manifest);

    let motd = read_optional_file(&config.motd_file);
    let old_motd = read_optional_file(&config.old_motd_file);

    let server = KnightsServer::new(ServerParams {
        clock: Arc::new(SystemClock::new()),
        worker_mode: WorkerMode::Threaded,
        allow_split_screen: false,
        motd,
        old_motd,
        password: config.password.clone(),
        rng_seed: rand::rng().random(),
    });

    let loader_manifest = Arc::clone(&manifest);
    let loader = ConfigLoader::spawn(move || {
        Ok(GameConfig::new(
            Arc::clone(&loader_manifest),
            Arc::new(ArenaFactory),
        ))
    });

    let quit = Arc::new(AtomicBool::new(false));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}. Exiting.");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = knights_protocol::PROTOCOL_VERSION,
        "Knights server starting"
    );
    let result = runtime.block_on(net::run(server, config, loader, Arc::clone(&quit)));
    quit.store(true, Ordering::Relaxed);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Fatal error: {err}. Exiting.");
            ExitCode::FAILURE
        }
    }
}
