use std::process;
use std::sync::Arc;

use gearhop::config::AppConfig;
use gearhop::housekeeping::Housekeeper;
use gearhop::logging::{LogLevel, Logger, LoggerConfig};
use gearhop::orchestrator::dispatcher::{Dispatcher, DispatcherConfig};
use gearhop::server::{Broker, TcpServer};
use gearhop::shutdown::ShutdownHooks;
use gearhop::storage::{QueueStore, StorageFacade};
use gearhop::wire::codec::WireCodec;
use serde_json::json;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_app_config(&app_config.logging).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let storage = Arc::new(
        StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
            eprintln!("storage initialization error: {error}");
            process::exit(2);
        }),
    );
    let store: Arc<dyn QueueStore> = storage.clone();

    let mut dispatcher = Dispatcher::new(
        DispatcherConfig::from(&app_config.broker),
        store,
        Arc::clone(&logger),
    );
    let restored = dispatcher.restore_from_store().unwrap_or_else(|error| {
        eprintln!("queue restore error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::orchestrator"),
        "Dispatcher ready",
        Some(json!({
            "handle_node": dispatcher.handle_node(),
            "restored_background_jobs": restored,
            "worker_wakeup": app_config.broker.worker_wakeup,
            "retention_ms": app_config.broker.retention_ms
        })),
    );

    let wire_codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    let server = TcpServer::from_app_config(&app_config, wire_codec, Arc::clone(&logger))
        .unwrap_or_else(|error| {
            eprintln!("server startup error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": server.local_addr().to_string(),
            "max_packet_size_bytes": wire_codec.max_packet_size_bytes(),
            "max_pending_write_bytes": app_config.wire.max_pending_write_bytes
        })),
    );

    let broker = Arc::new(Broker::new(dispatcher, Arc::clone(&logger)));

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut housekeeper = Housekeeper::new(
        Arc::clone(&broker),
        Arc::clone(&logger),
        &app_config.housekeeping,
    )
    .unwrap_or_else(|error| {
        eprintln!("housekeeping configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::housekeeping"),
        "Housekeeping initialized",
        Some(housekeeper.initial_metadata_payload()),
    );
    if let Err(error) = housekeeper.start() {
        eprintln!("housekeeping start error: {error}");
        process::exit(2);
    }

    server.serve(Arc::clone(&broker), shutdown_hooks.signal());

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, stopping housekeeping",
    );
    if let Err(error) = housekeeper.stop() {
        logger.warn(Some("main::shutdown"), &format!("{error}"));
    }
    if let Err(error) = storage.flush() {
        eprintln!("queue store flush error during shutdown: {error}");
        process::exit(2);
    }
    logger.info(Some("main::shutdown"), "Graceful shutdown completed");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: gearhop is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;136m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                               __
   ___ ____ ___ _ ____ / /  ___  ___
  / _ `/ -_) _ `/ __// _ \/ _ \/ _ \
  \_, /\__/\_,_/_/  /_//_/\___/ .__/
 /___/                       /_/      "#;
    const APP_DESCRIPTION: &str =
        "Job-queue broker coordinating clients and workers over the binary REQ/RES protocol.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GEARHOP_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
