mod catalog;
mod config;
mod connector;
mod dispatcher;
mod logging;
mod notifications;
mod renderer;
mod results;
mod scheduler;
mod self_debug;
mod server;
mod shutdown;
mod storage;
mod utils;
mod wire;
mod worker;

use std::path::PathBuf;
use std::process;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use catalog::{DirectoryCatalog, ReportCatalog};
use config::{resolve_data_sources, AppConfig, DataSourceRole};
use connector::{Broadcaster, ConnectorRegistry, SessionHandler, SocketTimeouts};
use dispatcher::SessionDispatcher;
use logging::{LogLevel, Logger, LoggerConfig};
use notifications::{FanOut, MailSender, NotificationStore, SpoolMailSender};
use renderer::{DocumentRenderer, Renderer};
use results::ResultStore;
use scheduler::{JobRunner, ReportExecutor, Scheduler};
use self_debug::RuntimeFlags;
use server::{Listener, TcpServer};
use shutdown::ShutdownHooks;
use storage::{expand_home_path, StorageFacade};
use utils::runtime::{ensure_posix_or_exit, exit_with};
use utils::startup_banner::print_startup_banner;
use wire::codec::WireCodec;
use worker::BackgroundWorker;

const MAIN_LOOP_POLL: Duration = Duration::from_millis(100);

fn main() {
    ensure_posix_or_exit();

    let (flags, config_args) = self_debug::extract_runtime_flags(std::env::args().skip(1).collect());
    print_startup_banner(flags.enabled);

    let mut app_config = AppConfig::load_with_discovery(config_args)
        .unwrap_or_else(|error| exit_with("configuration error", error));
    let scratch_root = flags.enabled.then(|| prepare_self_debug(&mut app_config));

    let outcome = run(&app_config, flags);

    if let Some(root) = scratch_root {
        if flags.keep_artifacts {
            println!("self-debug artifacts kept at {}", root.display());
        } else if let Err(error) = self_debug::cleanup_artifacts(&root) {
            eprintln!("failed to remove self-debug artifacts: {error}");
        }
    }
    if outcome == Some(false) {
        process::exit(1);
    }
}

fn prepare_self_debug(app_config: &mut AppConfig) -> PathBuf {
    let root = expand_home_path(&self_debug::resolve_storage_path(app_config))
        .unwrap_or_else(|error| exit_with("self-debug storage error", error));
    self_debug::cleanup_artifacts(&root)
        .and_then(|()| self_debug::prepare_config(app_config, &root))
        .unwrap_or_else(|error| exit_with("self-debug preparation error", error));
    app_config.server.host = "127.0.0.1".to_owned();
    app_config.server.port = 0;
    root
}

/// Runs the server until a shutdown signal arrives or the self-debug
/// scenario finishes. Returns the scenario outcome when one ran.
fn run(app_config: &AppConfig, flags: RuntimeFlags) -> Option<bool> {
    let logger_config = LoggerConfig::from_logging_config(&app_config.logging)
        .unwrap_or_else(|error| exit_with("configuration error", error));
    let logger = Arc::new(Logger::new(logger_config));

    let data_sources = resolve_data_sources(&app_config.datasources)
        .unwrap_or_else(|error| exit_with("configuration error", error));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Data source roles resolved",
        Some(data_sources.log_payload()),
    );

    let storage = Arc::new(
        StorageFacade::initialize(&app_config.storage, &logger)
            .unwrap_or_else(|error| exit_with("storage initialization error", error)),
    );

    let definitions_path = expand_home_path(&app_config.reports.definitions_path)
        .unwrap_or_else(|error| exit_with("report definitions path error", error));
    let directory_catalog = Arc::new(
        DirectoryCatalog::load(&definitions_path, &logger)
            .unwrap_or_else(|error| exit_with("report catalog error", error)),
    );
    let catalog: Arc<dyn ReportCatalog> = directory_catalog.clone();

    let renderer: Arc<dyn Renderer> = Arc::new(DocumentRenderer::new(
        data_sources.get(DataSourceRole::Reporting).clone(),
    ));
    let results = Arc::new(ResultStore::new(
        Arc::clone(&storage),
        Arc::clone(&renderer),
        Arc::clone(&logger),
    ));
    let notifications = Arc::new(NotificationStore::new(
        Arc::clone(&storage),
        Arc::clone(&logger),
    ));
    let spool_path = expand_home_path(&app_config.notifications.spool_path)
        .unwrap_or_else(|error| exit_with("notification spool path error", error));
    let sender: Arc<dyn MailSender> = Arc::new(
        SpoolMailSender::new(spool_path, app_config.notifications.sender_address.as_str())
            .unwrap_or_else(|error| exit_with("notification spool error", error)),
    );
    let fanout = Arc::new(FanOut::new(
        Arc::clone(&notifications),
        Arc::clone(&results),
        sender,
        Arc::clone(&logger),
    ));

    let codec = WireCodec::from_app_config(app_config);
    let registry = Arc::new(ConnectorRegistry::new(
        codec,
        SocketTimeouts::from_wire_config(&app_config.wire),
        Arc::clone(&logger),
    ));
    let broadcaster: Arc<dyn Broadcaster> = registry.clone();

    let executor: Arc<dyn JobRunner> = Arc::new(ReportExecutor::new(
        Arc::clone(&catalog),
        renderer,
        Arc::clone(&results),
        fanout,
        Arc::clone(&broadcaster),
        Arc::clone(&logger),
        app_config.reports.default_locale.as_str(),
    ));
    let scheduler = Arc::new(
        Scheduler::new(
            app_config.scheduler,
            Arc::clone(&storage),
            executor,
            Arc::clone(&logger),
        )
        .unwrap_or_else(|error| exit_with("scheduler initialization error", error)),
    );
    scheduler
        .start()
        .unwrap_or_else(|error| exit_with("scheduler startup error", error));

    let handler: Arc<dyn SessionHandler> = Arc::new(SessionDispatcher::new(
        catalog,
        Arc::clone(&scheduler),
        Arc::clone(&results),
        notifications,
        broadcaster,
        Arc::clone(&logger),
        app_config.reports.default_locale.as_str(),
    ));

    let server = TcpServer::bind(&app_config.server)
        .unwrap_or_else(|error| exit_with("server startup error", error));
    let listener = Listener::new(server, Arc::clone(&registry), handler, Arc::clone(&logger));
    let bound_addr = listener
        .local_addr()
        .unwrap_or_else(|error| exit_with("server startup error", error));
    listener
        .start()
        .unwrap_or_else(|error| exit_with("server startup error", error));
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "tls_enabled": app_config.server.tls_enabled,
            "max_message_size_bytes": codec.max_message_size_bytes(),
            "self_debug": flags.enabled,
        })),
    );

    let maintenance_results = Arc::clone(&results);
    let maintenance_storage = Arc::clone(&storage);
    let maintenance_logger = Arc::clone(&logger);
    let mut maintenance = BackgroundWorker::new(
        "maintenance",
        Duration::from_millis(app_config.maintenance.interval_ms),
        Arc::clone(&logger),
        move || {
            directory_catalog
                .redeploy(&maintenance_logger)
                .map_err(|error| error.to_string())?;
            maintenance_results
                .validate()
                .map_err(|error| error.to_string())?;
            maintenance_storage.flush().map_err(|error| error.to_string())
        },
    )
    .unwrap_or_else(|error| exit_with("maintenance worker error", error));
    maintenance
        .start()
        .unwrap_or_else(|error| exit_with("maintenance worker error", error));

    let shutdown_hooks =
        ShutdownHooks::install().unwrap_or_else(|error| exit_with("shutdown hooks error", error));
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let scenario = flags
        .enabled
        .then(|| self_debug::spawn_runner(bound_addr, codec));
    let mut outcome = None;
    shutdown_hooks.wait(MAIN_LOOP_POLL, || match &scenario {
        None => true,
        Some(receiver) => match receiver.try_recv() {
            Ok(result) => {
                outcome = Some(result.is_ok());
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Disconnected) => {
                outcome = Some(false);
                false
            }
        },
    });

    logger.info(
        Some("main::shutdown"),
        "Shutdown requested, stopping components",
    );
    if let Err(error) = listener.stop() {
        logger.warn(Some("main::shutdown"), &format!("listener stop failed: {error}"));
    }
    if let Err(error) = scheduler.stop() {
        logger.warn(Some("main::shutdown"), &format!("scheduler stop failed: {error}"));
    }
    if let Err(error) = maintenance.stop() {
        logger.warn(Some("main::shutdown"), &format!("maintenance stop failed: {error}"));
    }
    registry.shutdown();
    if let Err(error) = storage.flush() {
        logger.error(Some("main::shutdown"), &format!("final storage flush failed: {error}"));
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!({ "self_debug_passed": outcome })),
    );
    outcome
}
