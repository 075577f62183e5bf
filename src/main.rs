mod config;
mod dispatcher;
mod events;
mod logging;
mod pools;
mod producer;
mod queue;
mod reaper;
mod receiver;
mod self_debug;
mod server;
mod shutdown;
mod store;
mod utils;
mod wire;

use std::process;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use config::AppConfig;
use dispatcher::VariableServer;
use events::{
    COMMUNICATION_ERROR_EVENT, EventEmitter, SOCKET_ERROR_EVENT, VALUES_EVICTED_EVENT,
    VALUES_UPDATED_EVENT,
};
use logging::{LogLevel, Logger, LoggerConfig};
use self_debug::{SelfDebugError, SelfDebugReport};
use serde_json::json;
use shutdown::ShutdownHooks;
use utils::startup_banner::print_startup_banner;

const MAIN_LOOP_INTERVAL: Duration = Duration::from_millis(100);

type SelfDebugOutcome = Receiver<Result<SelfDebugReport, SelfDebugError>>;

fn main() {
    let (runtime_flags, config_args) =
        self_debug::extract_runtime_flags(std::env::args().skip(1).collect());
    let app_config = load_config_or_exit(config_args);
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));
    let emitter = Arc::new(EventEmitter::with_logger(Arc::clone(&logger)));
    register_log_listeners(&emitter, &logger);

    let server = VariableServer::bind(&app_config, Arc::clone(&logger), Arc::clone(&emitter))
        .unwrap_or_else(|error| {
            eprintln!("server startup error: {error}");
            process::exit(2);
        });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    print_startup_banner(Some(bound_addr));

    let mut running = server.start().unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for variable snapshots",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "receiver_timeout_ms": app_config.receiver.timeout_ms,
            "reaper_interval_ms": app_config.reaper.interval_ms,
            "evict_after_seconds": app_config.store.evict_after_seconds
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut self_debug = runtime_flags.enabled.then(|| {
        logger.info(Some("main::self_debug"), "Self debug mode enabled");
        self_debug::spawn_runner(running.local_addr(), running.reader())
    });
    let mut exit_code = 0;

    while !shutdown_hooks.is_requested() {
        if let Some(outcome) = self_debug.as_ref().and_then(poll_self_debug) {
            self_debug = None;
            if let Err(error) = outcome {
                logger.error(Some("main::self_debug"), &format!("Self debug failed: {error}"));
                exit_code = 1;
                shutdown_hooks.trigger().request();
                continue;
            }
        }
        thread::sleep(MAIN_LOOP_INTERVAL);
    }

    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown requested, stopping variable server",
        Some(json!({ "live_workers": running.live_workers() })),
    );
    let report = running.shutdown();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Variable server stopped",
        Some(json!({
            "aborted_workers": report.aborted_workers,
            "identities": running.reader().len()
        })),
    );

    if exit_code != 0 {
        process::exit(exit_code);
    }
}

fn load_config_or_exit(args: Vec<String>) -> AppConfig {
    match AppConfig::load_with_discovery(args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn poll_self_debug(
    outcome: &SelfDebugOutcome,
) -> Option<Result<SelfDebugReport, SelfDebugError>> {
    match outcome.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Disconnected) => Some(Err(SelfDebugError::RunnerExited)),
    }
}

/// Stands in for the UI subscriber: traces what it would redraw, off the
/// emitting thread.
fn register_log_listeners(emitter: &EventEmitter, logger: &Arc<Logger>) {
    if !logger.enabled(LogLevel::Verbose) {
        return;
    }

    for event_name in [VALUES_UPDATED_EVENT, VALUES_EVICTED_EVENT] {
        let logger = Arc::clone(logger);
        emitter.on_async(event_name, move |event| {
            let identity = event
                .identity()
                .ok_or_else(|| format!("'{}' event without identity", event.name))?;
            logger.log(
                LogLevel::Verbose,
                Some("main::events"),
                &format!("Redraw '{identity}' after '{}'", event.name),
                None,
            );
            Ok(())
        });
    }

    let communication_logger = Arc::clone(logger);
    emitter.on_async(COMMUNICATION_ERROR_EVENT, move |event| {
        let kind = event
            .communication_error()
            .ok_or_else(|| "communication error event without a known kind".to_owned())?;
        communication_logger.log(
            LogLevel::Verbose,
            Some("main::events"),
            &format!("Status bar shows {kind}"),
            event.payload,
        );
        Ok(())
    });

    let socket_logger = Arc::clone(logger);
    emitter.on_async(SOCKET_ERROR_EVENT, move |event| {
        socket_logger.log(
            LogLevel::Verbose,
            Some("main::events"),
            "Status bar shows socket error",
            event.payload,
        );
        Ok(())
    });
}
