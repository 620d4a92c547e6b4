//! iMAC2 monitor CLI
//!
//! Connects to a remote tripping station over the serial and ethernet
//! interfaces named in its configuration file, polls it continuously and
//! prints every module data event to the console until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use imac2_lib::{
    config::{Communication, CommunicationConfig, DaemonConfig},
    events::{Event, EventBus},
    modbus::ModbusTransport,
    rts::{PollExit, Rts},
    schedule::Schedule,
    transport::Transport,
};
use log::*;
use std::{panic, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

async fn connect(comm: Communication, timeout: Duration) -> imac2_lib::Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = Arc::new(ModbusTransport::connect(&comm, timeout).await?);
    Ok(transport)
}

fn print_event(event: &Event) {
    let timestamp = humantime::format_rfc3339_millis(event.timestamp);
    for (dev_id, values) in &event.data {
        let fields = values
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{timestamp} {dev_id} {fields}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "imacmon started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let mut config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("Cannot load config file {:?}", args.config))?;
    if let Some(interval) = args.poll_interval {
        config.poll.interval = interval;
    }

    let events = EventBus::new();
    let mut receiver = events.subscribe();
    let rts = Arc::new(
        Rts::new(events, Schedule::new(), &config.poll)
            .with_settings(config.module.clone())
            .with_collect(config.collect_periods()),
    );

    rts.apply_roll_call(&config.rts.roll_call())
        .await
        .with_context(|| format!("Cannot identify RTS {}", config.rts.dev_id))?;

    let io_timeout = config.poll.io_timeout;
    let interfaces = rts
        .reconfigure(&CommunicationConfig::default(), &config.communication, |comm| {
            connect(comm, io_timeout)
        })
        .await;
    debug!("Configured interfaces: {interfaces:?}");

    let missing = rts.find_missing_starting_data(&config.rts.address_schema).await;
    debug!("Fetched {} starting values", missing.len());

    let stop = CancellationToken::new();
    let poller = tokio::spawn({
        let rts = rts.clone();
        let stop = stop.clone();
        async move { rts.run_poll(stop.clone(), stop.child_token()).await }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            result = &mut ctrl_c => {
                result.with_context(|| "Cannot listen for Ctrl-C")?;
                info!("Ctrl-C received, stopping");
                stop.cancel();
                break;
            }
        }
    }

    match poller.await.with_context(|| "Poll task failed")? {
        PollExit::Stopped => info!("Polling stopped"),
        PollExit::Unexpected => warn!("Polling ended without stop signal"),
    }
    Ok(())
}
