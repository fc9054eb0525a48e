/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core functionality module
//!
//! Provides essential infrastructure including:
//! - Command-line argument parsing
//! - Logging system setup with custom formatters
//! - DNS request context management and status machine
//! - Admission controllers shared by server plugins

use crate::config::types::LogConfig;
use crate::core::log::SteerDnsLogFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub mod concurrent_map;
pub mod context;
pub mod dns_utils;
pub mod error;
pub mod handler;
pub mod limiter;

mod log;
mod runtime;

/// Parse command-line options.
pub fn init() -> Runtime {
    Runtime {
        options: Options::parse(),
    }
}

/// Initialize the logging system with console and optional file output
///
/// Both outputs use the custom SteerDnsLogFormatter for consistent
/// formatting. Returns a WorkerGuard that must be kept alive to ensure log
/// flushing.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let (file_writer, guard) = if let Some(ref file_path) = log.file {
        let file_appender = tracing_appender::rolling::never(
            std::path::Path::new(&file_path).parent().unwrap(),
            std::path::Path::new(&file_path).file_name().unwrap(),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = fmt::layer()
        .event_format(SteerDnsLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(SteerDnsLogFormatter)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log.level);
        EnvFilter::new("info")
    });

    let subscriber = Registry::default().with(filter).with(console_layer);

    if let Some(file_layer) = file_layer {
        subscriber.with(file_layer).init();
    } else {
        subscriber.init();
    };

    guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1)
}
