mod cgi;
mod config;
mod conn;
mod handlers;
mod log;
mod request;
mod response;
mod router;
mod server;
mod signals;

use std::fs::OpenOptions;
use std::io::BufWriter;

use anyhow::{Context, Result};

use crate::log::{Level, LogSink, Logger};
use crate::server::HttpServer;

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [config_path] [flags]\n\n\
        \tWithout a config_path, {} is used.\n\n\
        flags:\t--log filename (default: stdout)\n\
        \t\tAppend the diagnostic log to the specified file.\n\n\
        \t--syslog\n\
        \t\tUse syslog for the diagnostic log.\n\n\
        \t--debug\n\
        \t\tLog at debug verbosity.\n\n",
        argv0,
        config::DEFAULT_CONFIG_PATH,
    );
}

struct Options {
    config_path: Option<String>,
    sink: LogSink,
    level: Level,
}

fn parse_commandline() -> Result<Options> {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let mut options = Options {
        config_path: None,
        sink: LogSink::Stdout,
        level: Level::Info,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" => {
                usage(&argv0);
                std::process::exit(0);
            }
            "--log" => {
                let filename = args.next().context("missing filename after --log")?;
                options.sink = LogSink::File(BufWriter::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .with_context(|| format!("failed to open log file {}", filename))?,
                ));
            }
            "--syslog" => options.sink = LogSink::Syslog,
            "--debug" => options.level = Level::Debug,
            flag if flag.starts_with("--") => abort!("unknown argument `{}'", flag),
            positional => {
                if options.config_path.is_some() {
                    abort!("unexpected argument `{}' (one config path only)", positional);
                }
                options.config_path = Some(positional.to_string());
            }
        }
    }
    Ok(options)
}

fn main() -> Result<()> {
    let options = parse_commandline()?;
    let mut logger = Logger::new(options.sink, options.level);

    let config_path = match options.config_path {
        Some(path) => path,
        None => {
            logger.warning(&format!(
                "no config file specified, using {}",
                config::DEFAULT_CONFIG_PATH
            ));
            config::DEFAULT_CONFIG_PATH.to_string()
        }
    };

    let config = config::load(&config_path)?;

    signals::install()?;

    let mut server = HttpServer::bind(config, logger)?;
    server.run()?;

    println!("{}: clean shutdown", env!("CARGO_PKG_NAME"));
    Ok(())
}
