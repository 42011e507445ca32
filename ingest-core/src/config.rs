//! process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// Default size of the channel between the subscription workers and the
    /// pipeline. Once it is full, workers stop pulling deliveries
    pub const DEFAULT_CHANNEL_SIZE: usize = 1_000;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "nats-ingest-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/nats-ingest/config.yaml";
    /// default log level. Can use this argument or INGEST_LOG env var
    pub const DEFAULT_INGEST_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "nats-ingest", bin_name = "nats-ingest", about, long_about = None)]
    /// parses from cli & environment var. nats-ingest will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the ingest config (yaml or json)
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the health/metrics api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// don't start the health/metrics api
        #[clap(long, env, value_parser)]
        pub no_external_api: bool,
        /// capacity of the channel feeding the pipeline
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CHANNEL_SIZE)]
        pub channel_size: usize,
        /// number of runtime worker threads, defaults to logical CPU count
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_INGEST_LOG)]
        pub ingest_log: String,
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Log level comes from `ingest_log`,
        /// format from the LOG_FORMAT env var
        pub fn parse(ingest_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(ingest_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("async_nats=warn".parse()?);

            // logs go to stderr, stdout carries the event stream
            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
