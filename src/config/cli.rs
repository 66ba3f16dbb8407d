use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the classifieds-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "classifieds-cache",
    version,
    about = "Inspect cache keys and per-kind cache policy"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CLASSIFIEDS_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the deployment environment used to resolve cache overrides.
    #[arg(long = "environment", value_name = "NAME", global = true)]
    pub environment: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the cache key built for an entity kind and parameter bag.
    Key(KeyArgs),
    /// Print the resolved TTL and auto-invalidation switches of an entity kind.
    Policy(PolicyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Entity kind, e.g. `Post`.
    #[arg(value_name = "KIND")]
    pub kind: String,

    /// Parameters as a JSON object.
    #[arg(long = "params", value_name = "JSON", default_value = "{}")]
    pub params: String,

    /// Embed this version, as the version strategy would.
    #[arg(long = "at-version", value_name = "N")]
    pub version: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct PolicyArgs {
    /// Entity kind, e.g. `Post`.
    #[arg(value_name = "KIND")]
    pub kind: String,
}
