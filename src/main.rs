use std::process;

use classifieds_cache::{
    cache::{KeyBuilder, ParameterBag},
    config::{self, Command, KeyArgs, PolicyArgs},
    error::{AppError, CacheError},
    telemetry,
};
use tracing::{Dispatch, Level, debug, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    debug!(
        environment = %settings.app.environment,
        strategy = ?settings.cache.strategy,
        "Configuration loaded"
    );

    match cli_args.command {
        Command::Key(args) => run_key(&settings, args),
        Command::Policy(args) => run_policy(&settings, args),
    }
}

fn run_key(settings: &config::Settings, args: KeyArgs) -> Result<(), AppError> {
    let params: serde_json::Value = serde_json::from_str(&args.params)
        .map_err(|err| AppError::validation(format!("--params is not valid JSON: {err}")))?;
    let bag = ParameterBag::from_serialize(&params)?;

    let builder = KeyBuilder::new(
        settings.cache.key_prefix.clone(),
        settings.cache.hash_algorithm,
    );
    let key = builder.build(&args.kind, &bag, args.version)?;
    println!("{key}");
    Ok(())
}

fn run_policy(settings: &config::Settings, args: PolicyArgs) -> Result<(), AppError> {
    let cache = &settings.cache;
    let ttl = cache.ttl_for(&args.kind, None);
    let switches = cache.auto_invalidation_for(&args.kind);
    let policy = serde_json::json!({
        "kind": args.kind,
        "environment": settings.app.environment,
        "ttl_secs": ttl.as_secs(),
        "hash_algorithm": cache.hash_algorithm,
        "strategy": cache.strategy,
        "auto_invalidation": switches,
    });

    let rendered = serde_json::to_string_pretty(&policy)
        .map_err(|err| CacheError::serialization(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}
