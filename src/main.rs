use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use geolore::config::Config;
use geolore::geocode::batch::{read_inputs, write_outputs};
use geolore::geocode::{
    BatchOptions, BatchRunner, BatchSummary, GeoError, Overrides, ProviderKind, RegionHintPolicy, ResolutionEngine,
    ResultCache,
};
use geolore::server::{self, AppState};

/// geolore — hierarchical place geocoding with validated fallback
///
/// Resolves "Province-City-District-Street-POI" addresses level by level,
/// validating every provider answer against the address before accepting it.
///
/// Examples:
///   geolore resolve "浙江省-杭州市-上城区-孤山路25号-杭州博物馆"
///   geolore geocode --input places.json --output geocoded.json
///   geolore --provider nominatim serve --port 8080
///   geolore cache-stats
#[derive(Parser)]
#[command(name = "geolore", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    opts: GlobalOpts,
}

#[derive(Args)]
struct GlobalOpts {
    /// JSON config file. Flags below override its values.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Geocoding backend.
    #[arg(long, value_enum, global = true)]
    provider: Option<ProviderKind>,

    /// Amap Web Service key.
    #[arg(long, env = "AMAP_KEY", hide_env_values = true, global = true)]
    amap_key: Option<String>,

    /// Cache file (default ~/.geolore/geocode_cache.json).
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Provider calls per second, shared by all workers.
    #[arg(long, global = true)]
    rate_limit: Option<f64>,

    /// Worker threads for batch runs.
    #[arg(long, short = 'w', global = true)]
    workers: Option<usize>,

    /// Address level delimiter.
    #[arg(long, global = true)]
    delimiter: Option<String>,

    /// Region hint sent with every query.
    #[arg(long, value_enum, global = true)]
    region_hint: Option<RegionHintPolicy>,

    /// Accept the first provider answer without validation.
    #[arg(long, global = true)]
    disable_validation: bool,

    /// Skip only the distance plausibility check.
    #[arg(long, global = true)]
    no_distance_check: bool,

    /// Ignore cached results and overwrite them with fresh answers.
    #[arg(long, global = true)]
    refresh: bool,

    /// Extra reference points, `{"name": {"lat": .., "lon": ..}}`.
    #[arg(long, global = true)]
    reference: Option<PathBuf>,

    /// Manual coordinates and query rewrites per title.
    #[arg(long, global = true)]
    overrides: Option<PathBuf>,

    /// Debug logging.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Geocode a JSON array of {title, address} records.
    Geocode {
        #[arg(long, short = 'i')]
        input: PathBuf,
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Resolve a single address and print the outcome as JSON.
    Resolve {
        address: String,
        /// Also print every level attempt.
        #[arg(long)]
        trace: bool,
    },
    /// Run the HTTP service.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, short = 'p', default_value_t = 3000)]
        port: u16,
    },
    /// Show cache entry counts per class.
    CacheStats,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.opts.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), GeoError> {
    let config = build_config(&cli.opts)?;

    match cli.command {
        Command::CacheStats => {
            let path = config.cache.path.clone().unwrap_or_else(ResultCache::default_path);
            let cache = ResultCache::load_from(path.clone(), config.cache_policy());
            eprintln!("  Cache: {}", path.display());
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
            Ok(())
        }
        Command::Resolve { address, trace } => {
            config.validate()?;
            let engine = ResolutionEngine::from_config(&config)?;
            let result = engine.resolve_traced(&address);
            engine.cache().flush()?;

            if trace {
                for attempt in &result.attempts {
                    eprintln!("  [depth {}] {} ({}) → {:?}", attempt.depth, attempt.query, attempt.region_hint, attempt.result);
                }
                eprintln!("  provider calls: {}", result.provider_calls);
            }
            println!("{}", serde_json::to_string_pretty(&result.outcome)?);
            Ok(())
        }
        Command::Geocode { input, output } => {
            config.validate()?;
            let inputs = read_inputs(&input)?;
            let engine = Arc::new(ResolutionEngine::from_config(&config)?);
            let runner = BatchRunner::new(engine, batch_options(&config))
                .with_overrides(Arc::new(load_overrides(config.overrides_path.as_deref())?));

            let records = runner.run(inputs)?;
            write_outputs(&output, &records)?;

            let summary = BatchSummary::from_outcomes(&records);
            eprintln!(
                "  {} / {} resolved ({} cache hits, {} manual), {} need review → {}",
                summary.resolved(),
                summary.total,
                summary.cache_hits,
                summary.manual,
                summary.needs_review,
                output.display()
            );
            Ok(())
        }
        Command::Serve { host, port } => {
            config.validate()?;
            let state = Arc::new(AppState {
                engine: Arc::new(ResolutionEngine::from_config(&config)?),
                overrides: Arc::new(load_overrides(config.overrides_path.as_deref())?),
                batch: batch_options(&config),
            });
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::start(state, &host, port))
        }
    }
}

/// Config file (if any), then flags.
fn build_config(opts: &GlobalOpts) -> Result<Config, GeoError> {
    let mut config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(kind) = opts.provider {
        config.provider.kind = kind;
    }
    if let Some(key) = &opts.amap_key {
        config.provider.amap_key = Some(key.clone());
    }
    if let Some(rate) = opts.rate_limit {
        config.provider.rate_limit = rate;
    }
    if let Some(path) = &opts.cache {
        config.cache.path = Some(path.clone());
    }
    if let Some(workers) = opts.workers {
        config.batch.workers = workers;
    }
    if let Some(delimiter) = &opts.delimiter {
        config.engine.delimiter = delimiter.clone();
    }
    if let Some(policy) = opts.region_hint {
        config.engine.region_hint = policy;
    }
    if opts.disable_validation {
        config.engine.validation.check_locality = false;
        config.engine.validation.check_distance = false;
    }
    if opts.no_distance_check {
        config.engine.validation.check_distance = false;
    }
    if opts.refresh {
        config.engine.read_cache = false;
    }
    if let Some(path) = &opts.reference {
        config.reference_path = Some(path.clone());
    }
    if let Some(path) = &opts.overrides {
        config.overrides_path = Some(path.clone());
    }
    Ok(config)
}

fn load_overrides(path: Option<&Path>) -> Result<Overrides, GeoError> {
    match path {
        Some(path) => Overrides::load(path),
        None => Ok(Overrides::default()),
    }
}

fn batch_options(config: &Config) -> BatchOptions {
    BatchOptions {
        workers: config.batch.workers,
        flush_every: config.batch.flush_every,
    }
}
