//! CLI for the tally rollup reader.
//!
//! Provides commands for ingesting raw samples into a file store and reading
//! rolled-up totals, range summaries and series back out.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tally::clock::{Clock, SystemClock};
use tally::{
    Fields, Granularity, MetricStore, PeriodHierarchy, Record, RollupReader, Settings,
    StoreConfig, TimeRange, open_store,
};
use tracing_subscriber::EnvFilter;

/// tally: Hierarchical rollup reader CLI.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    /// TOML settings file; `TALLY_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Store one record of field values.
    Ingest {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Entity the values belong to.
        entity: String,

        /// Instant of the sample (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        at: String,

        /// Granularity to file the record under.
        #[arg(long, default_value = "realtime")]
        granularity: Granularity,

        /// Field values as name=value pairs.
        #[arg(required = true, value_parser = parse_field)]
        fields: Vec<(String, BigDecimal)>,
    },

    /// Read totals for the bucket containing a date.
    Read {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Entity to read.
        entity: String,

        /// Bucket granularity.
        #[arg(long, default_value = "daily")]
        granularity: Granularity,

        /// Any instant inside the bucket (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Only report this field.
        #[arg(long)]
        field: Option<String>,

        /// Also cache closed intermediate buckets.
        #[arg(long)]
        recursive: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Summarize an arbitrary time range.
    Range {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Entity to read.
        entity: String,

        /// Inclusive start (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Exclusive end (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// List per-bucket totals over a time range.
    Series {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Entity to read.
        entity: String,

        /// Bucket granularity.
        #[arg(long, default_value = "daily")]
        granularity: Granularity,

        /// Inclusive start (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Exclusive end (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Show what the store holds for an entity.
    Meta {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Entity to describe.
        entity: String,
    },
}

/// Output format for read results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object.
    Json,
}

/// Everything a command needs: the reader and the opened store.
struct Context {
    reader: RollupReader,
    store: Arc<dyn MetricStore>,
}

impl Context {
    fn open(config: Option<&Path>, store_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut settings = Settings::load(config)?;
        settings.store = StoreConfig::file(store_path);
        tracing::debug!(store = %store_path.display(), "opening store");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let reader = settings.reader(clock)?;
        let store = open_store(&settings.store)?;
        Ok(Self { reader, store })
    }

    fn hierarchy(&self) -> &PeriodHierarchy {
        self.reader.hierarchy()
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Ingest {
            store_path,
            entity,
            at,
            granularity,
            fields,
        } => cmd_ingest(config, &store_path, &entity, &at, granularity, fields),
        Commands::Read {
            store_path,
            entity,
            granularity,
            date,
            field,
            recursive,
            format,
        } => cmd_read(
            config,
            &store_path,
            &entity,
            granularity,
            &date,
            field.as_deref(),
            recursive,
            &format,
        ),
        Commands::Range {
            store_path,
            entity,
            start,
            end,
            format,
        } => cmd_range(config, &store_path, &entity, &start, &end, &format),
        Commands::Series {
            store_path,
            entity,
            granularity,
            start,
            end,
            format,
        } => cmd_series(config, &store_path, &entity, granularity, &start, &end, &format),
        Commands::Meta { store_path, entity } => cmd_meta(config, &store_path, &entity),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `tally ingest <store_path> <entity> --at <instant> name=value...`.
fn cmd_ingest(
    config: Option<&Path>,
    store_path: &Path,
    entity: &str,
    at: &str,
    granularity: Granularity,
    fields: Vec<(String, BigDecimal)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(config, store_path)?;
    let instant = parse_instant(at, ctx.hierarchy())?;

    // Coarse records are keyed by their bucket start.
    let bucket_start = if granularity == Granularity::FINEST {
        instant
    } else {
        ctx.hierarchy().bucket(granularity, instant).start
    };

    let record = Record::new(entity, granularity, bucket_start, fields.into_iter().collect());
    ctx.reader
        .guard()
        .call(|| ctx.store.persist(entity, &record))?;

    println!(
        "Stored {} field(s) for '{entity}' at {granularity} {}",
        record.fields.len(),
        bucket_start.to_rfc3339()
    );
    Ok(())
}

/// Implements `tally read <store_path> <entity> --date <instant>`.
#[allow(clippy::too_many_arguments)]
fn cmd_read(
    config: Option<&Path>,
    store_path: &Path,
    entity: &str,
    granularity: Granularity,
    date: &str,
    field: Option<&str>,
    recursive: bool,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(config, store_path)?;
    let instant = parse_instant(date, ctx.hierarchy())?;
    let bucket = ctx.hierarchy().bucket(granularity, instant);

    let mut totals = ctx
        .reader
        .read_all(entity, granularity, bucket, ctx.store.as_ref(), recursive)?;
    if let Some(field) = field {
        totals.retain(|name, _| name == field);
    }

    match format {
        OutputFormat::Csv => {
            println!("# entity={entity}, granularity={granularity}, range={bucket}");
            print_fields_csv(&totals);
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "entity": entity,
                "granularity": granularity,
                "range": bucket,
                "fields": totals,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tally range <store_path> <entity> --start <instant> --end <instant>`.
fn cmd_range(
    config: Option<&Path>,
    store_path: &Path,
    entity: &str,
    start: &str,
    end: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(config, store_path)?;
    let range = TimeRange::new(
        parse_instant(start, ctx.hierarchy())?,
        parse_instant(end, ctx.hierarchy())?,
    )?;

    let totals = ctx
        .reader
        .summarize_range(entity, range, ctx.store.as_ref())?;

    match format {
        OutputFormat::Csv => {
            println!("# entity={entity}, range={range}");
            print_fields_csv(&totals);
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "entity": entity,
                "range": range,
                "fields": totals,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tally series <store_path> <entity> --start <instant> --end <instant>`.
fn cmd_series(
    config: Option<&Path>,
    store_path: &Path,
    entity: &str,
    granularity: Granularity,
    start: &str,
    end: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(config, store_path)?;
    let range = TimeRange::new(
        parse_instant(start, ctx.hierarchy())?,
        parse_instant(end, ctx.hierarchy())?,
    )?;

    let points = ctx
        .reader
        .series(entity, granularity, range, ctx.store.as_ref())?;

    match format {
        OutputFormat::Csv => {
            println!(
                "# entity={entity}, granularity={granularity}, points={}",
                points.len()
            );
            println!("start,end,field,value");
            for point in &points {
                for (name, value) in &point.fields {
                    println!(
                        "{},{},{name},{value}",
                        point.range.start.to_rfc3339(),
                        point.range.end.to_rfc3339()
                    );
                }
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "entity": entity,
                "granularity": granularity,
                "count": points.len(),
                "data": points,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tally meta <store_path> <entity>`.
fn cmd_meta(
    config: Option<&Path>,
    store_path: &Path,
    entity: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(config, store_path)?;
    let meta = ctx.reader.meta(entity, ctx.store.as_ref())?;

    println!("Store: {}", store_path.display());
    println!("Entity: {}", meta.entity_id);
    println!("Records: {}", meta.record_count);
    if let (Some(earliest), Some(latest)) = (meta.earliest, meta.latest) {
        println!("Earliest: {}", earliest.to_rfc3339());
        println!("Latest: {}", latest.to_rfc3339());
    }

    Ok(())
}

fn print_fields_csv(fields: &Fields) {
    println!("field,value");
    for (name, value) in fields {
        println!("{name},{value}");
    }
}

/// Parses an RFC 3339 instant, or a `YYYY-MM-DD` date taken as midnight in
/// the configured calendar.
fn parse_instant(
    s: &str,
    hierarchy: &PeriodHierarchy,
) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let s = s.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
        return Ok(instant.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid instant '{s}'. Use RFC 3339 or YYYY-MM-DD."))?;
    let local = hierarchy
        .offset()
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .ok_or_else(|| format!("Instant '{s}' is out of range"))?;
    Ok(local.with_timezone(&Utc))
}

/// Parses a `name=value` field argument.
fn parse_field(s: &str) -> Result<(String, BigDecimal), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid field '{s}'. Use name=value."))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Invalid field '{s}': empty name"));
    }
    let value = BigDecimal::from_str(value.trim())
        .map_err(|e| format!("Invalid value for field '{name}': {e}"))?;
    Ok((name.to_string(), value))
}
