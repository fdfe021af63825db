//! Canopy CLI
//!
//! Command-line interface for a local canopy database:
//! - Create a database
//! - Write elements through a stream schema
//! - Query rows in a time range
//! - Locate the entity and shard of a payload
//! - Show storage statistics

use anyhow::{anyhow, bail, Context as _, Result};
use canopy::config::{generate_default_config, Config, LoggingConfig};
use canopy::schema::{load_index_rules, StreamSchema, TagType};
use canopy::storage::{Context, Database, Element, Row, TagValue, TimeRange, Timestamp};
use canopy::stream::{Stream, StreamSpec};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "canopy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-partitioned storage for observability streams")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database root, overrides the config
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    /// Stream schema (JSON)
    #[arg(short, long, global = true)]
    pub schema: Option<PathBuf>,

    /// Directory of index rule documents (JSON)
    #[arg(long, global = true)]
    pub index_rules: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database layout
    Init {
        /// Shard count when no schema is given
        #[arg(long)]
        shards: Option<u32>,
    },

    /// Write one element from tag=value pairs, or many from a JSON-lines file
    Write {
        /// Element id (default: generated from the timestamp)
        #[arg(long)]
        id: Option<String>,
        /// Timestamp: "now", "now-15m", RFC 3339 or Unix milliseconds
        #[arg(short, long, default_value = "now")]
        time: String,
        /// JSON-lines file of elements, "-" for stdin
        #[arg(long, conflicts_with = "tags")]
        file: Option<PathBuf>,
        /// Tags in name=value format
        tags: Vec<String>,
    },

    /// Query rows in a time range
    Query {
        /// Range start (inclusive)
        #[arg(long, default_value = "now-1h")]
        from: String,
        /// Range end (exclusive)
        #[arg(long, default_value = "now")]
        to: String,
        /// Only this shard
        #[arg(long)]
        shard: Option<u32>,
    },

    /// Print the entity and shard of a payload
    Locate {
        /// Tags in name=value format
        tags: Vec<String>,
    },

    /// Show storage statistics
    Stats,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(root) = &cli.root {
        config.storage.root = root.to_string_lossy().to_string();
    }
    init_logging(&config.logging)?;

    let ctx = Context::background();
    match &cli.command {
        Commands::Init { shards } => {
            let root = PathBuf::from(&config.storage.root);
            match &cli.schema {
                Some(_) => {
                    let stream = open_stream(&cli, &config, &ctx).await?;
                    println!(
                        "Initialized stream {} with {} shards at {}",
                        stream.id(),
                        stream.database().shard_num(),
                        root.display()
                    );
                    stream.close().await?;
                }
                None => {
                    if let Some(shards) = *shards {
                        config.storage.shard_num = shards;
                    }
                    let db = Database::open(&ctx, config.storage.database_options()?).await?;
                    println!(
                        "Initialized database with {} shards at {}",
                        db.shard_num(),
                        root.display()
                    );
                    db.close().await?;
                }
            }
        }

        Commands::Write {
            id,
            time,
            file,
            tags,
        } => {
            let stream = open_stream(&cli, &config, &ctx).await?;
            let elements = match file {
                Some(path) => read_elements(path)?,
                None => {
                    let timestamp = parse_time(time, Utc::now())?;
                    let id = id.clone().unwrap_or_else(|| format!("{}", timestamp));
                    vec![element_from_pairs(stream.schema(), id, timestamp, tags)?]
                }
            };

            let mut written = 0;
            let mut result = Ok(());
            for element in elements {
                let element_id = element.element_id.clone();
                match stream.write(&ctx, element).await {
                    Ok(shard) => {
                        written += 1;
                        tracing::debug!(element_id = %element_id, shard, "Wrote element");
                    }
                    Err(e) => {
                        result = Err(anyhow!(e).context(format!("writing {}", element_id)));
                        break;
                    }
                }
            }
            stream.close().await?;
            result?;
            println!("Wrote {} elements to {}", written, stream.id());
        }

        Commands::Query { from, to, shard } => {
            let now = Utc::now();
            let range = TimeRange::new(parse_time(from, now)?, parse_time(to, now)?)?;
            let db = open_database(&cli, &config, &ctx).await?;

            let scan = match shard {
                Some(id) => db.scan(&ctx, *id, &range),
                None => db.scan_all(&ctx, &range),
            };
            let close = db.close().await;
            let scan = scan?;
            close?;

            for failed in &scan.errors {
                eprintln!("Unreadable block {}: {}", failed.block.display(), failed.error);
            }
            print_rows(&scan.rows, &cli.format)?;
        }

        Commands::Locate { tags } => {
            let schema = load_schema(&cli)?;
            let locator =
                canopy::partition::EntityLocator::new(&schema.tag_families, &schema.entity)?;
            let element = element_from_pairs(&schema, "locate".into(), 0, tags)?;
            let (entity, shard) = locator.locate(&element.tag_families, schema.opts.shard_num)?;

            let entries: Vec<String> = entity.entries().iter().map(|e| hex(e)).collect();
            match cli.format.as_str() {
                "json" => println!(
                    "{}",
                    serde_json::json!({ "entity": entries, "shard_id": shard })
                ),
                _ => println!("shard {} entity [{}]", shard, entries.join(", ")),
            }
        }

        Commands::Stats => {
            let db = open_database(&cli, &config, &ctx).await?;
            let stats = db.stats();
            db.close().await?;
            let stats = stats?;

            match cli.format.as_str() {
                "json" => {
                    let shards: Vec<_> = stats
                        .shards
                        .iter()
                        .map(|s| {
                            serde_json::json!({
                                "id": s.id,
                                "segments": s.series.segments,
                                "blocks": s.series.blocks,
                                "parts": s.series.parts,
                                "rows": s.series.sealed_rows + s.series.buffered_rows,
                                "index_failures": s.index_failures,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&shards)?);
                }
                _ => {
                    println!("{}", stats);
                    for s in &stats.shards {
                        println!(
                            "  shard-{:<4} segments {:>4}  blocks {:>5}  parts {:>6}  rows {:>10}",
                            s.id,
                            s.series.segments,
                            s.series.blocks,
                            s.series.parts,
                            s.series.sealed_rows + s.series.buffered_rows
                        );
                    }
                }
            }
        }

        Commands::Config { output } => {
            let config = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(path, &config)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", config),
            }
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

fn load_schema(cli: &Cli) -> Result<StreamSchema> {
    let path = cli
        .schema
        .as_ref()
        .ok_or_else(|| anyhow!("this command needs --schema"))?;
    StreamSchema::load(path).with_context(|| format!("loading schema {}", path.display()))
}

async fn open_stream(cli: &Cli, config: &Config, ctx: &Context) -> Result<Stream> {
    let schema = load_schema(cli)?;
    let index_rules = match &cli.index_rules {
        Some(dir) => load_index_rules(dir)?,
        None => Vec::new(),
    };
    let stream = Stream::open(
        ctx,
        &config.storage.root,
        StreamSpec {
            schema,
            index_rules,
        },
        config.storage.stream_options()?,
    )
    .await?;
    Ok(stream)
}

/// A database sized by the schema when one is given, by the config otherwise
async fn open_database(cli: &Cli, config: &Config, ctx: &Context) -> Result<Database> {
    let mut opts = config.storage.database_options()?;
    if cli.schema.is_some() {
        opts.shard_num = load_schema(cli)?.opts.shard_num;
    }
    Ok(Database::open(ctx, opts).await?)
}

/// Parse "now", "now-<n><unit>", RFC 3339 or Unix milliseconds
fn parse_time(s: &str, now: DateTime<Utc>) -> Result<Timestamp> {
    let relative = Regex::new(r"^\s*now\s*(?:-\s*(\d+)\s*(ms|s|m|h|d))?\s*$")?;
    if let Some(caps) = relative.captures(s) {
        let Some(amount) = caps.get(1) else {
            return Ok(now.timestamp_millis());
        };
        let amount: i64 = amount.as_str().parse()?;
        let unit = match caps.get(2).map(|m| m.as_str()) {
            Some("ms") => 1,
            Some("s") => 1_000,
            Some("m") => 60_000,
            Some("h") => 3_600_000,
            _ => 86_400_000,
        };
        return amount
            .checked_mul(unit)
            .and_then(|offset| now.timestamp_millis().checked_sub(offset))
            .ok_or_else(|| anyhow!("relative time {:?} is out of range", s));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(dt.timestamp_millis());
    }
    s.trim()
        .parse::<i64>()
        .map_err(|_| anyhow!("invalid time {:?}: use now, now-1h, RFC 3339 or Unix ms", s))
}

/// Build an element in schema order from name=value pairs; missing tags are null
fn element_from_pairs(
    schema: &StreamSchema,
    id: String,
    timestamp: Timestamp,
    pairs: &[String],
) -> Result<Element> {
    let mut values = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected name=value, got {:?}", pair))?;
        values.push((name.trim(), value));
    }

    let mut element = Element::new(id, timestamp);
    for family in &schema.tag_families {
        let mut tags = Vec::with_capacity(family.tags.len());
        for spec in &family.tags {
            let raw = values.iter().find(|(n, _)| *n == spec.name).map(|(_, v)| *v);
            tags.push(match raw {
                None => TagValue::Null,
                Some(raw) => parse_tag_value(spec.tag_type, raw)
                    .with_context(|| format!("tag {}", spec.name))?,
            });
        }
        element = element.family(tags);
    }

    for (name, _) in &values {
        if !schema
            .tag_families
            .iter()
            .any(|f| f.tags.iter().any(|t| t.name == *name))
        {
            bail!("tag {} is not declared by the schema", name);
        }
    }
    Ok(element)
}

fn parse_tag_value(tag_type: TagType, raw: &str) -> Result<TagValue> {
    Ok(match tag_type {
        TagType::String => TagValue::Str(raw.to_string()),
        TagType::Int => TagValue::Int(raw.parse()?),
        TagType::StringArray => {
            TagValue::StrArray(raw.split(',').map(|s| s.to_string()).collect())
        }
        TagType::IntArray => TagValue::IntArray(
            raw.split(',')
                .map(|s| s.trim().parse())
                .collect::<Result<Vec<i64>, _>>()?,
        ),
        TagType::Data => TagValue::BinaryData(raw.as_bytes().to_vec()),
    })
}

fn read_elements(path: &Path) -> Result<Vec<Element>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut elements = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let element: Element = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        elements.push(element);
    }
    Ok(elements)
}

fn print_rows(rows: &[Row], format: &str) -> Result<()> {
    match format {
        "json" => {
            for row in rows {
                println!("{}", serde_json::to_string(row)?);
            }
        }
        _ => {
            println!("{:<24}  {:<24}  {}", "TIMESTAMP", "ELEMENT", "ENTITY");
            for row in rows {
                let time = DateTime::from_timestamp_millis(row.timestamp)
                    .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
                    .unwrap_or_else(|| row.timestamp.to_string());
                let entity: Vec<String> = row
                    .entity
                    .entries()
                    .iter()
                    .map(|e| String::from_utf8(e.clone()).unwrap_or_else(|_| hex(e)))
                    .collect();
                println!("{:<24}  {:<24}  {}", time, row.element_id, entity.join("/"));
            }
            println!("{} rows", rows.len());
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
