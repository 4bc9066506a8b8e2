//! Mirror rewrite CLI entry point.
//!
//! Rewrites a payload read from a file or stdin and writes the result to stdout.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mirror_rewrite::{ContentPipeline, Direction, MirrorConfig, PayloadShape};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mirror-rewrite")]
#[command(
    author,
    version,
    about = "Rewrite wiki payloads between a mirror and its canonical domains"
)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, env = "MIRROR_REWRITE_CONFIG")]
    config: Option<PathBuf>,

    /// Mirror domain, used when no configuration file is given
    #[arg(long, env = "MIRROR_DOMAIN")]
    mirror: Option<String>,

    /// Rewrite direction
    #[arg(short, long, value_enum, default_value = "inbound")]
    direction: DirectionArg,

    /// Content type of the payload; sniffed from the payload when absent
    #[arg(long)]
    content_type: Option<String>,

    /// Input file; stdin when absent
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    /// Mirror to canonical
    Outbound,
    /// Canonical to mirror
    Inbound,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Outbound => Direction::Outbound,
            DirectionArg::Inbound => Direction::Inbound,
        }
    }
}

fn print_example_config() {
    let example = r#"# Mirror Rewrite Configuration Example
version: "1"

domains:
  # Domain the mirror is served under
  mirror: "mirror.test"
  # Canonical root domain
  canonical: "wikimedia.org"
  # Projects served as <project>.<mirror>
  sub_brands: [wikipedia, wiktionary, wikibooks, wikidata, mediawiki]
  # Service hosts outside the canonical family
  aliases:
    - label: phab
      host: phab.wmfusercontent.org

pipeline:
  # Deflate level for re-compressed blobs (0-9)
  compression_level: 5
  # Larger bodies pass through untouched (bytes)
  max_body_size: 10485760  # 10MB
  request_fields: [text, summary, titles, wikitext, html]
  response_fields: ["*", text, html, content, wikitext]

interception:
  header_name: "api-user-agent"
  user_agent: "MirrorRewrite/unofficial (${mirror})"
  strip_params: [md5]
  denylist:
    - pattern: "intake-(analytics|logging)"
      type: regex
  edit_tag:
    value: "WikiMirror"
    host_pattern: "^zh(\\.m)?\\.wikipedia"
  routes:
    - pattern: "^xtools\\.(?:wmcloud|wmflabs)\\.org/api/"
      replacement: "xtools-api.${mirror}/"
      # Send the rest of the path through the outbound rules
      rewrite_path: true
"#;
    println!("{}", example);
}

fn load_config(args: &Args) -> Result<MirrorConfig> {
    let Some(config_path) = &args.config else {
        let mirror = args
            .mirror
            .clone()
            .context("Either --config or --mirror is required")?;
        let config = MirrorConfig::for_mirror(mirror);
        config.validate()?;
        return Ok(config);
    };

    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let mut config = if config_path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml")
    {
        MirrorConfig::from_yaml(&content)?
    } else {
        MirrorConfig::from_json(&content)?
    };

    // CLI mirror overrides the file
    if let Some(mirror) = &args.mirror {
        config.domains.mirror = mirror.clone();
        config.validate()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if args.example_config {
        print_example_config();
        return Ok(());
    }

    let config = load_config(&args)?;
    let pipeline = ContentPipeline::new(&config).context("Failed to build content pipeline")?;

    if args.validate {
        info!(mirror = %config.domains.mirror, "Configuration is valid");
        return Ok(());
    }

    let input = match &args.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("Failed to read stdin")?;
            buffer
        }
    };

    let direction = Direction::from(args.direction);
    let content_type = args.content_type.as_deref();
    debug!(
        %direction,
        shape = %PayloadShape::detect(content_type, &input),
        size = input.len(),
        "Rewriting input"
    );

    let output = pipeline.transform_body(&input, content_type, direction);

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(output.as_bytes())
        .await
        .context("Failed to write output")?;
    stdout.flush().await?;

    info!(
        %direction,
        changed = output != input,
        cache_entries = pipeline.engine().cache().len(),
        "Rewrite complete"
    );
    Ok(())
}
