//! cdk-fetch: one-shot requests and downloads through `cdk-http`
//!
//! # Usage
//!
//! ```bash
//! # Download a file with progress reporting
//! cdk-fetch download https://example.com/archive.tar.gz ./archive.tar.gz
//!
//! # GET a resource, sending extra headers and accepting a 404
//! cdk-fetch get https://example.com/api -H 'Accept: application/json' --expect-status 404
//!
//! # Print the raw response (status line, headers, body)
//! cdk-fetch --config client.yaml get https://example.com/ --dump
//! ```
//!
//! Client options are layered: defaults, then the `--config` YAML file, then
//! `CDK_HTTP_*` environment variables (e.g. `CDK_HTTP_REQUESTS_PER_SECOND=2`).

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

// CLI tools are expected to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cdk_http::{Client, ClientOptions, Endpoint, Progress, RequestContext};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use tracing_subscriber::EnvFilter;

const ENV_PREFIX: &str = "CDK_HTTP_";

#[derive(Parser, Debug)]
#[command(name = "cdk-fetch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML file with client options
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Overall deadline for the command (e.g. "30s", "2m")
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download URL into FILE
    Download {
        url: String,
        file: PathBuf,
    },
    /// GET a URL and print the response
    Get(GetArgs),
}

#[derive(Args, Debug)]
struct GetArgs {
    url: String,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", action = clap::ArgAction::Append)]
    headers: Vec<String>,

    /// Status code the response must have (default 200)
    #[arg(long)]
    expect_status: Option<u16>,

    /// Print status line and headers before the body
    #[arg(long)]
    dump: bool,

    /// Do not print the body
    #[arg(long)]
    no_body: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn,cdk_http::progress=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let options = load_options(cli.config.as_deref())?;

    let ctx = match cli.timeout {
        Some(timeout) => RequestContext::with_timeout(timeout),
        None => RequestContext::new(),
    };
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, canceling");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Download { url, file } => download(&ctx, options, &url, &file).await,
        Commands::Get(args) => get(&ctx, options, args).await,
    }
}

/// Defaults, then the YAML file, then `CDK_HTTP_*` variables.
fn load_options(config: Option<&Path>) -> Result<ClientOptions> {
    let mut figment = Figment::new().merge(Serialized::defaults(ClientOptions::default()));
    if let Some(path) = config {
        if !path.is_file() {
            bail!("config file does not exist: {}", path.display());
        }
        figment = figment.merge(Yaml::file(path));
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .context("invalid client configuration")
}

async fn download(
    ctx: &RequestContext,
    options: ClientOptions,
    url: &str,
    file: &Path,
) -> Result<()> {
    let label = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());
    let progress = Progress::new(label, 0);

    let written = cdk_http::download_with_options(ctx, options, url, file, &progress)
        .await
        .with_context(|| format!("failed to download {url} to {}", file.display()))?;

    tracing::info!(bytes = written, path = %file.display(), "download finished");
    Ok(())
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header must be `Name: value`, got '{raw}'");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("header name is empty in '{raw}'");
    }
    Ok((name, value.trim()))
}

/// Split a URL into the origin used as base URI and the path-and-query sent.
fn split_target(raw: &str) -> Result<(String, String)> {
    let url = url::Url::parse(raw).with_context(|| format!("invalid URL '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("unsupported scheme '{}' in '{raw}'", url.scheme());
    }
    let origin = url.origin().ascii_serialization();
    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    };
    Ok((origin, target))
}

async fn get(ctx: &RequestContext, options: ClientOptions, args: GetArgs) -> Result<()> {
    let (origin, target) = split_target(&args.url)?;
    let mut client = Client::builder()
        .options(options)
        .base_uri(origin)
        .build()
        .context("failed to build HTTP client")?;

    let mut endpoint = Endpoint::get("cdk-fetch get", target);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        endpoint = endpoint
            .try_header(name, value)
            .with_context(|| format!("invalid header '{raw}'"))?;
    }
    if let Some(code) = args.expect_status {
        let status = http::StatusCode::from_u16(code)
            .with_context(|| format!("invalid status code {code}"))?;
        endpoint = endpoint.expect_status(Some(status));
    }

    let mut response = client
        .execute(ctx, &endpoint)
        .await
        .with_context(|| format!("GET {} failed", args.url))?;

    let mut stdout = std::io::stdout().lock();
    if args.dump {
        let dump = response
            .dump(!args.no_body)
            .await
            .context("failed to read response body")?;
        stdout.write_all(&dump)?;
    } else if !args.no_body {
        let body = response
            .bytes()
            .await
            .context("failed to read response body")?;
        stdout.write_all(&body)?;
    } else {
        response.close();
    }
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept:  application/json ").unwrap(),
            ("Accept", "application/json")
        );
        assert_eq!(parse_header("X-Empty:").unwrap(), ("X-Empty", ""));
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_split_target() {
        let (origin, target) = split_target("https://example.com:8443/a/b?x=1").unwrap();
        assert_eq!(origin, "https://example.com:8443");
        assert_eq!(target, "/a/b?x=1");

        assert!(split_target("ftp://example.com/file").is_err());
        assert!(split_target("not a url").is_err());
    }

    #[test]
    fn test_load_options_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");
        std::fs::write(
            &path,
            "requests_per_second: 2.5\nburst: 4\nconnect_timeout: 3s\nheaders:\n  X-Team: platform\n",
        )
        .unwrap();

        let options = load_options(Some(&path)).unwrap();
        assert!((options.requests_per_second - 2.5).abs() < f64::EPSILON);
        assert_eq!(options.burst, 4);
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(
            options.headers.get("X-Team").map(String::as_str),
            Some("platform")
        );
    }

    #[test]
    fn test_load_options_missing_file() {
        assert!(load_options(Some(Path::new("/definitely/not/here.yaml"))).is_err());
    }

    #[test]
    fn test_cli_parses_get() {
        let cli = Cli::try_parse_from([
            "cdk-fetch",
            "--timeout",
            "5s",
            "get",
            "http://localhost/x",
            "-H",
            "A: 1",
            "-H",
            "B: 2",
            "--expect-status",
            "204",
            "--dump",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Some(Duration::from_secs(5)));
        match cli.command {
            Commands::Get(args) => {
                assert_eq!(args.headers, vec!["A: 1", "B: 2"]);
                assert_eq!(args.expect_status, Some(204));
                assert!(args.dump);
                assert!(!args.no_body);
            }
            Commands::Download { .. } => panic!("expected get"),
        }
    }
}
