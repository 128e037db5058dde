use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use log::warn;
use pooled_http::http::HttpClient;
use pooled_http::{
    AsyncHttpClient, ClientCache, ClientParams, PostRequest, Response, ResponseBody, Timeout,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// pooled-http - send requests through cached, pooled HTTP clients
///
/// Proxy and TLS settings are read from HTTP_PROXY, HTTPS_PROXY, NO_PROXY,
/// SSL_VERIFY and SSL_CERTIFICATE.
///
/// Examples:
///   pooled-http get https://example.com
///   pooled-http post https://example.com/v1 --json '{"prompt": "hi"}'
#[derive(Parser, Debug)]
#[command(author, version = env!("POOLED_HTTP_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS", value_parser = parse_timeout, global = true)]
    timeout: Option<Timeout>,

    /// Maximum simultaneous connections for the client
    #[arg(long = "concurrent-limit", value_name = "N", global = true)]
    concurrent_limit: Option<usize>,

    /// Use the blocking client instead of the asynchronous one
    #[arg(long, global = true)]
    sync: bool,

    /// Request header, repeatable
    #[arg(
        long = "header",
        short = 'H',
        value_name = "NAME:VALUE",
        value_parser = parse_header,
        global = true
    )]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Query parameter, repeatable
    #[arg(
        long = "param",
        short = 'p',
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        global = true
    )]
    params: Vec<(String, String)>,

    /// Print status, final URL and headers as JSON before the body
    #[arg(long, short = 'i', global = true)]
    include: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a GET request
    Get(GetArgs),

    /// Send a POST request
    Post(PostArgs),
}

#[derive(clap::Args, Debug)]
struct GetArgs {
    #[arg(value_name = "URL")]
    url: String,
}

#[derive(clap::Args, Debug)]
struct PostArgs {
    #[arg(value_name = "URL")]
    url: String,

    /// JSON request body
    #[arg(long, value_name = "JSON")]
    json: Option<String>,

    /// Raw text request body
    #[arg(long, short = 'd', value_name = "TEXT", conflicts_with = "form")]
    data: Option<String>,

    /// Form field, repeatable
    #[arg(long, short = 'F', value_name = "KEY=VALUE", value_parser = parse_key_value)]
    form: Vec<(String, String)>,

    /// Write the body as it arrives instead of buffering it
    #[arg(long)]
    stream: bool,
}

#[derive(Serialize)]
struct Summary {
    status: u16,
    url: String,
    headers: BTreeMap<String, String>,
}

impl Summary {
    fn of(response: &Response) -> Self {
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                (name.to_string(), value)
            })
            .collect();
        Self {
            status: response.status().as_u16(),
            url: response.url().to_string(),
            headers,
        }
    }
}

fn parse_timeout(s: &str) -> std::result::Result<Timeout, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid number `{s}`: {e}"))?;
    Timeout::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    Ok((key.to_string(), value.to_string()))
}

fn parse_header(s: &str) -> std::result::Result<(HeaderName, HeaderValue), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got `{s}`"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| e.to_string())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| e.to_string())?;
    Ok((name, value))
}

impl Cli {
    /// `None` selects the cache's default entry.
    fn client_params(&self) -> Option<ClientParams> {
        if self.timeout.is_none() && self.concurrent_limit.is_none() {
            return None;
        }
        let mut params = ClientParams::new();
        if let Some(timeout) = self.timeout {
            params = params.timeout(timeout);
        }
        if let Some(limit) = self.concurrent_limit {
            params = params.concurrent_limit(limit);
        }
        Some(params)
    }

    fn header_map(&self) -> HeaderMap {
        self.headers.iter().cloned().collect()
    }

    fn query(&self) -> Vec<(&str, &str)> {
        self.params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    fn post_request(&self, args: &PostArgs) -> Result<PostRequest> {
        let mut post = PostRequest::new()
            .headers(self.header_map())
            .stream(args.stream);
        for (key, value) in &self.params {
            post = post.param(key, value);
        }
        if let Some(json) = &args.json {
            let value = serde_json::from_str(json).context("--json is not valid JSON")?;
            post = post.json(value);
        }
        if let Some(text) = &args.data {
            post = post.text(text);
        }
        if !args.form.is_empty() {
            let fields: Vec<(&str, &str)> = args
                .form
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            post = post.form(&fields);
        }
        Ok(post)
    }

    fn url(&self) -> &str {
        match &self.command {
            Commands::Get(args) => &args.url,
            Commands::Post(args) => &args.url,
        }
    }
}

async fn run_async(cli: &Cli, client: &AsyncHttpClient) -> Result<()> {
    let response = match &cli.command {
        Commands::Get(_) => {
            let headers = cli.header_map();
            client.get(cli.url(), &cli.query(), Some(&headers)).await
        }
        Commands::Post(args) => client.post(cli.url(), cli.post_request(args)?).await,
    }
    .with_context(|| format!("Request to {} failed", cli.url()))?;

    if cli.include {
        println!("{}", serde_json::to_string_pretty(&Summary::of(&response))?);
    }

    let mut stdout = tokio::io::stdout();
    match response.into_body() {
        ResponseBody::Buffered(bytes) => stdout.write_all(&bytes).await?,
        ResponseBody::Streaming(streaming) => {
            let mut chunks = std::pin::pin!(streaming.bytes_stream());
            while let Some(chunk) = chunks.next().await {
                stdout.write_all(&chunk?).await?;
                stdout.flush().await?;
            }
        }
        ResponseBody::BlockingStreaming(_) => {
            anyhow::bail!("Asynchronous client returned a blocking body")
        }
    }
    stdout.flush().await?;
    Ok(())
}

fn run_blocking(cli: &Cli, client: &HttpClient) -> Result<()> {
    let response = match &cli.command {
        Commands::Get(_) => {
            let headers = cli.header_map();
            client.get(cli.url(), &cli.query(), Some(&headers))
        }
        Commands::Post(args) => client.post(cli.url(), cli.post_request(args)?),
    }
    .with_context(|| format!("Request to {} failed", cli.url()))?;

    if cli.include {
        println!("{}", serde_json::to_string_pretty(&Summary::of(&response))?);
    }

    let mut stdout = std::io::stdout().lock();
    match response.into_body() {
        ResponseBody::Buffered(bytes) => stdout.write_all(&bytes)?,
        ResponseBody::BlockingStreaming(mut streaming) => {
            std::io::copy(&mut streaming, &mut stdout)?;
        }
        ResponseBody::Streaming(_) => {
            anyhow::bail!("Blocking client returned an asynchronous body")
        }
    }
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let cache = ClientCache::from_env();
    let params = cli.client_params();

    if cli.sync {
        // The blocking pool must be built, used and dropped off the async runtime.
        return tokio::task::spawn_blocking(move || {
            let client = cache.get_client(params.as_ref());
            run_blocking(&cli, &client)
        })
        .await
        .context("Blocking request task failed")?;
    }

    let client = cache.get_async_client(params.as_ref());
    let result = run_async(&cli, &client).await;
    settle(result, client.close().await)
}

/// The request outcome wins over a failure to close the client afterwards.
fn settle(result: Result<()>, closed: pooled_http::Result<()>) -> Result<()> {
    if let Err(err) = closed {
        warn!("Failed to close client: {}", err);
    }
    result
}
