use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use url::Url;

use coap::{
    types::{Endpoint, Message},
    Client, RequestEvent, RequestHandle, RequestOptions,
};

use crate::{
    cli::{Cli, Command},
    config::Config,
};

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let config = match cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let client = Client::builder()
        .with_ack_timeout(config.ack_timeout)
        .with_ack_random_factor(config.ack_random_factor)
        .with_max_retransmit(config.max_retransmit)
        .with_block_size(config.block_size)
        .build()
        .await?;

    match cli.command {
        Command::Get {
            url,
            non_confirmable,
            block_size,
        } => {
            let url = resolve_url(&url).await?;
            let options = RequestOptions {
                non_confirmable,
                block_size,
                ..Default::default()
            };
            let request = client.get_with(&url, options)?;
            run_request(request, false).await
        }
        Command::Post { url, payload } => {
            let url = resolve_url(&url).await?;
            let request = client.post(&url, payload.into_bytes())?;
            run_request(request, false).await
        }
        Command::Put { url, payload } => {
            let url = resolve_url(&url).await?;
            let request = client.put(&url, payload.into_bytes())?;
            run_request(request, false).await
        }
        Command::Delete { url } => {
            let url = resolve_url(&url).await?;
            let request = client.delete(&url)?;
            run_request(request, false).await
        }
        Command::Observe { url } => {
            let url = resolve_url(&url).await?;
            let mut request = client.observe(&url)?;

            tokio::select! {
                result = run_request_loop(&mut request, true) => result,
                _ = tokio::signal::ctrl_c() => {
                    client.cancel(&request);
                    Ok(())
                }
            }
        }
        Command::Ping { endpoint } => {
            let endpoint = resolve_endpoint(&endpoint).await?;
            let request = client.ping(endpoint)?;
            run_request(request, false).await
        }
    }
}

async fn run_request(mut request: RequestHandle, streaming: bool) -> Result<()> {
    run_request_loop(&mut request, streaming).await
}

async fn run_request_loop(request: &mut RequestHandle, streaming: bool) -> Result<()> {
    loop {
        let Some(event) = request.event().await else {
            return Ok(());
        };

        match event {
            RequestEvent::Acknowledged(_) => debug!("acknowledged"),
            RequestEvent::BlockSent(block) => debug!("sent block {}", block),
            RequestEvent::BlockReceived(message) => {
                debug!("received block ({} bytes)", message.payload().len())
            }
            RequestEvent::Response(message) => {
                print_response(&message);
                if !streaming {
                    return Ok(());
                }
            }
            RequestEvent::Reset(_) => {
                info!("peer answered with reset");
                return Ok(());
            }
            RequestEvent::Timeout => anyhow::bail!("request timed out"),
            RequestEvent::Cancelled => return Ok(()),
            RequestEvent::Error(err) => return Err(err.into()),
        }
    }
}

fn print_response(message: &Message) {
    match message.content_format() {
        Some(format) => info!("{} ({})", message.code(), format),
        None => info!("{}", message.code()),
    }

    if !message.payload().is_empty() {
        println!("{}", String::from_utf8_lossy(message.payload()));
    }
}

/// The client wants address literals; resolve hostnames up front.
async fn resolve_url(input: &str) -> Result<String> {
    let parsed = Url::parse(input).with_context(|| format!("invalid URL {}", input))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("missing host in {}", input))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    if host.parse::<IpAddr>().is_ok() {
        return Ok(input.to_string());
    }

    let port = parsed.port().unwrap_or(coap::DEFAULT_PORT);
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .with_context(|| format!("no address found for {}", host))?;

    let host_part = match addr.ip() {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
    };
    let query = parsed
        .query()
        .map(|query| format!("?{}", query))
        .unwrap_or_default();

    Ok(format!(
        "coap://{}:{}{}{}",
        host_part,
        addr.port(),
        parsed.path(),
        query
    ))
}

async fn resolve_endpoint(input: &str) -> Result<Endpoint> {
    if let Ok(endpoint) = input.parse::<Endpoint>() {
        return Ok(endpoint);
    }

    let target = if input.contains(':') {
        input.to_string()
    } else {
        format!("{}:{}", input, coap::DEFAULT_PORT)
    };
    let addr = tokio::net::lookup_host(target.as_str())
        .await?
        .next()
        .with_context(|| format!("no address found for {}", input))?;

    Ok(addr.into())
}
