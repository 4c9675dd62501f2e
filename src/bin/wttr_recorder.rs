// wttr_recorder - wttr.in weather poller that records readings to InfluxDB v2
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;
use wttr_recorder::client::{WeatherReading, WttrClient};
use wttr_recorder::influx::InfluxWriter;
use wttr_recorder::token::{ResolverSettings, TokenResolver};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_WTTR_URL: &str = "https://wttr.in/";
const DEFAULT_INFLUXDB_URL: &str = "http://localhost:8086";
const DEFAULT_ORG: &str = "nflx";
const DEFAULT_BUCKET: &str = "default";
const DEFAULT_TOKEN_FILE: &str = "/workspace/extracted_token";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;

/// Pause between cities within a cycle, to be polite to the weather API.
const CITY_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_CITIES: [&str; 10] = [
    "Nashville, TN",
    "Los Gatos, CA",
    "San Francisco, CA",
    "London, UK",
    "Tokyo, JP",
    "Rome, IT",
    "Dublin, IE",
    "New York City, NY",
    "Seattle, WA",
    "Paris, FR",
];

#[derive(Debug, Parser)]
#[clap(name = "wttr_recorder", version = clap::crate_version!())]
struct WttrRecorderApplication {
    /// City to record weather for. May be repeated; defaults to a fixed list
    /// of ten cities when not given.
    #[clap(long = "city")]
    cities: Vec<String>,

    /// Base URL for the wttr.in API
    #[clap(long, env = "WTTR_URL", default_value_t = DEFAULT_WTTR_URL.into())]
    wttr_url: String,

    /// Base URL for the InfluxDB v2 API
    #[clap(long, env = "INFLUXDB_URL", default_value_t = DEFAULT_INFLUXDB_URL.into())]
    influxdb_url: String,

    /// InfluxDB organization to write to
    #[clap(long, env = "INFLUXDB_ORG", default_value_t = DEFAULT_ORG.into())]
    org: String,

    /// InfluxDB bucket to write to
    #[clap(long, env = "INFLUXDB_BUCKET", default_value_t = DEFAULT_BUCKET.into())]
    bucket: String,

    /// InfluxDB username, used by the session and basic-auth token sources
    #[clap(long, env = "INFLUXDB_USERNAME", default_value_t = String::new())]
    username: String,

    /// InfluxDB password, used by the session and basic-auth token sources
    #[clap(long, env = "INFLUXDB_PASSWORD", hide_env_values = true, default_value_t = String::new())]
    password: String,

    /// InfluxDB API token. When set, no other token source is consulted.
    #[clap(long, env = "INFLUXDB_TOKEN", hide_env_values = true, default_value_t = String::new())]
    token: String,

    /// Path to a KEY=value file containing INFLUXDB_TOKEN, typically mounted
    /// by an init container
    #[clap(long, env = "INFLUXDB_TOKEN_FILE", default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,

    /// Allow presenting the raw InfluxDB password as a bearer token when every
    /// other token source fails. Disabled by default; only enable for
    /// deployments that depend on this behavior.
    #[clap(long, env = "INFLUXDB_ALLOW_PASSWORD_TOKEN")]
    allow_password_token: bool,

    /// Record weather for every city at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_POLL_SECS)]
    poll_secs: u64,

    /// Timeout for individual HTTP requests, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Number of attempts for each weather fetch before giving up on a city
    /// for the cycle.
    #[clap(long, default_value_t = DEFAULT_FETCH_ATTEMPTS)]
    max_retries: u32,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, env = "LOG_LEVEL", default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = WttrRecorderApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let influxdb_url = opts.influxdb_url.trim_end_matches('/').to_owned();
    tracing::info!(
        message = "starting weather recorder",
        influxdb_url = %influxdb_url,
        org = %opts.org,
        bucket = %opts.bucket,
        auth_configured = !opts.username.is_empty() && !opts.password.is_empty(),
    );

    let cities: Vec<String> = if opts.cities.is_empty() {
        DEFAULT_CITIES.iter().map(|c| c.to_string()).collect()
    } else {
        opts.cities.clone()
    };

    let client = WttrClient::new(http_client.clone(), &opts.wttr_url, opts.max_retries);
    let writer = InfluxWriter::new(http_client.clone(), &influxdb_url, &opts.org, &opts.bucket);
    let resolver = TokenResolver::new(
        http_client,
        ResolverSettings {
            base_url: influxdb_url,
            org: opts.org.clone(),
            username: opts.username.clone(),
            password: opts.password.clone(),
            token: opts.token.clone(),
            token_file: opts.token_file.clone(),
            allow_password_token: opts.allow_password_token,
            timeout,
        },
    );

    let mut interval = tokio::time::interval(Duration::from_secs(opts.poll_secs));

    tokio::spawn(async move {
        tracing::info!(message = "weather polling started", num_cities = cities.len());
        let mut cycle: u64 = 0;

        loop {
            let _ = interval.tick().await;
            cycle += 1;
            tracing::info!(message = "starting poll cycle", cycle = cycle);

            for (i, city) in cities.iter().enumerate() {
                record_city(&client, &resolver, &writer, city).await;
                if i + 1 < cities.len() {
                    tokio::time::sleep(CITY_DELAY).await;
                }
            }
        }
    });

    // Wait for either SIGTERM or SIGINT to shutdown
    tokio::select! {
        _ = sigterm() => {}
        _ = sigint() => {}
    }

    tracing::info!("shutting down weather recorder");
    Ok(())
}

/// Fetch, display, and record a single city, converting every failure into a
/// log line so the cycle always moves on to the next city.
async fn record_city(client: &WttrClient, resolver: &TokenResolver, writer: &InfluxWriter, city: &str) {
    tracing::info!(message = "fetching weather", city = %city);

    let report = match client.current(city).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(message = "failed to fetch weather", city = %city, error = %e);
            return;
        }
    };

    let reading = match WeatherReading::from_report(&report, city) {
        Some(reading) => reading,
        None => {
            tracing::warn!(message = "no weather data available", city = %city);
            return;
        }
    };

    // The summary block is the product here, not diagnostics.
    println!("\n{}\n", reading.summary());

    let credential = match resolver.resolve_with_retry().await {
        Some(credential) => credential,
        None => {
            tracing::error!(message = "skipping database write, no token", city = %city);
            return;
        }
    };

    match writer.write(&credential, &reading).await {
        Ok(()) => {
            tracing::info!(message = "recorded weather reading", city = %city, token_source = %credential.source);
        }
        Err(e) => {
            tracing::error!(message = "failed to write weather reading", city = %city, error = %e);
        }
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
