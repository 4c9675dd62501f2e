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

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for the wttr.in JSON API.
///
/// Requests that fail in transport or return an undecodable body are retried
/// with exponential backoff (1s, 2s, 4s, ...) up to the configured number of
/// attempts. The last error is returned once the budget is exhausted; callers
/// are expected to treat that as "no data for this cycle" rather than a fault.
#[derive(Debug)]
pub struct WttrClient {
    client: Client,
    base_url: Url,
    max_attempts: u32,
}

impl WttrClient {
    const USER_AGENT: &'static str = "wttr_recorder (https://github.com/56quarters/wttr_recorder)";
    const JSON_RESPONSE: &'static str = "application/json";
    const JSON_FORMAT: &'static str = "j1";

    pub fn new(client: Client, base_url: &str, max_attempts: u32) -> Self {
        WttrClient {
            client,
            // TODO(56quarters): Handle this better
            base_url: Url::parse(base_url).unwrap(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Fetch current conditions for a location, an empty location meaning
    /// "wherever the server thinks this IP is".
    pub async fn current(&self, location: &str) -> Result<WttrReport, ClientError> {
        let url = self.weather_url(location);
        let mut attempt = 0;

        loop {
            tracing::debug!(message = "making weather request", url = %url, attempt = attempt + 1);
            match self.fetch(url.clone()).await {
                Ok(report) => return Ok(report),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            message = "weather fetch failed, no attempts left",
                            url = %url,
                            attempts = attempt,
                            error = %e,
                        );
                        return Err(e);
                    }

                    let delay = retry_delay(attempt - 1);
                    tracing::warn!(
                        message = "weather fetch failed, retrying",
                        url = %url,
                        attempt = attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fetch(&self, url: Url) -> Result<WttrReport, ClientError> {
        let res = self
            .client
            .get(url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(ClientError::Unexpected(status, url));
        }

        res.json::<WttrReport>().await.map_err(ClientError::Internal)
    }

    fn weather_url(&self, location: &str) -> Url {
        let mut url = self.base_url.clone();
        if !location.is_empty() {
            // Encoded up front since set_path passes percent signs through;
            // path_segments_mut().push() would escape them a second time.
            let encoded_location = utf8_percent_encode(location, NON_ALPHANUMERIC);
            url.set_path(&encoded_location.to_string());
        }

        url.query_pairs_mut().append_pair("format", Self::JSON_FORMAT);
        url
    }
}

/// Delay before the next fetch after `attempt` failures, doubling each time.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(16))
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WttrReport {
    #[serde(alias = "current_condition", default)]
    pub current_condition: Vec<CurrentCondition>,
    #[serde(alias = "nearest_area", default)]
    pub nearest_area: Vec<NearestArea>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct CurrentCondition {
    #[serde(alias = "temp_C", default)]
    pub temp_c: String,
    #[serde(alias = "temp_F", default)]
    pub temp_f: String,
    #[serde(alias = "FeelsLikeC", default)]
    pub feels_like_c: String,
    #[serde(alias = "FeelsLikeF", default)]
    pub feels_like_f: String,
    #[serde(alias = "humidity", default)]
    pub humidity: String,
    #[serde(alias = "pressure", default)]
    pub pressure: String,
    #[serde(alias = "cloudcover", default)]
    pub cloud_cover: String,
    #[serde(alias = "windspeedKmph", default)]
    pub wind_speed_kmph: String,
    #[serde(alias = "winddir16Point", default)]
    pub wind_dir: String,
    #[serde(alias = "visibility", default)]
    pub visibility: String,
    #[serde(alias = "weatherDesc", default)]
    pub weather_desc: Vec<TextValue>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct NearestArea {
    #[serde(alias = "areaName", default)]
    pub area_name: Vec<TextValue>,
    #[serde(alias = "country", default)]
    pub country: Vec<TextValue>,
    #[serde(alias = "latitude", default)]
    pub latitude: String,
    #[serde(alias = "longitude", default)]
    pub longitude: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TextValue {
    #[serde(alias = "value", default)]
    pub value: String,
}

/// One normalized reading, built fresh each poll cycle and discarded after use.
///
/// wttr.in emits every numeric as a string. Anything absent or unparseable
/// becomes `0.0` so that the fields written downstream always have one type.
#[derive(Debug, Clone)]
pub struct WeatherReading {
    pub location: String,
    pub country: String,
    pub query: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temp_c: f64,
    pub temp_f: f64,
    pub temp_k: f64,
    pub feels_like_c: f64,
    pub feels_like_f: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub cloud_cover: f64,
    pub wind_speed_kmph: f64,
    pub visibility_km: f64,
    pub wind_dir: String,
    pub condition: String,
    pub timestamp_ns: i64,
}

impl WeatherReading {
    /// Build a reading from an API report, stamped with the current time.
    ///
    /// Returns `None` when the report has no current conditions, which callers
    /// should treat as "no data available" for the cycle.
    pub fn from_report(report: &WttrReport, query: &str) -> Option<Self> {
        Self::from_report_at(report, query, unix_timestamp_ns())
    }

    pub fn from_report_at(report: &WttrReport, query: &str, timestamp_ns: i64) -> Option<Self> {
        let current = report.current_condition.first()?;
        let area = report.nearest_area.first();

        let temp_c = parse_or_zero(&current.temp_c);
        Some(WeatherReading {
            location: area.map(|a| first_value(&a.area_name)).unwrap_or_else(|| "Unknown".to_owned()),
            country: area.map(|a| first_value(&a.country)).unwrap_or_else(|| "Unknown".to_owned()),
            query: query.to_owned(),
            latitude: area.map(|a| parse_or_zero(&a.latitude)).unwrap_or(0.0),
            longitude: area.map(|a| parse_or_zero(&a.longitude)).unwrap_or(0.0),
            temp_c,
            temp_f: parse_or_zero(&current.temp_f),
            temp_k: temp_c + 273.15,
            feels_like_c: parse_or_zero(&current.feels_like_c),
            feels_like_f: parse_or_zero(&current.feels_like_f),
            humidity: parse_or_zero(&current.humidity),
            pressure: parse_or_zero(&current.pressure),
            cloud_cover: parse_or_zero(&current.cloud_cover),
            wind_speed_kmph: parse_or_zero(&current.wind_speed_kmph),
            visibility_km: parse_or_zero(&current.visibility),
            wind_dir: current.wind_dir.clone(),
            condition: first_value(&current.weather_desc),
            timestamp_ns,
        })
    }

    /// Human-readable block printed once per city per cycle.
    pub fn summary(&self) -> String {
        format!(
            "Location: {}, {}\n\
             Latitude: {}\n\
             Longitude: {}\n\
             Temperature (Celsius): {}°C\n\
             Temperature (Fahrenheit): {}°F\n\
             Temperature (Kelvin): {}K\n\
             Feels like: {}°C ({}°F)\n\
             Humidity: {}%\n\
             Pressure: {} hPa\n\
             Cloudcover: {}%\n\
             Condition: {}\n\
             Wind: {} km/h {}\n\
             Visibility: {} km",
            self.location,
            self.country,
            self.latitude,
            self.longitude,
            self.temp_c,
            self.temp_f,
            self.temp_k,
            self.feels_like_c,
            self.feels_like_f,
            self.humidity,
            self.pressure,
            self.cloud_cover,
            self.condition,
            self.wind_speed_kmph,
            self.wind_dir,
            self.visibility_km,
        )
    }
}

fn first_value(items: &[TextValue]) -> String {
    items
        .first()
        .map(|i| i.value.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "Unknown".to_owned())
}

fn parse_or_zero(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

fn unix_timestamp_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{retry_delay, WeatherReading, WttrClient, WttrReport};
    use reqwest::Client;
    use std::time::Duration;

    const REPORT_JSON: &str = r#"{
        "current_condition": [{
            "temp_C": "22",
            "temp_F": "72",
            "FeelsLikeC": "24",
            "FeelsLikeF": "75",
            "pressure": "1012",
            "cloudcover": "25",
            "windspeedKmph": "13",
            "winddir16Point": "NW",
            "visibility": "10",
            "weatherDesc": [{"value": "Partly cloudy"}]
        }],
        "nearest_area": [{
            "areaName": [{"value": "London"}],
            "country": [{"value": "United Kingdom"}],
            "latitude": "51.517",
            "longitude": "-0.106"
        }]
    }"#;

    fn test_client() -> WttrClient {
        WttrClient::new(Client::new(), "https://wttr.in/", 3)
    }

    #[test]
    fn weather_url_empty_location() {
        let url = test_client().weather_url("");
        assert_eq!("https://wttr.in/?format=j1", url.as_str());
    }

    #[test]
    fn weather_url_encodes_location() {
        let url = test_client().weather_url("New York City, NY");
        assert_eq!("https://wttr.in/New%20York%20City%2C%20NY?format=j1", url.as_str());
    }

    #[test]
    fn retry_delay_doubles() {
        assert_eq!(Duration::from_secs(1), retry_delay(0));
        assert_eq!(Duration::from_secs(2), retry_delay(1));
        assert_eq!(Duration::from_secs(4), retry_delay(2));
    }

    #[test]
    fn reading_from_report() {
        let report: WttrReport = serde_json::from_str(REPORT_JSON).unwrap();
        let reading = WeatherReading::from_report_at(&report, "London, UK", 1_700_000_000_000_000_000).unwrap();

        assert_eq!("London", reading.location);
        assert_eq!("United Kingdom", reading.country);
        assert_eq!("London, UK", reading.query);
        assert_eq!(22.0, reading.temp_c);
        assert!((reading.temp_k - (reading.temp_c + 273.15)).abs() < f64::EPSILON);
        // humidity is missing from the payload above and must normalize to zero
        assert_eq!(0.0, reading.humidity);
        assert_eq!(1_700_000_000_000_000_000, reading.timestamp_ns);
    }

    #[test]
    fn reading_requires_current_conditions() {
        let report: WttrReport = serde_json::from_str("{}").unwrap();
        assert!(WeatherReading::from_report_at(&report, "Nowhere", 0).is_none());
    }

    #[test]
    fn summary_round_trips_celsius() {
        let report: WttrReport = serde_json::from_str(REPORT_JSON).unwrap();
        let reading = WeatherReading::from_report_at(&report, "London, UK", 0).unwrap();
        let summary = reading.summary();

        assert!(summary.contains("Temperature (Celsius): 22°C"));
        assert!(summary.contains("Temperature (Kelvin): 295.15K"));
        assert!(summary.contains("Location: London, United Kingdom"));
        assert!(summary.contains("Wind: 13 km/h NW"));
    }
}
