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

use crate::client::WeatherReading;
use crate::token::Credential;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;
use std::fmt::Write as _;

const MEASUREMENT: &str = "weather";
const LINE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug)]
pub enum WriteError {
    Internal(reqwest::Error),
    NonFinite(&'static str, f64),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::NonFinite(field, value) => write!(f, "non-finite value {} for field {}", value, field),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for WriteError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Writer for the InfluxDB v2 `/api/v2/write` line-protocol endpoint.
///
/// Encoding and transmission are separate steps so a reading that fails
/// validation never produces a partial write. The write itself is a single
/// POST per reading and is not retried; a failed write is reported to the
/// caller and the next cycle starts over with a freshly resolved token.
#[derive(Debug)]
pub struct InfluxWriter {
    client: Client,
    base_url: Url,
    org: String,
    bucket: String,
}

impl InfluxWriter {
    pub fn new(client: Client, base_url: &str, org: &str, bucket: &str) -> Self {
        InfluxWriter {
            client,
            // TODO(56quarters): Handle this better
            base_url: Url::parse(base_url).unwrap(),
            org: org.to_owned(),
            bucket: bucket.to_owned(),
        }
    }

    pub async fn write(&self, credential: &Credential, reading: &WeatherReading) -> Result<(), WriteError> {
        let line = encode_line(reading)?;
        let url = self.write_url();
        tracing::debug!(
            message = "writing line protocol record",
            url = %url,
            token_source = %credential.source,
            num_bytes = line.len(),
        );

        let res = self
            .client
            .post(url.clone())
            .header(AUTHORIZATION, format!("Token {}", credential.token))
            .header(CONTENT_TYPE, LINE_CONTENT_TYPE)
            .body(line)
            .send()
            .await
            .map_err(WriteError::Internal)?;

        let status = res.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WriteError::Unexpected(status, url))
        }
    }

    fn write_url(&self) -> Url {
        let mut url = self.base_url.clone();
        {
            url.path_segments_mut()
                .map(|mut p| {
                    p.clear().push("api").push("v2").push("write");
                })
                .expect("unable to modify write URL path segments");
        }

        url.query_pairs_mut()
            .append_pair("org", &self.org)
            .append_pair("bucket", &self.bucket)
            .append_pair("precision", "ns");
        url
    }
}

/// Encode a reading as a single line-protocol record.
///
/// Every field value is written as a bare float, never with the integer
/// suffix, so the column type stays consistent across writes no matter what
/// the upstream API returned. Rejects the whole reading if any field is
/// `NaN` or infinite.
pub fn encode_line(reading: &WeatherReading) -> Result<String, WriteError> {
    let fields = [
        ("temperature_celsius", reading.temp_c),
        ("temperature_fahrenheit", reading.temp_f),
        ("temperature_kelvin", reading.temp_k),
        ("humidity", reading.humidity),
        ("pressure", reading.pressure),
        ("cloudcover", reading.cloud_cover),
        ("wind_speed_kmph", reading.wind_speed_kmph),
        ("visibility_km", reading.visibility_km),
        ("feels_like_celsius", reading.feels_like_c),
        ("feels_like_fahrenheit", reading.feels_like_f),
        ("latitude", reading.latitude),
        ("longitude", reading.longitude),
    ];

    for (name, value) in fields {
        if !value.is_finite() {
            return Err(WriteError::NonFinite(name, value));
        }
    }

    // The a_ prefix keeps the location tag sorting first, which existing
    // dashboards group by.
    let mut line = format!(
        "{},a_location={},country={},query_location={}",
        MEASUREMENT,
        escape_tag_value(&reading.location),
        escape_tag_value(&reading.country),
        escape_tag_value(&reading.query),
    );

    for (i, (name, value)) in fields.iter().enumerate() {
        let sep = if i == 0 { ' ' } else { ',' };
        write!(line, "{}{}={}", sep, name, value).expect("writing to a String cannot fail");
    }

    write!(line, " {}", reading.timestamp_ns).expect("writing to a String cannot fail");
    Ok(line)
}

/// Escape a value for tag position: spaces, commas, equals signs, and quotes
/// get a backslash prefix. Empty values become `Unknown` so the tag is never
/// dropped from the series key.
fn escape_tag_value(value: &str) -> String {
    if value.is_empty() || value == "Unknown" {
        return "Unknown".to_owned();
    }

    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' | ',' | '=' | '"' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }

    escaped
}

#[cfg(test)]
mod tests {
    use super::{encode_line, escape_tag_value, InfluxWriter, WriteError};
    use crate::client::WeatherReading;
    use reqwest::Client;

    fn reading() -> WeatherReading {
        WeatherReading {
            location: "New York, NY".to_owned(),
            country: "United States of America".to_owned(),
            query: "New York City, NY".to_owned(),
            latitude: 40.714,
            longitude: -74.006,
            temp_c: 22.0,
            temp_f: 72.0,
            temp_k: 295.15,
            feels_like_c: 24.0,
            feels_like_f: 75.0,
            humidity: 0.0,
            pressure: 1012.0,
            cloud_cover: 25.0,
            wind_speed_kmph: 13.0,
            visibility_km: 10.0,
            wind_dir: "NW".to_owned(),
            condition: "Partly cloudy".to_owned(),
            timestamp_ns: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn escape_tag_value_specials() {
        assert_eq!("New\\ York\\,\\ NY", escape_tag_value("New York, NY"));
        assert_eq!("a\\=b", escape_tag_value("a=b"));
        assert_eq!("say\\\"hi\\\"", escape_tag_value("say\"hi\""));
    }

    #[test]
    fn escape_tag_value_empty_becomes_unknown() {
        assert_eq!("Unknown", escape_tag_value(""));
        assert_eq!("Unknown", escape_tag_value("Unknown"));
    }

    #[test]
    fn encode_line_shape() {
        let line = encode_line(&reading()).unwrap();

        assert!(line.starts_with(
            "weather,a_location=New\\ York\\,\\ NY,country=United\\ States\\ of\\ America,query_location=New\\ York\\ City\\,\\ NY "
        ));
        assert!(line.ends_with(" 1700000000000000000"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn encode_line_fields_are_floats_without_suffix() {
        let line = encode_line(&reading()).unwrap();

        assert!(line.contains("temperature_celsius=22,"));
        assert!(line.contains("temperature_kelvin=295.15,"));
        assert!(line.contains("latitude=40.714,"));
        assert!(line.contains("longitude=-74.006 "));
        assert!(!line.contains("=22i"), "no integer-suffixed fields expected: {}", line);
        assert!(!line.contains("=1012i"), "no integer-suffixed fields expected: {}", line);
    }

    #[test]
    fn encode_line_defaults_missing_humidity_to_zero() {
        let line = encode_line(&reading()).unwrap();
        assert!(line.contains("humidity=0,"));
    }

    #[test]
    fn encode_line_rejects_non_finite_values() {
        let mut bad = reading();
        bad.pressure = f64::NAN;

        match encode_line(&bad) {
            Err(WriteError::NonFinite(field, _)) => assert_eq!("pressure", field),
            other => panic!("expected NonFinite error, got {:?}", other),
        }
    }

    #[test]
    fn write_url_includes_org_bucket_and_precision() {
        let writer = InfluxWriter::new(Client::new(), "http://localhost:8086", "nflx", "default");
        let url = writer.write_url();

        assert_eq!(
            "http://localhost:8086/api/v2/write?org=nflx&bucket=default&precision=ns",
            url.as_str()
        );
    }
}
