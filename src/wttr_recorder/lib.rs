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

//! wttr.in weather poller that records readings to InfluxDB v2
//!
//! ## Features
//!
//! `wttr_recorder` fetches current conditions for a list of cities from the [wttr.in]
//! JSON API on a fixed interval, prints a summary for each, and writes one
//! line-protocol record per city to an InfluxDB v2 write endpoint. Records use the
//! `weather` measurement with the location, country, and original query string as
//! tags and all numeric readings (temperatures in three scales, humidity, pressure,
//! cloud cover, wind speed, visibility, feels-like temperatures, coordinates) as
//! float fields.
//!
//! The InfluxDB token does not need to be provisioned ahead of time. On every write
//! the recorder resolves one from the first source that works:
//!
//! * A token passed via `--token` or `INFLUXDB_TOKEN`.
//! * A `KEY=value` style file mounted at `--token-file` (or `/tmp/extracted_token`).
//! * A cookie-session sign-in with `--username`/`--password`, reusing any active
//!   authorization on the server or creating a new one.
//! * A basic-auth lookup of the current user followed by creating an authorization
//!   for it.
//! * Optionally (`--allow-password-token`), probing whether the server accepts the
//!   raw password in token position. Off by default since it reuses a human
//!   credential as a service token.
//!
//! [wttr.in]: https://github.com/chubin/wttr.in
//!
//! ## Build
//!
//! `wttr_recorder` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/wttr_recorder.git && cd wttr_recorder
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! Point the recorder at an InfluxDB instance and let the city list default:
//!
//! ```text
//! ./wttr_recorder --influxdb-url http://localhost:8086 --username admin --password hunter2
//! ```
//!
//! Or record specific cities with a pre-provisioned token:
//!
//! ```text
//! INFLUXDB_TOKEN=abc123 ./wttr_recorder --city "Boston, MA" --city "Tokyo, JP"
//! ```
//!
//! The recorder runs until it receives SIGINT or SIGTERM. Failures to fetch,
//! authenticate, or write are logged and skipped; no cycle aborts the process.
//!

pub mod client;
pub mod influx;
pub mod token;
