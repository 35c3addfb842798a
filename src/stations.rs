use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::Url;
use serde::Deserialize;
use std::path::Path;

const BUNDLED_STATIONS: &str = include_str!("../resources/station-list.json");

/// A named radio stream. Built once by the loader and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationDescriptor {
    pub name: String,
    pub stream_url: Url,
}

impl StationDescriptor {
    pub fn new(name: impl Into<String>, stream_url: Url) -> Self {
        Self {
            name: name.into(),
            stream_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StationEntry {
    name: Option<String>,
    streamurl: Option<String>,
}

/// Stations compiled into the binary.
pub fn bundled_stations() -> Vec<StationDescriptor> {
    stations_or_empty(BUNDLED_STATIONS)
}

fn stations_or_empty(content: &str) -> Vec<StationDescriptor> {
    match parse_station_list(content) {
        Ok(stations) => stations,
        Err(err) => {
            warn!("Bundled station list is broken, starting with none: {:#}", err);
            Vec::new()
        }
    }
}

pub fn load_station_file(path: &Path) -> Result<Vec<StationDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read station list {}", path.display()))?;
    parse_station_list(&content)
        .with_context(|| format!("station list {} is not a JSON array", path.display()))
}

/// Parse `[{"name": .., "streamurl": ..}, ..]`, keeping the file order.
///
/// Entries with a missing name, a missing URL, or a URL that is not an
/// http(s) network location are skipped.
pub fn parse_station_list(content: &str) -> Result<Vec<StationDescriptor>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(content)?;

    let stations = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            let station = serde_json::from_value::<StationEntry>(value)
                .ok()
                .and_then(station_from_entry);
            if station.is_none() {
                debug!("Skipping malformed station entry #{}", index);
            }
            station
        })
        .collect();

    Ok(stations)
}

fn station_from_entry(entry: StationEntry) -> Option<StationDescriptor> {
    let name = entry.name.filter(|n| !n.trim().is_empty())?;
    let url = Url::parse(entry.streamurl?.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return None;
    }
    Some(StationDescriptor::new(name, url))
}
