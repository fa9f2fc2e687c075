use crate::error::{Result, ValidationError};
use crate::geometry::{self, Bbox};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};
use url::Url;

pub const SEARCH_API: &str = "https://api.daac.asf.alaska.edu/services/search/param";

const PROCESSING_LEVEL: &str = "SLC";
const OUTPUT_FORMAT: &str = "geojson";
// Only Sentinel-1 interferometric wide swath is supported
const PLATFORM: &str = "S1";
const BEAM_MODE: &str = "IW";

pub const DEFAULT_MAX_RESULTS: u32 = 2000;
pub const DEFAULT_POLARIZATION: &str = "vv";
const DEFAULT_OUT_DIR: &str = "data";
const DEFAULT_ORBIT_DIR: &str = "orbits";
const URL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlightDirection {
    Ascending,
    Descending,
}

impl FlightDirection {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ascending => "ASCENDING",
            Self::Descending => "DESCENDING",
        }
    }
}

impl FromStr for FlightDirection {
    type Err = ValidationError;

    /// Accepts any case-insensitive value starting with "a" or "d",
    /// so "A", "asc" and "ASCENDING" are all equivalent.
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let lower = value.trim().to_lowercase();
        if lower.starts_with('a') {
            Ok(Self::Ascending)
        } else if lower.starts_with('d') {
            Ok(Self::Descending)
        } else {
            Err(ValidationError::FlightDirection(value.to_string()))
        }
    }
}

impl fmt::Display for FlightDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the search region came from.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionSource {
    Bbox(Bbox),
    Dem(PathBuf),
    WktFile(PathBuf),
}

impl RegionSource {
    /// Picks the canonical source. A DEM wins over a WKT file, which wins over
    /// an explicit bbox.
    fn select(bbox: Option<Bbox>, dem: Option<PathBuf>, wkt_file: Option<PathBuf>) -> Option<Self> {
        if let Some(dem) = dem {
            Some(Self::Dem(dem))
        } else if let Some(wkt_file) = wkt_file {
            Some(Self::WktFile(wkt_file))
        } else {
            bbox.map(Self::Bbox)
        }
    }

    pub fn resolve(&self) -> Result<Bbox> {
        let bbox = match self {
            Self::Bbox(bbox) => *bbox,
            Self::Dem(path) => geometry::bbox_from_raster(path)?,
            Self::WktFile(path) => geometry::bbox_from_wkt(path)?,
        };
        Ok(bbox)
    }
}

/// Unvalidated query fields, as read from a TOML file or collected from the CLI.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueryInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dem: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wkt_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(alias = "relativeOrbit", skip_serializing_if = "Option::is_none")]
    pub track: Option<u32>,
    #[serde(alias = "flightDirection", skip_serializing_if = "Option::is_none")]
    pub flight_direction: Option<String>,
    #[serde(alias = "maxResults", skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unzip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orbit_dir: Option<PathBuf>,
    /// Archive member filter. An empty string keeps every member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polarization: Option<String>,
}

impl QueryInput {
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let input: Self = toml::from_str(&content)?;
        Ok(input)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Fields set in `other` replace the ones in `self`. The region fields
    /// (`bbox`, `dem`, `wkt_file`) are replaced together: any of them in
    /// `other` drops every region field of `self`.
    pub fn merge(self, other: QueryInput) -> Self {
        let (bbox, dem, wkt_file) = if other.has_region() {
            (other.bbox, other.dem, other.wkt_file)
        } else {
            (self.bbox, self.dem, self.wkt_file)
        };
        Self {
            out_dir: other.out_dir.or(self.out_dir),
            bbox,
            dem,
            wkt_file,
            start: other.start.or(self.start),
            end: other.end.or(self.end),
            track: other.track.or(self.track),
            flight_direction: other.flight_direction.or(self.flight_direction),
            max_results: other.max_results.or(self.max_results),
            unzip: other.unzip.or(self.unzip),
            orbit_dir: other.orbit_dir.or(self.orbit_dir),
            polarization: other.polarization.or(self.polarization),
        }
    }

    fn has_region(&self) -> bool {
        self.bbox.is_some() || self.dem.is_some() || self.wkt_file.is_some()
    }
}

/// A validated Sentinel-1 search request. Read-only once built; build a new
/// one to change any parameter.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    output_dir: PathBuf,
    region: RegionSource,
    bbox: Bbox,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    track: Option<u32>,
    flight_direction: Option<FlightDirection>,
    max_results: u32,
    unzip: bool,
    orbit_dir: PathBuf,
    polarization: Option<String>,
    search_url: Url,
}

impl QueryConfig {
    /// Validates `input` in a fixed order: field parsing, region selection,
    /// region resolution, then the date range check. The search URL is
    /// computed once at the end.
    pub fn new(input: QueryInput) -> Result<Self> {
        let start = input.start.as_deref().map(parse_datetime).transpose()?;
        let end = input.end.as_deref().map(parse_datetime).transpose()?;
        let flight_direction = input
            .flight_direction
            .as_deref()
            .map(FlightDirection::from_str)
            .transpose()?;
        let output_dir = absolute(input.out_dir.unwrap_or_else(|| DEFAULT_OUT_DIR.into()))?;
        let orbit_dir = absolute(input.orbit_dir.unwrap_or_else(|| DEFAULT_ORBIT_DIR.into()))?;
        let explicit_bbox = input.bbox.as_deref().map(bbox_from_values).transpose()?;

        let sources = [explicit_bbox.is_some(), input.dem.is_some(), input.wkt_file.is_some()];
        if sources.iter().filter(|given| **given).count() > 1 {
            warn!("Several region sources given; using dem, then wkt_file, then bbox");
        }
        let region = RegionSource::select(explicit_bbox, input.dem, input.wkt_file)
            .ok_or(ValidationError::MissingRegion)?;
        let bbox = region.resolve()?;
        debug!(?region, ?bbox, "Resolved search region");

        check_date_range(start, end)?;

        let polarization = match input.polarization {
            Some(p) if p.is_empty() => None,
            Some(p) => Some(p),
            None => Some(DEFAULT_POLARIZATION.to_string()),
        };

        let max_results = input.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let search_url = form_url(&bbox, start, end, input.track, flight_direction, max_results);

        Ok(Self {
            output_dir,
            region,
            bbox,
            start,
            end,
            track: input.track,
            flight_direction,
            max_results,
            unzip: input.unzip.unwrap_or(true),
            orbit_dir,
            polarization,
            search_url,
        })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn region(&self) -> &RegionSource {
        &self.region
    }

    pub fn bbox(&self) -> Bbox {
        self.bbox
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn track(&self) -> Option<u32> {
        self.track
    }

    pub fn flight_direction(&self) -> Option<FlightDirection> {
        self.flight_direction
    }

    pub fn max_results(&self) -> u32 {
        self.max_results
    }

    pub fn unzip(&self) -> bool {
        self.unzip
    }

    pub fn orbit_dir(&self) -> &Path {
        &self.orbit_dir
    }

    /// `None` means every archive member is extracted.
    pub fn polarization(&self) -> Option<&str> {
        self.polarization.as_deref()
    }

    /// Converts back into the raw form, e.g. for saving with [`QueryInput::write`].
    ///
    /// Only the canonical region source is written, so a saved DEM or WKT
    /// query is resolved again from its file when read back.
    pub fn to_input(&self) -> QueryInput {
        let (bbox, dem, wkt_file) = match &self.region {
            RegionSource::Bbox(bbox) => (Some(bbox.to_array().to_vec()), None, None),
            RegionSource::Dem(path) => (None, Some(path.clone()), None),
            RegionSource::WktFile(path) => (None, None, Some(path.clone())),
        };
        QueryInput {
            out_dir: Some(self.output_dir.clone()),
            bbox,
            dem,
            wkt_file,
            start: self.start.map(|t| t.format(URL_TIME_FORMAT).to_string()),
            end: self.end.map(|t| t.format(URL_TIME_FORMAT).to_string()),
            track: self.track,
            flight_direction: self.flight_direction.map(|d| d.to_string()),
            max_results: Some(self.max_results),
            unzip: Some(self.unzip),
            orbit_dir: Some(self.orbit_dir.clone()),
            polarization: Some(self.polarization.clone().unwrap_or_default()),
        }
    }
}

/// Only the parameters that are set are included.
fn form_url(
    bbox: &Bbox,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    track: Option<u32>,
    flight_direction: Option<FlightDirection>,
    max_results: u32,
) -> Url {
    let mut params: Vec<(&str, String)> = vec![("bbox", bbox.to_query_value())];
    if let Some(start) = start {
        params.push(("start", start.format(URL_TIME_FORMAT).to_string()));
    }
    if let Some(end) = end {
        params.push(("end", end.format(URL_TIME_FORMAT).to_string()));
    }
    params.push(("processingLevel", PROCESSING_LEVEL.to_string()));
    if let Some(track) = track {
        params.push(("relativeOrbit", track.to_string()));
    }
    if let Some(direction) = flight_direction {
        params.push(("flightDirection", direction.to_string()));
    }
    params.push(("maxResults", max_results.to_string()));
    params.push(("output", OUTPUT_FORMAT.to_string()));
    params.push(("platform", PLATFORM.to_string()));
    params.push(("beamMode", BEAM_MODE.to_string()));

    let query = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    let mut url = Url::parse(SEARCH_API).expect("Search API url should always parse");
    url.set_query(Some(&query));
    url
}

/// Parses a date (`2020-01-01`, taken as midnight UTC) or a full timestamp.
/// Timestamps with an offset are converted to UTC; ones without are taken as UTC.
pub fn parse_datetime(value: &str) -> std::result::Result<DateTime<Utc>, ValidationError> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(datetime.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    Err(ValidationError::Date(value.to_string()))
}

fn check_date_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> std::result::Result<(), ValidationError> {
    match (start, end) {
        (Some(start), Some(end)) if end < start => Err(ValidationError::InvertedDateRange {
            start: start.to_rfc3339(),
            end: end.to_rfc3339(),
        }),
        _ => Ok(()),
    }
}

fn bbox_from_values(values: &[f64]) -> std::result::Result<Bbox, ValidationError> {
    let values: [f64; 4] = values
        .try_into()
        .map_err(|_| ValidationError::BboxLength(values.len()))?;
    Ok(Bbox::from(values))
}

/// Absolute form of `path` with `.` and `..` folded away. Lexical only: the
/// filesystem is not touched and symlinks are not followed.
fn absolute(path: PathBuf) -> std::result::Result<PathBuf, ValidationError> {
    let absolute = std::path::absolute(&path).map_err(|e| ValidationError::Path {
        path,
        message: e.to_string(),
    })?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}
