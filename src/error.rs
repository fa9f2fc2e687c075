use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("No results found for query")]
    EmptyResult,

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// Malformed or contradictory query configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Must provide a bbox or a dem or a wkt_file")]
    MissingRegion,

    #[error("End ({end}) must be after start ({start})")]
    InvertedDateRange { start: String, end: String },

    #[error("Unrecognized flight direction '{0}', expected ASCENDING or DESCENDING")]
    FlightDirection(String),

    #[error("Unable to parse '{0}' as a date or datetime")]
    Date(String),

    #[error("Unable to resolve absolute path for {path:?}: {message}")]
    Path { path: PathBuf, message: String },

    #[error("Bounding box must have 4 values (left, bottom, right, top), got {0}")]
    BboxLength(usize),
}

/// Unreadable or unparseable region source.
#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("Unable to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to read raster {path:?}: {source}")]
    Raster {
        path: PathBuf,
        source: tiff::TiffError,
    },

    #[error("Raster {0:?} has no georeferencing tags")]
    NotGeoreferenced(PathBuf),

    #[error("Unable to parse WKT in {path:?}: {message}")]
    Wkt { path: PathBuf, message: String },

    #[error("Geometry in {0:?} is empty")]
    EmptyGeometry(PathBuf),
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },

    #[error("Search request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Unable to parse search response from {url}: {source}")]
    Parse {
        url: String,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to start {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}, see {log:?}")]
    ExitStatus {
        tool: String,
        status: std::process::ExitStatus,
        log: PathBuf,
    },
}

/// Corrupt or unreadable archive. Carries the offending archive path.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unable to open archive {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt archive {path:?}: {source}")]
    Zip {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[error("Unable to extract {member} from {archive:?}: {source}")]
    Member {
        archive: PathBuf,
        member: String,
        source: std::io::Error,
    },

    #[error("Unable to write {path:?} while extracting {archive:?}: {source}")]
    Write {
        archive: PathBuf,
        path: PathBuf,
        source: std::io::Error,
    },
}
