use crate::download::{Aria2c, DownloadOrchestrator};
use crate::query::{QueryConfig, QueryInput};
use crate::search::{AsfApi, SearchClient, SearchResult};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

const NETRC_HELP: &str = "\
Downloads go through aria2c and need Earthdata credentials in ~/.netrc:

    machine urs.earthdata.nasa.gov
        login <user>
        password <password>";

/// Search the ASF archive for Sentinel-1 SLC scenes and download them.
#[derive(Parser, Debug)]
#[command(version, after_help = NETRC_HELP)]
pub struct Args {
    /// TOML file with query fields; flags given on the command line take precedence
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Directory for downloaded files [default: ./data]
    #[arg(long, short)]
    pub out_dir: Option<PathBuf>,

    /// Bounding box of the area of interest, e.g. --bbox -106.1 30.1 -103.1 33.1
    #[arg(
        long,
        num_args = 4,
        value_names = ["LEFT", "BOTTOM", "RIGHT", "TOP"],
        allow_negative_numbers = true
    )]
    pub bbox: Option<Vec<f64>>,

    /// GeoTIFF DEM whose extent is used as the bbox
    #[arg(long)]
    pub dem: Option<PathBuf>,

    /// File with a WKT polygon to search within
    #[arg(long)]
    pub wkt_file: Option<PathBuf>,

    /// Starting date for the query (recommended: YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<String>,

    /// Ending date for the query (recommended: YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<String>,

    /// Limit to one path / relative orbit
    #[arg(long, visible_alias = "relativeOrbit")]
    pub track: Option<u32>,

    /// Satellite orbit direction during acquisition (A, D, ASCENDING, DESCENDING)
    #[arg(long, visible_alias = "flightDirection")]
    pub flight_direction: Option<String>,

    /// Limit on the number of products returned [default: 2000]
    #[arg(long, visible_alias = "maxResults")]
    pub max_results: Option<u32>,

    /// Keep downloaded archives zipped
    #[arg(long)]
    pub no_unzip: bool,

    /// Only extract archive members containing this string; "" keeps everything [default: vv]
    #[arg(long)]
    pub polarization: Option<String>,

    /// Directory for orbit files [default: ./orbits]
    #[arg(long)]
    pub orbit_dir: Option<PathBuf>,

    /// Directory for the downloader's log file
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,

    /// Write the validated query to this TOML file
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// Print the available scenes without downloading
    #[arg(long)]
    pub query_only: bool,

    /// Log debug output
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// The query fields given as flags.
    pub fn to_input(&self) -> QueryInput {
        QueryInput {
            out_dir: self.out_dir.clone(),
            bbox: self.bbox.clone(),
            dem: self.dem.clone(),
            wkt_file: self.wkt_file.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            track: self.track,
            flight_direction: self.flight_direction.clone(),
            max_results: self.max_results,
            unzip: self.no_unzip.then_some(false),
            orbit_dir: self.orbit_dir.clone(),
            polarization: self.polarization.clone(),
        }
    }

    pub fn query_config(&self) -> Result<QueryConfig> {
        let input = match &self.config {
            Some(path) => QueryInput::read(path)?,
            None => QueryInput::default(),
        };
        let config = QueryConfig::new(input.merge(self.to_input()))?;
        Ok(config)
    }
}

pub async fn run(args: Args) -> Result<()> {
    let config = args.query_config()?;
    if let Some(path) = &args.save_config {
        config.to_input().write(path)?;
        info!(?path, "Saved query");
    }

    let client = SearchClient::new(AsfApi::new());
    let result = client.query(config.search_url()).await?;

    if args.query_only {
        print_result(&result);
        return Ok(());
    }

    let orchestrator =
        DownloadOrchestrator::from_config(Aria2c::new(), &config).with_log_dir(&args.log_dir);
    let files = orchestrator.download(&result, config.output_dir()).await?;
    for file in files {
        println!("{}", file.display());
    }
    Ok(())
}

fn print_result(result: &SearchResult) {
    for feature in result.features() {
        println!("{}\t{}", feature.file_name, feature.download_url);
    }
    println!("{} scenes found", result.len());
}
