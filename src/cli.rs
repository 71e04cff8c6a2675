use std::path::PathBuf;

use clap::{crate_authors, crate_description, crate_name, crate_version, Parser};

#[derive(Parser)]
#[clap(name = crate_name!(), about = crate_description!())]
#[clap(version = crate_version!(), author = crate_authors!())]
pub struct Opts {
    /// More logging (repeat for trace).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Only log errors.
    #[clap(short = 'q', long, global = true)]
    pub quiet: bool,
    /// Sub-commands (see below).
    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Debug, Parser)]
pub enum SubCommand {
    /// Monitor a recorded track against a markers file.
    Replay(ReplayOpts),
    /// Take one position fix from a recorded track.
    Locate {
        /// Track file, one JSON reading per line.
        #[clap(short = 't', long)]
        track: PathBuf,
        /// Directory holding settings.json.
        #[clap(short = 's', long)]
        settings_dir: Option<PathBuf>,
    },
    /// Great-circle distance in km between two points.
    #[clap(allow_negative_numbers = true)]
    Distance {
        lat1: f64,
        lon1: f64,
        lat2: f64,
        lon2: f64,
    },
}

#[derive(Debug, Parser)]
pub struct ReplayOpts {
    /// Track file, one JSON reading per line.
    #[clap(short = 't', long)]
    pub track: PathBuf,
    /// Markers file, a JSON array. Watched for changes.
    #[clap(short = 'm', long)]
    pub markers: PathBuf,
    /// Directory holding settings.json.
    #[clap(short = 's', long)]
    pub settings_dir: Option<PathBuf>,
    /// Replay speed factor, 0 replays without pausing.
    #[clap(long, default_value_t = 1.0)]
    pub speed: f64,
    /// Append audit events to this JSON lines file.
    #[clap(short = 'a', long)]
    pub audit: Option<PathBuf>,
    /// Answer the location permission prompt with "deny".
    #[clap(long)]
    pub deny_location: bool,
}
