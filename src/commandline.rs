use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "imacmon.yaml";

const fn about_text() -> &'static str {
    "iMAC2 monitor - Poll a remote tripping station over Modbus RTU/TCP and print its data."
}

#[derive(Parser, Debug)]
#[command(name = "imacmon", author, version, about = about_text(), long_about = None)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The YAML configuration file with the controller identity and its interfaces.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, verbatim_doc_comment)]
    pub config: PathBuf,

    /// Overrides the poll interval of the configuration.
    /// Examples: "1s", "500ms".
    #[arg(long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub poll_interval: Option<Duration>,
}
