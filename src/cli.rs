use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "matrix-bridge-core", version, about = "Matrix bridge core service")]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check_config: bool,
}
