//! CLI definitions using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Shadowplug - host shell for shadow-copied, hot-reloadable plugins
#[derive(Parser, Debug)]
#[command(name = "shadowplug")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (toml, yaml or json)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory that contains the Plugins directory
    #[arg(short = 'b', long)]
    pub base_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Load plugins, print the listing and exit
    #[arg(short, long)]
    pub list: bool,

    /// Output format for --list
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

/// Listing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["shadowplug", "-b", "/opt/app", "--list", "-o", "json"]);
        assert_eq!(cli.base_dir, Some(PathBuf::from("/opt/app")));
        assert!(cli.list);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(!cli.verbose);
    }
}
