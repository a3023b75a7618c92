//! Command-line interface definitions.
//!
//! Every option can also be supplied through an environment variable.

use std::path::PathBuf;

use clap::Parser;

/// Mirror a news site's article feed to a Reddit community.
///
/// # Examples
///
/// ```sh
/// # Poll forever with the default files
/// feed2reddit -c feed2reddit.yaml -d .data
///
/// # One cycle, uncompressed stores, no flair check
/// feed2reddit --once --plain --skip-category-check
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "FEED2REDDIT_CONFIG", default_value = "feed2reddit.yaml")]
    pub config: PathBuf,

    /// Directory holding the article and projection stores
    #[arg(short, long, env = "FEED2REDDIT_DATA_DIR", default_value = ".data")]
    pub data_dir: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Skip the category / flair / automoderator consistency check
    #[arg(long)]
    pub skip_category_check: bool,

    /// Store plain JSON instead of gzip-compressed JSON
    #[arg(long)]
    pub plain: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["feed2reddit"]);

        assert_eq!(cli.config, PathBuf::from("feed2reddit.yaml"));
        assert_eq!(cli.data_dir, PathBuf::from(".data"));
        assert!(!cli.once);
        assert!(!cli.plain);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from([
            "feed2reddit",
            "-c",
            "/etc/feed2reddit.yaml",
            "-d",
            "/var/lib/feed2reddit",
            "--once",
            "--skip-category-check",
        ]);

        assert_eq!(cli.config, PathBuf::from("/etc/feed2reddit.yaml"));
        assert_eq!(cli.data_dir, PathBuf::from("/var/lib/feed2reddit"));
        assert!(cli.once);
        assert!(cli.skip_category_check);
    }
}
