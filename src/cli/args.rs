//! CLI argument definitions using clap derive

use crate::remote::DestinationKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// attach-cache - content-addressed upload cache
///
/// Resolves local files to remote file identifiers per destination,
/// uploading each distinct content at most once.
#[derive(Parser, Debug)]
#[command(name = "attach-cache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "ATTACH_CACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve files to remote identifiers, uploading on a miss
    Resolve(ResolveArgs),

    /// Check that a file's cached identifier still exists remotely
    Verify(VerifyArgs),

    /// Inspect and maintain the upload cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Files to resolve
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Destinations (comma-separated): execution-sandbox, search-index, user-data
    #[arg(short, long, value_delimiter = ',', default_value = "user-data")]
    pub dest: Vec<DestinationKind>,

    /// Ignore the cache and upload every file
    #[arg(long)]
    pub no_cache: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// File to verify
    pub path: PathBuf,

    /// Destination to check
    #[arg(short, long, default_value = "user-data")]
    pub dest: DestinationKind,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.ttl_days)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry counts and recorded sizes
    Stats {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List cache entries, most recently used first
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove entries older than the retention window
    Gc {
        /// Remove entries older than N days (default: cache.ttl_days)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cache entry and path signature
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the cache database path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_resolve_with_destinations() {
        let cli = Cli::parse_from([
            "attach-cache",
            "resolve",
            "a.csv",
            "b.pdf",
            "--dest",
            "exec,search",
        ]);
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.paths, vec![PathBuf::from("a.csv"), PathBuf::from("b.pdf")]);
                assert_eq!(
                    args.dest,
                    vec![DestinationKind::ExecutionSandbox, DestinationKind::SearchIndex]
                );
                assert!(!args.no_cache);
                assert_eq!(args.format, OutputFormat::Table);
            }
            _ => panic!("expected Resolve command"),
        }
    }

    #[test]
    fn cli_resolve_defaults_to_user_data() {
        let cli = Cli::parse_from(["attach-cache", "resolve", "a.csv"]);
        match cli.command {
            Commands::Resolve(args) => assert_eq!(args.dest, vec![DestinationKind::UserData]),
            _ => panic!("expected Resolve command"),
        }
    }

    #[test]
    fn cli_resolve_requires_a_path() {
        assert!(Cli::try_parse_from(["attach-cache", "resolve"]).is_err());
    }

    #[test]
    fn cli_rejects_unknown_destination() {
        assert!(Cli::try_parse_from(["attach-cache", "resolve", "a", "--dest", "ftp"]).is_err());
    }

    #[test]
    fn cli_parses_verify() {
        let cli = Cli::parse_from(["attach-cache", "verify", "a.csv", "-d", "search-index"]);
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.path, PathBuf::from("a.csv"));
                assert_eq!(args.dest, DestinationKind::SearchIndex);
            }
            _ => panic!("expected Verify command"),
        }
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["attach-cache", "cache", "gc", "--days", "3", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
            }) => {
                assert_eq!(days, Some(3));
                assert!(dry_run);
            }
            _ => panic!("expected cache gc"),
        }
    }

    #[test]
    fn cli_parses_cache_clear() {
        let cli = Cli::parse_from(["attach-cache", "cache", "clear", "-y"]);
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheArgs {
                action: CacheAction::Clear { yes: true }
            })
        ));
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::parse_from(["attach-cache", "config", "set", "cache.ttl_days", "7"]);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Set { key, value }),
            }) => {
                assert_eq!(key, "cache.ttl_days");
                assert_eq!(value, "7");
            }
            _ => panic!("expected config set"),
        }
    }

    #[test]
    fn cli_verbose_counts() {
        let cli = Cli::parse_from(["attach-cache", "-vv", "cache", "path"]);
        assert_eq!(cli.verbose, 2);
    }
}
