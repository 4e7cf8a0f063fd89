use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use libris_api_types::BookId;

/// Command-line arguments for the libris-sync binary.
#[derive(Debug, Parser)]
#[command(name = "libris-sync", version, about = "Libris digital library client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LIBRIS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    /// Serve from a built-in sample catalogue instead of the backend.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the backend base URL.
    #[arg(long = "base-url", env = "LIBRIS_BASE_URL", value_name = "URL")]
    pub base_url: Option<String>,

    /// Override the bearer token sent with every request.
    #[arg(long = "token", env = "LIBRIS_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Override the request timeout.
    #[arg(long = "timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the preferences file location.
    #[arg(long = "preferences-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub preferences_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List books; filters come from a listing URL query string.
    Books(BooksArgs),
    /// Show one book.
    Book {
        #[arg(value_name = "ID")]
        id: BookId,
    },
    /// Favorites of the signed-in user.
    Favorites {
        #[command(subcommand)]
        command: FavoritesCommand,
    },
    /// Recommendation feeds.
    Feed {
        #[command(subcommand)]
        command: FeedCommand,
    },
    /// Persisted preferences.
    Prefs {
        #[command(subcommand)]
        command: PrefsCommand,
    },
}

#[derive(Debug, Args, Default, Clone)]
pub struct BooksArgs {
    /// Listing query string, e.g. `q=dune&category=roman&page=1`.
    #[arg(long = "url", value_name = "QUERY", default_value = "")]
    pub url: String,
}

#[derive(Debug, Subcommand, Clone)]
pub enum FavoritesCommand {
    List,
    Toggle {
        #[arg(value_name = "ID")]
        id: BookId,
    },
    Clear,
}

#[derive(Debug, Subcommand, Clone)]
pub enum FeedCommand {
    Home,
    Discover {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Similar {
        #[arg(value_name = "ID")]
        id: BookId,
        #[arg(long, default_value_t = 6)]
        limit: u32,
    },
    Stats,
}

#[derive(Debug, Subcommand, Clone)]
pub enum PrefsCommand {
    Show,
    Theme {
        #[arg(value_name = "THEME")]
        theme: String,
    },
    PageSize {
        #[arg(value_name = "SIZE")]
        size: u32,
    },
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_books_with_url() {
        let args = CliArgs::parse_from(["libris-sync", "books", "--url", "q=dune&page=2"]);
        match args.command {
            Command::Books(books) => assert_eq!(books.url, "q=dune&page=2"),
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_global_overrides() {
        let args = CliArgs::parse_from([
            "libris-sync",
            "--base-url",
            "http://backend:8083/api/",
            "--offline",
            "favorites",
            "toggle",
            "42",
        ]);
        assert!(args.offline);
        assert_eq!(
            args.overrides.base_url.as_deref(),
            Some("http://backend:8083/api/")
        );
        assert!(matches!(
            args.command,
            Command::Favorites {
                command: FavoritesCommand::Toggle { id: 42 }
            }
        ));
    }

    #[test]
    fn parse_prefs_page_size() {
        let args = CliArgs::parse_from(["libris-sync", "prefs", "page-size", "24"]);
        assert!(matches!(
            args.command,
            Command::Prefs {
                command: PrefsCommand::PageSize { size: 24 }
            }
        ));
    }
}
