use clap::{Parser, Subcommand, ValueEnum};
use snip_core::UserId;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const DATABASE_DSN_ENV: &str = "DATABASE_DSN";
pub const BASE_URL_ENV: &str = "BASE_URL";
pub const FILE_STORAGE_PATH_ENV: &str = "FILE_STORAGE_PATH";
pub const MAX_DELETE_CONCURRENCY_ENV: &str = "SNIP_MAX_DELETE_CONCURRENCY";
pub const LOG_FORMAT_ENV: &str = "SNIP_LOG_FORMAT";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_FILE_STORAGE_PATH: &str = "./storage.json";
pub const DEFAULT_MAX_DELETE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

impl Display for LogFormatArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormatArg::Text => write!(f, "text"),
            LogFormatArg::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "snip", about = "Operate the snip link store")]
pub struct CLI {
    /// PostgreSQL connection string. Links are kept in memory and in the
    /// storage file when absent or unreachable.
    #[arg(short = 'd', long, env = DATABASE_DSN_ENV)]
    pub database_dsn: Option<String>,

    #[arg(short = 'b', long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(
        short = 'f',
        long,
        env = FILE_STORAGE_PATH_ENV,
        default_value = DEFAULT_FILE_STORAGE_PATH,
    )]
    pub file_storage_path: PathBuf,

    #[arg(
        long,
        env = MAX_DELETE_CONCURRENCY_ENV,
        default_value_t = DEFAULT_MAX_DELETE_CONCURRENCY,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..),
    )]
    pub max_delete_concurrency: usize,

    #[arg(
        long,
        env = LOG_FORMAT_ENV,
        value_enum,
        default_value_t = LogFormatArg::Text
    )]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten one or more URLs on behalf of a user.
    Shorten {
        #[arg(short, long, value_parser = parse_user)]
        user: UserId,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Print the original URL behind a short code.
    Resolve {
        code: String,
        /// Resolve as seen by this user, honoring their deletions.
        #[arg(short, long, value_parser = parse_user)]
        user: Option<UserId>,
    },
    /// List the links a user owns.
    List {
        #[arg(short, long, value_parser = parse_user)]
        user: UserId,
    },
    /// Delete links for a user.
    Delete {
        #[arg(short, long, value_parser = parse_user)]
        user: UserId,
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Mint a new user id. Requires a database: without one the minted id is
    /// not persisted and the next run would hand it out again.
    NewUser,
    /// Print user and link counts.
    Stats,
    /// Check database connectivity.
    Ping,
}

fn parse_user(value: &str) -> Result<UserId, String> {
    let id: i32 = value.parse().map_err(|e| format!("invalid user id: {e}"))?;
    let user = UserId(id);
    if !user.is_valid() {
        return Err(format!("user ids start at {}", UserId::FIRST));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        CLI::command().debug_assert();
    }

    #[test]
    fn parses_delete_with_globals() {
        let cli = CLI::try_parse_from([
            "snip",
            "--max-delete-concurrency",
            "2",
            "delete",
            "--user",
            "3",
            "AbC123xY",
            "ZZZZZZZZ",
        ])
        .unwrap();

        assert_eq!(cli.max_delete_concurrency, 2);
        match cli.command {
            Command::Delete { user, codes } => {
                assert_eq!(user, UserId(3));
                assert_eq!(codes, vec!["AbC123xY", "ZZZZZZZZ"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_non_positive_users() {
        assert!(CLI::try_parse_from(["snip", "list", "--user", "0"]).is_err());
        assert!(CLI::try_parse_from(["snip", "list", "--user", "x"]).is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(CLI::try_parse_from(["snip", "--max-delete-concurrency", "0", "stats"]).is_err());
    }
}
