//! Command line arguments for the dbdeck binary

use clap::{Args, Parser, Subcommand};
use dbdeck_rdbc::connection::{ConnectionConfig, SslSetting};
use dbdeck_rdbc::types::Value;
use std::path::PathBuf;

/// dbdeck - database connection manager
#[derive(Parser, Debug)]
#[command(name = "dbdeck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (YAML) with global settings and connection profiles
    #[arg(short, long, global = true, env = "DBDECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "DBDECK_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a throwaway connection and report the server version
    Test {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Run one query and print the rows as JSON
    Query {
        #[command(flatten)]
        target: TargetArgs,

        /// SQL text
        sql: String,

        /// Positional parameter (JSON literal, or plain text)
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,
    },

    /// List saved connection profiles
    Profiles,

    /// Serve operations as JSON lines on stdin/stdout
    Serve,
}

/// Connection target: a saved profile, or ad-hoc flags
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Saved profile name
    #[arg(short, long, env = "DBDECK_PROFILE", conflicts_with = "db_type")]
    pub profile: Option<String>,

    /// Database type (mysql, postgres)
    #[arg(short = 't', long = "type", env = "DBDECK_TYPE")]
    pub db_type: Option<String>,

    /// Server host
    #[arg(short = 'H', long, env = "DBDECK_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "DBDECK_PORT")]
    pub port: Option<u16>,

    /// User name
    #[arg(short, long, env = "DBDECK_USER")]
    pub user: Option<String>,

    /// Password
    #[arg(long, env = "DBDECK_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database name
    #[arg(short, long, env = "DBDECK_DATABASE")]
    pub database: Option<String>,

    /// Use TLS
    #[arg(long)]
    pub ssl: bool,

    /// Accept server certificates that cannot be verified
    #[arg(long, requires = "ssl")]
    pub insecure: bool,
}

impl TargetArgs {
    /// Build a configuration from the flags; `None` when no type was given
    pub fn to_config(&self) -> Option<ConnectionConfig> {
        let mut config = ConnectionConfig::new(self.db_type.clone()?);
        config.host = self.host.clone();
        config.port = self.port;
        config.user = self.user.clone();
        config.password = self.password.clone().map(Into::into);
        config.database = self.database.clone();
        config.connection_limit = 1;
        if self.ssl {
            config.ssl = Some(SslSetting::Policy {
                reject_unauthorized: Some(!self.insecure),
            });
        }
        Some(config)
    }
}

/// Parse a `--param` value: JSON literals keep their type, anything else is text
pub fn parse_param(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::String(s)) => Value::String(s),
        Ok(json) => serde_json::from_value(json).unwrap_or_else(|_| Value::from(raw)),
        Err(_) => Value::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_to_config() {
        let cli = Cli::parse_from([
            "dbdeck", "test", "--type", "postgres", "-H", "pg.internal", "-u", "app", "--ssl",
        ]);
        let Command::Test { target } = cli.command else {
            panic!("expected test command");
        };
        let config = target.to_config().unwrap();
        assert_eq!(config.kind, "postgres");
        assert_eq!(config.host(), "pg.internal");
        assert_eq!(config.port(), 5432);
        assert!(config.tls().is_some_and(|tls| tls.reject_unauthorized));
    }

    #[test]
    fn test_profile_without_flags() {
        let cli = Cli::parse_from(["dbdeck", "query", "-p", "local", "SELECT 1"]);
        let Command::Query { target, sql, params } = cli.command else {
            panic!("expected query command");
        };
        assert_eq!(target.profile.as_deref(), Some("local"));
        assert!(target.to_config().is_none());
        assert_eq!(sql, "SELECT 1");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42"), Value::Int(42));
        assert_eq!(parse_param("null"), Value::Null);
        assert_eq!(parse_param("true"), Value::Bool(true));
        assert_eq!(parse_param("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_param("plain text"), Value::from("plain text"));
    }
}
