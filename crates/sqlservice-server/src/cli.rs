//! Administrative database commands.
//!
//! Each registered extension contributes a command group (`SQL_CLI_GROUP`,
//! default `sql`) with two subcommands:
//!
//! ```text
//! sqlservice sql create-all [--key KEY]
//! sqlservice sql drop-all [--key KEY]
//! ```
//!
//! Commands run against a fully initialized [`Application`].

use crate::app::Application;
use crate::extension::SqlService;
use clap::{Parser, Subcommand};
use sqlservice_db::DbError;
use std::sync::Arc;
use thiserror::Error;

/// Arguments following the command group name.
#[derive(Debug, Parser)]
#[command(no_binary_name = true)]
pub struct SqlCli {
    /// Only run against the extension registered under this key.
    #[arg(long, global = true)]
    pub key: Option<String>,

    #[command(subcommand)]
    pub command: SqlCommand,
}

/// Available database subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum SqlCommand {
    /// Import the configured model modules and create all tables.
    CreateAll,
    /// Drop all tables of the model base.
    DropAll,
}

/// Result of a command against one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub key: String,
    pub command: SqlCommand,
    pub tables: usize,
}

/// Errors from administrative commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No extension uses this command group.
    #[error("unknown command group: {0}")]
    UnknownGroup(String),

    /// `--key` names no extension in the group.
    #[error("no database extension registered under key '{0}' in this command group")]
    UnknownKey(String),

    /// The arguments did not parse.
    #[error(transparent)]
    Usage(#[from] clap::Error),

    /// The command itself failed.
    #[error("command failed for '{key}': {source}")]
    Command { key: String, source: DbError },
}

/// Whether any registered extension uses `group` as its command group.
pub fn is_command_group(app: &Application, group: &str) -> bool {
    app.extensions().iter().any(|s| s.cli_group() == group)
}

/// Parses `args` (everything after the group name) and runs the command.
pub fn run_group_command<I, T>(
    app: &Application,
    group: &str,
    args: I,
) -> Result<Vec<CommandOutcome>, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = SqlCli::try_parse_from(args)?;
    run_sql_command(app, group, &cli)
}

/// Runs a parsed command against every extension in `group`, or only the
/// one selected with `--key`.
pub fn run_sql_command(
    app: &Application,
    group: &str,
    cli: &SqlCli,
) -> Result<Vec<CommandOutcome>, CliError> {
    let services: Vec<&Arc<SqlService>> = app
        .extensions()
        .iter()
        .filter(|s| s.cli_group() == group)
        .collect();
    if services.is_empty() {
        return Err(CliError::UnknownGroup(group.to_string()));
    }

    let selected: Vec<&Arc<SqlService>> = match &cli.key {
        Some(key) => {
            let service = services
                .into_iter()
                .find(|s| s.key() == key)
                .ok_or_else(|| CliError::UnknownKey(key.clone()))?;
            vec![service]
        }
        None => services,
    };

    selected
        .into_iter()
        .map(|service| {
            let result = match cli.command {
                SqlCommand::CreateAll => service.create_all(),
                SqlCommand::DropAll => service.drop_all(),
            };
            let tables = result.map_err(|source| CliError::Command {
                key: service.key().to_string(),
                source,
            })?;
            tracing::info!(key = service.key(), command = ?cli.command, tables, "database command complete");
            Ok(CommandOutcome {
                key: service.key().to_string(),
                command: cli.command,
                tables,
            })
        })
        .collect()
}
