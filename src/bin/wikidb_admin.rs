//! wikidb administration tool
//!
//! Maintenance commands for a wiki store, configured from the environment
//! (`WIKIDB_BACKEND`, `WIKIDB_DSN`, `WIKIDB_DIRECTORY`, ...; see
//! `BackendConfig::from_env`). Log output goes to stderr and is filtered
//! with `RUST_LOG` (default `info`).
//!
//! # Examples
//!
//! ```bash
//! # Create the SQL tables
//! WIKIDB_BACKEND=sql WIKIDB_DSN=sqlite:///var/lib/wiki/wiki.db wikidb-admin init-schema
//!
//! # Print the DDL instead of running it
//! wikidb-admin init-schema --print
//!
//! # Expire old revisions of every page, then compact the store
//! wikidb-admin expire && wikidb-admin optimize
//! ```

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wikidb::codec::current_time_secs;
use wikidb::schema::{apply_schema, schema_script};
use wikidb::{
    open_backend, open_session_store, BackendConfig, BackendKind, Dsn, Error, Result,
    SqlDriver, SqliteDriver, WikiDb,
};

const USAGE: &str = "\
Usage: wikidb-admin <command>

Commands:
  init-schema [--print]   create the SQL tables (or print the DDL)
  rebuild                 recompute the recent and nonempty indexes
  check                   report index inconsistencies; exit 1 if any
  expire                  apply the retention policy to every page
  optimize                compact the store
  gc-sessions <seconds>   remove sessions idle for longer than <seconds>
  help                    show this message

Configuration comes from WIKIDB_* environment variables.";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "command failed");
            eprintln!("wikidb-admin: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<ExitCode> {
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::FAILURE);
    };
    let rest = &args[1..];

    match command.as_str() {
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(ExitCode::SUCCESS)
        }
        "init-schema" => init_schema(rest),
        "rebuild" => {
            let mut backend = open_backend(&BackendConfig::from_env()?)?;
            backend.rebuild_indexes()?;
            backend.close()?;
            Ok(ExitCode::SUCCESS)
        }
        "check" => {
            let mut backend = open_backend(&BackendConfig::from_env()?)?;
            let problems = backend.check()?;
            backend.close()?;
            for problem in &problems {
                println!("{problem}");
            }
            if problems.is_empty() {
                info!("no problems found");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        "expire" => {
            let mut wiki = WikiDb::open(&BackendConfig::from_env()?)?;
            let reports = wiki.expire_all(current_time_secs())?;
            for (pagename, report) in &reports {
                println!(
                    "{pagename}: deleted {:?}, merged {:?}",
                    report.deleted, report.merged
                );
            }
            wiki.close()?;
            Ok(ExitCode::SUCCESS)
        }
        "optimize" => {
            let mut backend = open_backend(&BackendConfig::from_env()?)?;
            backend.optimize()?;
            backend.close()?;
            Ok(ExitCode::SUCCESS)
        }
        "gc-sessions" => {
            let lifetime = rest
                .first()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| Error::InvalidArgument("gc-sessions needs a lifetime in seconds".into()))?;
            let mut sessions = open_session_store(&BackendConfig::from_env()?)?;
            let removed = sessions.gc(lifetime, current_time_secs())?;
            println!("removed {removed} sessions");
            Ok(ExitCode::SUCCESS)
        }
        other => {
            eprintln!("unknown command '{other}'\n\n{USAGE}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_schema(rest: &[String]) -> Result<ExitCode> {
    let config = BackendConfig::from_env()?;
    config.validate()?;
    if rest.iter().any(|a| a == "--print") {
        println!("{}", schema_script(&config.prefix));
        return Ok(ExitCode::SUCCESS);
    }
    let BackendKind::Sql { dsn } = &config.kind else {
        return Err(Error::Config(
            "init-schema needs WIKIDB_BACKEND=sql (DBM stores need no schema)".into(),
        ));
    };
    let dsn = Dsn::parse(dsn)?;
    let driver = SqliteDriver::connect(&dsn, config.lock_timeout)?;
    apply_schema(&driver, &config.prefix)?;
    info!(dsn = %dsn, prefix = %config.prefix, "schema applied");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_commands_without_a_store() {
        assert_eq!(run(&args(&["help"])).unwrap(), ExitCode::SUCCESS);
        assert_eq!(run(&[]).unwrap(), ExitCode::FAILURE);
        assert_eq!(run(&args(&["frobnicate"])).unwrap(), ExitCode::FAILURE);
        assert!(matches!(
            run(&args(&["gc-sessions", "soon"])),
            Err(Error::InvalidArgument(_))
        ));
    }
}
