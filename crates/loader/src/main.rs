use std::path::Path;

use anyhow::Result;
use common::config::{Config, RemoteConfig};
use common::db::AsyncDb;
use common::object_store::AnyObjectStore;

mod cli;
mod ledger;
mod metrics;
mod remote;
mod runner;
mod shutdown;
mod stats;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    let command = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let config_path = match &command {
        cli::Command::Run(run) => run.config.clone(),
        _ => None,
    };
    let config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    let flag_path = Path::new(&config.shutdown.flag_path);

    match command {
        cli::Command::CreateShutdownFile => {
            let created = common::flag::create_flag(flag_path)?;
            println!(
                "{} {}",
                if created { "created" } else { "already present:" },
                flag_path.display()
            );
            Ok(())
        }
        cli::Command::RemoveShutdownFile => {
            let removed = common::flag::remove_flag(flag_path)?;
            println!(
                "{} {}",
                if removed { "removed" } else { "not present:" },
                flag_path.display()
            );
            Ok(())
        }
        cli::Command::CheckShutdownFile => {
            std::process::exit(i32::from(common::flag::flag_exists(flag_path)));
        }
        cli::Command::Run(run) => {
            let code = run_loader(run, config).await?;
            std::process::exit(code);
        }
    }
}

async fn run_loader(args: cli::RunArgs, config: Config) -> Result<i32> {
    let level = if args.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let (dispatch, log_path) =
        common::observability::build_dispatch(level, Some(Path::new(&config.logging.dir)))?;
    tracing::dispatcher::set_global_default(dispatch)?;

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    if let Some(parent) = Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    tracing::info!(
        db = %db_path,
        log = ?log_path,
        dates = ?args.dates(),
        exchanges = ?args.exchanges(),
        idempotent = args.idempotent,
        "loader starting"
    );

    let db = AsyncDb::open(&db_path).await?;
    let store = AnyObjectStore::from_config(&config.storage)?;
    let remote = remote::RemoteLedger::connect(RemoteConfig::from_env()).await;
    let mut ledger = ledger::Ledger::new(db.clone(), remote, config.ledger.claim_stale_hours);
    ledger.publish_remote_state().await?;

    let coordinator = shutdown::ShutdownCoordinator::start(
        config.shutdown.flag_path.clone().into(),
        std::time::Duration::from_millis(config.shutdown.poll_interval_ms),
    );
    let cancel = coordinator.token();

    let exchanges = args.exchanges();
    let dates = args.dates();
    let mut results = Vec::new();
    for date in &dates {
        let date_results = runner::run_date(
            &db,
            &mut ledger,
            &store,
            *date,
            &exchanges,
            args.idempotent,
            &cancel,
        )
        .await?;
        results.extend(date_results);
    }

    runner::print_statistics(&db, &dates).await?;

    let code = runner::exit_code(&results);
    tracing::info!(exit_code = code, "loader finished");
    Ok(code)
}
