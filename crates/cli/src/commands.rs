use anyhow::{Context, Result, bail};
use tracing::info;

use marketflow_core::{AuditTag, JobRecord, NewJob, Stage};
use marketflow_infra::collaborators::{HttpMarketDataFetcher, WarehouseDatabase};
use marketflow_infra::stages::{CrawlExecutor, ProcedureStage, StageLoadExecutor};
use marketflow_infra::{
    AppConfig, ControlStore, LeaseManager, PostgresControlStore, StageExecutor, StageWorker,
    Transition,
};

use crate::Command;

async fn connect(config: &AppConfig) -> Result<PostgresControlStore> {
    PostgresControlStore::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout(),
    )
    .await
    .context("cannot reach the control store")
}

async fn connect_warehouse(config: &AppConfig) -> Result<WarehouseDatabase> {
    WarehouseDatabase::connect(
        config.warehouse_url(),
        config.warehouse.max_connections,
        config.database.acquire_timeout(),
    )
    .await
    .context("cannot reach the warehouse database")
}

async fn build_executor(stage: Stage, config: &AppConfig) -> Result<Box<dyn StageExecutor>> {
    let executor: Box<dyn StageExecutor> = match stage {
        Stage::Crawl => Box::new(CrawlExecutor::new(HttpMarketDataFetcher::new(
            config.market_data.base_url.clone(),
            config.market_data.timeout(),
        )?)),
        Stage::StageLoad => {
            let warehouse = connect_warehouse(config).await?;
            Box::new(StageLoadExecutor::new(warehouse.staging_sink()))
        }
        Stage::Transform | Stage::WarehouseLoad | Stage::Aggregate => {
            let warehouse = connect_warehouse(config).await?;
            Box::new(ProcedureStage::new(
                warehouse.procedure_runner(),
                config.procedures(stage).to_vec(),
                config.transform.symbol_file.clone(),
            )?)
        }
    };
    Ok(executor)
}

fn job_line(job: &JobRecord) -> String {
    format!(
        "{}\t{}\tlocked={}\tretry={}\t{}..{}\t{}\t{}",
        job.id,
        job.status,
        job.locked,
        job.retry_eligible,
        job.window_start,
        job.window_end,
        job.symbols.join(","),
        job.output_path
    )
}

/// Execute a command; the returned value is the process exit code.
pub async fn dispatch(command: Command, config: &AppConfig) -> Result<u8> {
    let store = connect(config).await?;

    match command {
        Command::Run { stage } => {
            let executor = build_executor(stage, config).await?;
            let definition = config.pipeline().definition(stage);
            let worker = StageWorker::new(store, executor, definition, config.worker_config());

            let outcome = worker.run_once().await?;
            println!("{}", outcome.summary(stage));
            Ok(outcome.exit_code() as u8)
        }
        Command::Sweep => {
            let report = LeaseManager::new(store, config.pipeline()).sweep().await?;
            for (job_id, status) in &report.reclaimed {
                println!("reclaimed job {job_id} -> {status}");
            }
            println!("{}", report.summary());
            Ok(0)
        }
        Command::Enqueue {
            start,
            end,
            output,
            symbols,
        } => {
            let new_job = NewJob::new(
                start,
                end.unwrap_or(start),
                output.display().to_string(),
                symbols,
            )
            .validated()?;
            let job = store.create_job(new_job).await?;
            info!(job_id = %job.id, "job enqueued");
            println!("enqueued job {} ({})", job.id, job.status);
            Ok(0)
        }
        Command::Reset { job_id } => {
            let Some(job) = store.get_job(job_id).await? else {
                bail!("job {job_id} not found");
            };
            let Some(target) = config.pipeline().reset_target(job.status) else {
                bail!("job {job_id} is in {}, not an error status", job.status);
            };
            let transition = Transition {
                from: job.status,
                to: target,
                retry_eligible: Some(true),
                tag: AuditTag::Reset,
                description: format!("operator reset from {} to {target}", job.status),
            };
            store.reset(job_id, &transition).await?;
            info!(job_id = %job_id, from = %job.status, to = %target, "job reset");
            println!("job {job_id}: {} -> {target}", job.status);
            Ok(0)
        }
        Command::Status { status, limit } => {
            for job in store.list_jobs(status, limit).await? {
                println!("{}", job_line(&job));
            }
            Ok(0)
        }
        Command::Audit { job_id } => {
            if store.get_job(job_id).await?.is_none() {
                bail!("job {job_id} not found");
            }
            for entry in store.audit_log(job_id).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.id,
                    entry.timestamp.to_rfc3339(),
                    entry.status_tag,
                    entry.description
                );
            }
            Ok(0)
        }
        Command::Migrate => {
            store.migrate().await?;
            connect_warehouse(config).await?.migrate().await?;
            println!("control store and staging schemas are up to date");
            Ok(0)
        }
    }
}
