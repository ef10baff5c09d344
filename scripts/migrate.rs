#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use personnel_migrate::config::{default_db_path, MigrationConfig};
use personnel_migrate::engine::{self, MigrationMode, RunOptions, RunSummary};
use personnel_migrate::legacy::SourceTable;
use personnel_migrate::mapper::{self, FieldRule};
use personnel_migrate::runlog::{RunLog, RunLogEntry};
use personnel_migrate::snapshot::{self, LEGACY_TABLES, TOUCHED_TABLES};
use personnel_migrate::verify::VerificationReport;
use personnel_migrate::{db, logging, rollback, schema_plan, verify};
use sqlx::SqlitePool;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "migrate", about = "Personnel unification migration")]
struct Cli {
    /// Optional explicit DB path
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Where snapshots are written (defaults next to the DB)
    #[arg(long, value_name = "DIR", global = true)]
    snapshot_dir: Option<PathBuf>,

    /// Where run logs are written (defaults next to the DB)
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Migrate legacy rows into unified personnel storage (dry run unless --apply)
    #[command(about, long_about = None)]
    Run {
        /// Write for real. Takes a snapshot first and asks for confirmation.
        #[arg(long)]
        apply: bool,
        /// Source rows fetched per page
        #[arg(long, value_name = "N")]
        page_size: Option<u32>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the verification report for a run
    #[command(about, long_about = None)]
    Verify {
        #[arg(long, value_name = "ID")]
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Undo everything an applied run wrote
    #[command(about, long_about = None)]
    Rollback {
        #[arg(long, value_name = "ID")]
        run_id: String,
    },
    /// List recorded runs
    #[command(about, long_about = None)]
    Runs,
    /// Apply the schema plan and show its state
    #[command(about, long_about = None)]
    Schema,
    /// Print the static field tables used by the mapper
    #[command(about, long_about = None)]
    Fields,
    /// Compare live legacy tables with a snapshot file
    #[command(about, long_about = None)]
    SnapshotCheck {
        #[arg(long, value_name = "PATH")]
        snapshot: PathBuf,
        /// Check every table in the snapshot, not only the legacy ones
        #[arg(long)]
        all: bool,
    },
    /// Rewrite the captured tables from a snapshot file in one transaction
    #[command(about, long_about = None)]
    SnapshotRestore {
        #[arg(long, value_name = "PATH")]
        snapshot: PathBuf,
        /// Restore only the legacy tables
        #[arg(long)]
        legacy_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().context("resolve default database path")?,
    };
    let mut config = MigrationConfig::load();
    if let Some(dir) = cli.snapshot_dir {
        config.snapshot_dir = Some(dir);
    }
    if let Some(dir) = cli.log_dir {
        config.log_dir = Some(dir);
    }
    let _guard = logging::init(Some(&config.log_dir_for(&db_path)))?;

    match cli.cmd {
        Cmd::Run {
            apply,
            page_size,
            json,
        } => run(&db_path, config.with_page_size(page_size), apply, json).await,
        Cmd::Verify { run_id, json } => verify_run(&db_path, &run_id, json).await,
        Cmd::Rollback { run_id } => rollback_run(&db_path, &config, &run_id).await,
        Cmd::Runs => list_runs(&db_path).await,
        Cmd::Schema => schema(&db_path).await,
        Cmd::Fields => {
            print_fields();
            Ok(())
        }
        Cmd::SnapshotCheck { snapshot, all } => snapshot_check(&db_path, &snapshot, all).await,
        Cmd::SnapshotRestore {
            snapshot,
            legacy_only,
        } => snapshot_restore(&db_path, &snapshot, legacy_only).await,
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} Proceed? (y/N) ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn stop_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stop requested; finishing the current record.");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

async fn open(db: &Path, create: bool) -> Result<SqlitePool> {
    db::open_pool(db, create)
        .await
        .with_context(|| format!("open {}", db.display()))
}

async fn run(db: &Path, config: MigrationConfig, apply: bool, json: bool) -> Result<()> {
    let mode = if apply {
        MigrationMode::Apply
    } else {
        MigrationMode::DryRun
    };
    if apply
        && !confirm(&format!(
            "This will write unified personnel rows into {}.",
            db.display()
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }

    let pool = open(db, apply).await?;
    let opts = RunOptions::from_config(&config, db, mode);
    let stop = stop_flag();
    let summary = engine::run(&pool, &opts, &stop).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Run: {} ({}, {})", summary.run_id, summary.mode, summary.status.as_str());
    if let Some(path) = &summary.snapshot_path {
        println!("Snapshot: {}", path.display());
    }
    println!("Log: {}", summary.log_path.display());
    println!(
        "{:<18} {:>9} {:>9} {:>9} {:>7} {:>10}",
        "table", "processed", "migrated", "skipped", "failed", "repointed"
    );
    for outcome in &summary.tables {
        let name = outcome.table.map(SourceTable::table).unwrap_or("-");
        println!(
            "{:<18} {:>9} {:>9} {:>9} {:>7} {:>10}",
            name,
            outcome.processed,
            outcome.migrated,
            outcome.skipped_duplicate,
            outcome.failed,
            outcome.references_repointed
        );
    }
    if let Some(report) = &summary.verification {
        print_report(report);
    }
    if summary.mode == MigrationMode::DryRun {
        println!("Dry run: nothing was written. Re-run with --apply to migrate.");
    }
}

fn print_report(report: &VerificationReport) {
    println!("Verification ({}):", if report.is_clean() { "clean" } else { "attention" });
    for t in &report.types {
        println!(
            "  {:<18} rows={} eligible={} matched={} unlinked={} failures={}",
            t.source_table.table(),
            t.source_rows,
            t.eligible,
            t.matched,
            t.unlinked,
            t.failures.len()
        );
        for f in &t.failures {
            println!(
                "    id={} code={} stage={} {}",
                f.source_id,
                f.code.as_deref().unwrap_or("-"),
                f.stage,
                f.reason
            );
        }
    }
    for s in &report.skills {
        println!(
            "  {:<24} legacy_rows={} distinct_pairs={} migrated={}",
            s.source_table.skill_table(),
            s.legacy_rows,
            s.distinct_pairs,
            s.migrated
        );
    }
    for r in report.references.iter().filter(|r| r.legacy_only > 0) {
        println!(
            "  {}.{} legacy_only={}{}",
            r.dependent_table,
            r.source_table.owner_column(),
            r.legacy_only,
            if r.fully_migrated { " (table fully migrated)" } else { "" }
        );
    }
    for d in report.dangling.iter().filter(|d| d.dangling > 0) {
        println!("  {} dangling personnel_id={}", d.dependent_table, d.dangling);
    }
    for item in &report.reconciliation {
        println!(
            "  reconcile {} id={} personnel={} {}",
            item.source_table, item.source_id, item.personnel_id, item.reason
        );
    }
    for item in &report.drift {
        println!(
            "  drift {} id={} personnel={} fields={} {}",
            item.source_table,
            item.source_id,
            item.personnel_id,
            item.fields.join(","),
            item.problem.as_deref().unwrap_or("")
        );
    }
}

async fn verify_run(db: &Path, run_id: &str, json: bool) -> Result<()> {
    let pool = open(db, false).await?;
    let mut conn = pool.acquire().await?;
    if engine::find_run(&mut conn, run_id).await?.is_none() {
        bail!("unknown run id {run_id}");
    }
    let report = verify::verify(&mut conn, run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn rollback_run(db: &Path, config: &MigrationConfig, run_id: &str) -> Result<()> {
    let pool = open(db, false).await?;
    let mut conn = pool.acquire().await?;
    let Some(found) = engine::find_run(&mut conn, run_id).await? else {
        bail!("unknown run id {run_id}");
    };
    if !confirm(&format!(
        "This will delete {} personnel rows written by run {run_id}.",
        found.records
    ))? {
        println!("Aborted.");
        return Ok(());
    }

    let mut log = RunLog::create(&config.log_dir_for(db), "rollback", run_id)?;
    let report = match rollback::rollback(&mut conn, run_id).await {
        Ok(report) => report,
        Err(err) => {
            log.append(RunLogEntry::Failure { error: err.clone() })?;
            println!("Log: {}", log.path().display());
            return Err(err.into());
        }
    };
    log.append(RunLogEntry::Rollback {
        report: serde_json::to_value(&report)?,
    })?;
    println!(
        "Rolled back {}: status={} records={} deleted={} aliases_removed={} references_restored={} missing={} failed={}",
        run_id,
        report.status().as_str(),
        report.records,
        report.personnel_deleted,
        report.aliases_removed,
        report.references_restored,
        report.missing_personnel.len(),
        report.failed.len()
    );
    println!("Log: {}", log.path().display());

    if let Some(path) = found.snapshot_path.as_deref().map(Path::new) {
        if path.exists() {
            let snap = snapshot::load(path)?;
            let diverged = snapshot::compare_live(&mut conn, &snap, LEGACY_TABLES).await?;
            if diverged.is_empty() {
                println!("Legacy tables match snapshot {}", path.display());
            } else {
                for d in diverged {
                    println!("Legacy table {} differs from snapshot", d.table);
                }
            }
        }
    }
    if !report.failed.is_empty() {
        bail!(
            "{} records could not be rolled back; run {run_id} is rollback_partial, roll back again once they are fixed",
            report.failed.len()
        );
    }
    Ok(())
}

async fn list_runs(db: &Path) -> Result<()> {
    println!("DB: {}", db.display());
    if !db.exists() {
        return Ok(());
    }
    let pool = open(db, false).await?;
    let mut conn = pool.acquire().await?;
    if !db::table_exists(&mut conn, "migration_run").await? {
        return Ok(());
    }
    for run in engine::list_runs(&mut conn).await? {
        println!(
            "{:<36}  {:<7}  {:<11}  records={}",
            run.run_id, run.mode, run.status, run.records
        );
    }
    Ok(())
}

async fn schema(db: &Path) -> Result<()> {
    let pool = open(db, true).await?;
    let mut conn = pool.acquire().await?;
    let statuses = schema_plan::apply(&mut conn).await?;
    println!("DB: {}", db.display());
    for status in statuses {
        let state = serde_json::to_value(status.state)?;
        println!(
            "{:<40}  {:<15}  {}",
            status.file,
            state.as_str().unwrap_or("-"),
            &status.checksum[..12]
        );
    }
    Ok(())
}

fn print_rule(rule: &FieldRule) {
    let fill = serde_json::to_string(&rule.fill).unwrap_or_default();
    println!(
        "  {:<28} -> {:<28} {:<9} {}",
        rule.source,
        rule.target,
        format!("{:?}", rule.slot).to_lowercase(),
        fill
    );
}

fn print_fields() {
    for table in SourceTable::ALL {
        println!("{}:", table.table());
        for rule in mapper::rules_for(table) {
            print_rule(rule);
        }
    }
    println!("skills:");
    for rule in mapper::SKILL_RULES {
        print_rule(rule);
    }
}

async fn snapshot_check(db: &Path, path: &Path, all: bool) -> Result<()> {
    let snap = snapshot::load(path)?;
    let pool = open(db, false).await?;
    let mut conn = pool.acquire().await?;
    let tables: Vec<&str> = if all {
        snap.tables.keys().map(String::as_str).collect()
    } else {
        LEGACY_TABLES.to_vec()
    };
    let diverged = snapshot::compare_live(&mut conn, &snap, &tables).await?;
    println!("Snapshot: {} (run {})", path.display(), snap.run_id);
    for table in &tables {
        let state = if diverged.iter().any(|d| d.table == *table) {
            "differs"
        } else {
            "matches"
        };
        println!("{:<28}  {}", table, state);
    }
    if !diverged.is_empty() {
        bail!("{} tables differ from the snapshot", diverged.len());
    }
    Ok(())
}

async fn snapshot_restore(db: &Path, path: &Path, legacy_only: bool) -> Result<()> {
    let snap = snapshot::load(path)?;
    let tables: Vec<&str> = if legacy_only {
        LEGACY_TABLES.to_vec()
    } else {
        TOUCHED_TABLES
            .iter()
            .copied()
            .filter(|table| snap.tables.contains_key(*table))
            .collect()
    };
    if !confirm(&format!(
        "This will rewrite {} tables in {} from snapshot {}.",
        tables.len(),
        db.display(),
        path.display()
    ))? {
        println!("Aborted.");
        return Ok(());
    }

    let pool = open(db, false).await?;
    let mut conn = pool.acquire().await?;
    let report = snapshot::restore(&mut conn, &snap, &tables)
        .await
        .with_context(|| format!("restore from {}", path.display()))?;
    println!("Restored snapshot {} (run {})", path.display(), report.run_id);
    for (table, restored) in &report.tables {
        println!(
            "{:<28}  written={} removed={}",
            table, restored.written, restored.removed
        );
    }
    let diverged = snapshot::compare_live(&mut conn, &snap, &tables).await?;
    for d in &diverged {
        println!("{:<28}  differs from snapshot", d.table);
    }
    Ok(())
}
