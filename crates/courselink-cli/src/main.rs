use anyhow::Result;
use clap::{Parser, Subcommand};
use courselink_sync::{ReconcileConfig, ReconcilePipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "courselink")]
#[command(about = "Group catalog courses across years and link offerings to them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Group the catalog table and write the grouped catalog.
    Group,
    /// Match offerings against a previously grouped catalog.
    Match,
    /// Group, match and write run reports.
    Run {
        /// Also scrape course detail pages for one member per group.
        #[arg(long)]
        details: bool,
        /// Repeat detail rounds until every grouped record is scraped.
        #[arg(long, requires = "details")]
        until_complete: bool,
    },
    /// Scrape course detail pages for a previously grouped catalog.
    Details {
        /// Repeat detail rounds until every grouped record is scraped.
        #[arg(long)]
        until_complete: bool,
    },
    /// List recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courselink=info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run {
        details: false,
        until_complete: false,
    });
    match command {
        Commands::Group => {
            let outcome = ReconcilePipeline::new(config)?.run_grouping()?;
            println!(
                "grouping complete: records={} groups={} conflicts={}",
                outcome.catalog.len(),
                outcome.group_count,
                outcome.conflicts.len()
            );
        }
        Commands::Match => {
            let pipeline = ReconcilePipeline::new(config)?;
            let catalog = pipeline.load_grouped_catalog()?;
            let outcome = pipeline.run_matching(&catalog)?;
            println!(
                "matching complete: offerings={} resolved={} unmatched={}",
                outcome.report.summary.total, outcome.report.summary.resolved, outcome.report.summary.unmatched
            );
        }
        Commands::Run { details, until_complete } => {
            config.details_until_complete |= until_complete;
            let summary = ReconcilePipeline::new(config)?.run_once(details).await?;
            info!(run_id = %summary.run_id, "run finished");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Details { until_complete } => {
            config.details_until_complete |= until_complete;
            let pipeline = ReconcilePipeline::new(config)?;
            let catalog = pipeline.load_grouped_catalog()?;
            let summary = pipeline.run_details(&catalog).await?;
            println!(
                "details complete: targets={} scraped={} failed={} passes={} rounds={}",
                summary.targets, summary.scraped, summary.failed, summary.passes, summary.rounds
            );
        }
        Commands::Report { runs } => {
            print!("{}", courselink_sync::report_recent_runs(runs, &config.workspace_root)?);
        }
    }

    Ok(())
}
