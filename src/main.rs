use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use maps_batch_geocoder::{init_tracing, AppConfig, BatchDriver, RunState, WebDriverSessionFactory};

/// Command line overrides; everything else comes from the environment.
#[derive(Parser, Debug)]
#[command(name = "maps-batch-geocoder")]
#[command(about = "Resolve addresses to coordinates through a maps search, resuming where the last run stopped")]
struct Args {
    /// Input universe CSV
    #[arg(short, long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Append-only output store
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Reference table of locality centroids
    #[arg(short, long, value_name = "PATH")]
    gazetteer: Option<PathBuf>,

    /// Unique identifier column shared by input and output
    #[arg(long, value_name = "NAME")]
    id_column: Option<String>,

    /// WebDriver endpoint, e.g. a local chromedriver
    #[arg(long, value_name = "URL")]
    webdriver_url: Option<String>,

    /// Run the browser with a visible window
    #[arg(long)]
    headed: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(input) = self.input {
            config.input_csv = input;
        }
        if let Some(output) = self.output {
            config.output_csv = output;
        }
        if let Some(gazetteer) = self.gazetteer {
            config.gazetteer_csv = Some(gazetteer);
        }
        if let Some(id_column) = self.id_column {
            config.columns.unique_id = id_column;
        }
        if let Some(url) = self.webdriver_url {
            config.webdriver_url = url;
        }
        if self.headed {
            config.headless = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = AppConfig::from_env();
    args.apply(&mut config);
    info!(
        input = %config.input_csv.display(),
        output = %config.output_csv.display(),
        webdriver = %config.webdriver_url,
        "starting batch geocoder"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(Arc::clone(&cancel));

    let factory = WebDriverSessionFactory::new(&config).context("invalid navigation settings")?;
    let mut driver = BatchDriver::new(config, factory).with_cancel_flag(cancel);
    let summary = driver.run().await.context("batch run failed")?;
    let rendered = serde_json::to_string(&summary)?;
    info!(summary = %rendered, "run finished");

    match summary.final_state {
        RunState::HaltedByCircuitBreaker => warn!(
            failure_rate = format_args!("{:.1}", summary.counters.failure_rate()),
            "halted by circuit breaker; wait before re-running to resume"
        ),
        RunState::Interrupted => info!("interrupted; re-run to resume"),
        _ => {}
    }
    if let Some(original) = &summary.redirected_from {
        warn!(
            original = %original.display(),
            store = %summary.store_path.display(),
            "results were written to a separate store"
        );
    }
    Ok(())
}

/// First Ctrl-C stops after the current record; a second one exits at once.
fn spawn_interrupt_watcher(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if cancel.swap(true, Ordering::SeqCst) {
                warn!("second interrupt; exiting without waiting");
                process::exit(130);
            }
            warn!("interrupt received; finishing the current record");
        }
    });
}
