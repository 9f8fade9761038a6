pub mod config;
pub mod coordinates;
pub mod driver;
pub mod errors;
pub mod gazetteer;
pub mod ingestion;
pub mod navigation;
pub mod outcome;
pub mod pacing;
pub mod resolution;
pub mod resume;
pub mod store;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, ColumnMap, PacingConfig};
pub use coordinates::{extract_coordinates, Coordinates};
pub use driver::{BatchDriver, RunState, RunSummary};
pub use errors::{AppError, AppResult};
pub use ingestion::AddressRecord;
pub use navigation::{Navigator, SessionFactory, WebDriverSessionFactory};
pub use outcome::{ResolutionOutcome, Status, Tier};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,maps_batch_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
