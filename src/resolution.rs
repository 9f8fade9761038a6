use std::time::Duration;

use reqwest::Url;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::coordinates::extract_coordinates;
use crate::errors::{AppError, AppResult};
use crate::gazetteer::Gazetteer;
use crate::ingestion::AddressRecord;
use crate::navigation::Navigator;
use crate::outcome::{ResolutionOutcome, Tier};

/// Primary-then-fallback resolution for a single record.
pub struct Resolver {
    gazetteer: Gazetteer,
    search_base: Url,
}

impl Resolver {
    pub fn new(gazetteer: Gazetteer, search_base_url: &str) -> AppResult<Self> {
        let search_base = Url::parse(search_base_url).map_err(|err| {
            AppError::Config(format!("invalid search base URL '{search_base_url}': {err}"))
        })?;
        if search_base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "search base URL '{search_base_url}' cannot carry a query path"
            )));
        }
        Ok(Self {
            gazetteer,
            search_base,
        })
    }

    pub fn gazetteer(&self) -> &Gazetteer {
        &self.gazetteer
    }

    /// Resolves one record. Navigation faults become `error:` outcomes.
    ///
    /// `fallback_delay` is waited out before a second navigation for the
    /// same record, so the fallback target is paced like any other request.
    pub async fn resolve(
        &self,
        record: &AddressRecord,
        navigator: &mut dyn Navigator,
        fallback_delay: Duration,
    ) -> ResolutionOutcome {
        match self.attempt(record, navigator, fallback_delay).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target: "resolution", id = %record.id, error = %err, "navigation fault");
                ResolutionOutcome::error(record, err.to_string())
            }
        }
    }

    async fn attempt(
        &self,
        record: &AddressRecord,
        navigator: &mut dyn Navigator,
        fallback_delay: Duration,
    ) -> AppResult<ResolutionOutcome> {
        let resolved = navigator.resolve(&record.target).await?;
        if let Some(point) = extract_coordinates(&resolved) {
            return Ok(ResolutionOutcome::success(
                record,
                record.target.as_str(),
                resolved,
                point,
                Tier::Exact,
            ));
        }

        if let Some(fallback) = record.distinct_fallback() {
            let target = self.fallback_target(fallback);
            debug!(
                target: "resolution",
                id = %record.id,
                fallback = %target,
                delay_ms = fallback_delay.as_millis() as u64,
                "primary failed; trying fallback target"
            );
            if !fallback_delay.is_zero() {
                sleep(fallback_delay).await;
            }
            let fallback_resolved = navigator.resolve(&target).await?;
            return Ok(match extract_coordinates(&fallback_resolved) {
                Some(point) => ResolutionOutcome::success(
                    record,
                    target,
                    fallback_resolved,
                    point,
                    Tier::Fallback,
                ),
                None => ResolutionOutcome::failed(record, record.target.as_str(), resolved),
            });
        }

        if let Some(locality) = record.locality.as_deref() {
            let region = record.region.as_deref().unwrap_or_default();
            if let Some(point) = self.gazetteer.lookup(locality, region) {
                debug!(
                    target: "resolution",
                    id = %record.id,
                    locality,
                    region,
                    "resolved from gazetteer"
                );
                return Ok(ResolutionOutcome::success(
                    record,
                    format!("gazetteer:{locality}, {region}"),
                    resolved,
                    point,
                    Tier::Fallback,
                ));
            }
        }

        Ok(ResolutionOutcome::failed(record, record.target.as_str(), resolved))
    }

    /// Absolute URLs pass through; free text becomes a search URL.
    pub fn fallback_target(&self, fallback: &str) -> String {
        let fallback = fallback.trim();
        if fallback.starts_with("http://") || fallback.starts_with("https://") {
            return fallback.to_string();
        }
        let mut url = self.search_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(fallback);
        }
        url.to_string()
    }
}
