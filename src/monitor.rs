use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::MonitorSettings,
    diff::{Diff, diff},
    dispatch::{DispatchReport, Dispatcher},
    domain::GroupDirectory,
    render::Renderer,
    slack::{MentionResolver, Notifier},
    storage::{CacheStore, ReviewCache},
    swarm::{FetchError, ReviewSource},
};

/// Poll loop: fetch, diff, dispatch, persist. One cycle at a time, forever,
/// until the review fetch fails.
pub struct Monitor<S, N, M> {
    source: S,
    notifier: N,
    mentions: M,
    renderer: Renderer,
    channel: String,
    store: CacheStore,
    cache: ReviewCache,
    groups: GroupDirectory,
    group_refresh: RefreshSchedule,
    poll_interval: Duration,
}

enum Phase {
    Priming,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The fetch came back empty; nothing was diffed or persisted.
    Skipped,
    Completed {
        reviews: usize,
        events: usize,
        dispatch: DispatchReport,
    },
}

impl<S: ReviewSource, N: Notifier, M: MentionResolver> Monitor<S, N, M> {
    pub fn new(
        source: S,
        notifier: N,
        mentions: M,
        renderer: Renderer,
        channel: String,
        store: CacheStore,
        settings: &MonitorSettings,
    ) -> Self {
        Self {
            source,
            notifier,
            mentions,
            renderer,
            channel,
            store,
            cache: ReviewCache::default(),
            groups: GroupDirectory::default(),
            group_refresh: RefreshSchedule::new(settings.group_refresh_interval()),
            poll_interval: settings.poll_interval(),
        }
    }

    /// Runs until a fatal fetch failure. Recovery is left to the process
    /// supervisor.
    pub fn run(mut self) -> Result<(), MonitorError> {
        let mut phase = Phase::Priming;
        loop {
            match phase {
                Phase::Priming => {
                    log_outcome(&self.prime(Utc::now())?);
                    phase = Phase::Polling;
                }
                Phase::Polling => {
                    thread::sleep(self.poll_interval);
                    log_outcome(&self.cycle(Utc::now())?);
                }
            }
        }
    }

    /// Loads the stored cache and reconciles it with the first live fetch.
    /// Thread handles from the previous run are reused, so reviews that were
    /// already announced are not announced again.
    pub fn prime(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, MonitorError> {
        self.cache = self.store.load();
        info!(cached = self.cache.len(), path = %self.store.path().display(), "Priming review monitor");
        self.cycle(now)
    }

    pub fn cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, MonitorError> {
        self.maybe_refresh_groups();

        let fetched = self.source.fetch_reviews().map_err(|err| {
            error!(error = %err, "Issue retrieving Swarm reviews");
            MonitorError::Fetch(err)
        })?;
        if fetched.is_empty() {
            warn!("Swarm returned no reviews; keeping previous cache");
            return Ok(CycleOutcome::Skipped);
        }

        let reviews = fetched.len();
        let current = self.cache.carry_threads(fetched);
        let Diff { events, mut next } = diff(&self.cache, current, now);

        let dispatch = Dispatcher {
            notifier: &self.notifier,
            source: &self.source,
            mentions: &self.mentions,
            renderer: &self.renderer,
            groups: &self.groups,
            channel: &self.channel,
        }
        .dispatch(&events, &mut next);

        self.cache = next;
        if let Err(err) = self.store.save(&self.cache) {
            error!(error = %err, path = %self.store.path().display(), "Failed to persist review cache");
        }

        Ok(CycleOutcome::Completed {
            reviews,
            events: events.len(),
            dispatch,
        })
    }

    fn maybe_refresh_groups(&mut self) {
        if !self.group_refresh.should_trigger() {
            return;
        }
        self.group_refresh.mark_triggered();

        match self.source.fetch_groups() {
            Ok(groups) => {
                self.groups = GroupDirectory::new(groups);
                info!(groups = self.groups.len(), "Refreshed Swarm groups");
            }
            Err(err) => {
                warn!(error = %err, "Could not retrieve Swarm groups; keeping previous snapshot");
            }
        }
    }

    #[cfg(test)]
    fn cache(&self) -> &ReviewCache {
        &self.cache
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => {}
        CycleOutcome::Completed { events: 0, .. } => {}
        CycleOutcome::Completed {
            reviews,
            events,
            dispatch,
        } => info!(
            reviews,
            events,
            threads_created = dispatch.threads_created,
            replies_sent = dispatch.replies_sent,
            suppressed = dispatch.suppressed,
            failed = dispatch.failed,
            "Cycle complete"
        ),
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Review fetch failed; stopping monitor: {0}")]
    Fetch(#[from] FetchError),
}

struct RefreshSchedule {
    interval: Duration,
    last_run: Option<Instant>,
}

impl RefreshSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    fn should_trigger(&self) -> bool {
        match self.last_run {
            None => true,
            Some(instant) => instant.elapsed() >= self.interval,
        }
    }

    fn mark_triggered(&mut self) {
        self.last_run = Some(Instant::now());
    }
}
