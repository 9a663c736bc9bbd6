//! Cleaner scheduling
//!
//! `Scheduler::run_cycle` performs one step of the daemon loop: decide
//! whether to clean, pick segments, reclaim them and report how long to
//! sleep before the next step. Commands from clients change the state
//! between cycles.

use crate::config::CleanerConfig;
use crate::error::CleanerError;
use crate::policy::{policy_by_name, SelectionPolicy};
use crate::reclaim::{ReclaimParams, ReclaimStats, Reclaimer};
use crate::state::{CleanerState, DaemonStatus, ManualJob, RunArgs};
use lfsgc_core::{ControlError, FsControl, Geometry, UsageStat};
use lfsgc_journal::{Clock, ReverseMapper};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Segment usage entries fetched per control call
pub const SUINFO_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: DaemonStatus,
    pub job_id: Option<u32>,
    pub cleaned_total: u64,
}

/// Result of one scheduler step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// How long to wait before the next step
    pub sleep: Duration,
    /// Set when a reclaim ran
    pub stats: Option<ReclaimStats>,
    /// Manual job that completed during this step
    pub finished_job: Option<u32>,
}

impl CycleOutcome {
    fn idle(sleep: Duration) -> Self {
        Self {
            sleep,
            stats: None,
            finished_job: None,
        }
    }
}

#[derive(Debug, Default)]
struct Selection {
    segnums: Vec<u64>,
    /// Reclaimable segments seen, selected or not
    reclaimable: u64,
    /// Oldest last-modified time among protected reclaimable segments
    oldest_protected: Option<u64>,
}

/// Settings in force for one cycle
#[derive(Debug, Clone, Copy)]
struct Settings {
    protection_period: u64,
    nsegments: usize,
    interval: Duration,
    min_reclaimable: Option<u64>,
}

pub struct Scheduler {
    control: Arc<dyn FsControl>,
    clock: Arc<dyn Clock>,
    config: CleanerConfig,
    policy: Box<dyn SelectionPolicy>,
    mapper: ReverseMapper,
    reclaimer: Reclaimer,
    state: CleanerState,
    /// Tuned values for automatic cleaning
    overrides: RunArgs,
    next_job_id: u32,
    /// Reduced batch size after a transient failure
    shrunk_batch: Option<usize>,
    last_nongc_ctime: Option<u64>,
    /// Reclaimable segments found by the last selection
    last_reclaimable: Option<u64>,
    cleaned_total: u64,
    span: tracing::Span,
}

impl Scheduler {
    pub fn new(
        control: Arc<dyn FsControl>,
        clock: Arc<dyn Clock>,
        config: CleanerConfig,
        span: tracing::Span,
    ) -> Result<Self, CleanerError> {
        config.validate()?;
        let policy = Self::policy(&config)?;
        let mapper = ReverseMapper::new(control.clone(), clock.clone(), span.clone());
        let reclaimer = Reclaimer::new(
            control.clone(),
            clock.clone(),
            config.use_set_suinfo,
            span.clone(),
        );
        Ok(Self {
            control,
            clock,
            config,
            policy,
            mapper,
            reclaimer,
            state: CleanerState::Idle,
            overrides: RunArgs::default(),
            next_job_id: 1,
            shrunk_batch: None,
            last_nongc_ctime: None,
            last_reclaimable: None,
            cleaned_total: 0,
            span,
        })
    }

    fn policy(config: &CleanerConfig) -> Result<Box<dyn SelectionPolicy>, CleanerError> {
        policy_by_name(&config.selection_policy).ok_or_else(|| {
            CleanerError::Config(format!("unknown selection policy {:?}", config.selection_policy))
        })
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    pub fn state(&self) -> &CleanerState {
        &self.state
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            status: self.state.status(),
            job_id: self.state.job().map(|job| job.id),
            cleaned_total: self.cleaned_total,
        }
    }

    /// Start a manual job and return its id
    pub fn run(&mut self, args: RunArgs) -> u32 {
        let id = self.next_job_id;
        self.next_job_id = id.wrapping_add(1).max(1);
        if let Some(old) = self.state.job() {
            tracing::info!(parent: &self.span, job = old.id, "manual job replaced");
        }
        self.state = self.state.run(ManualJob::new(id, args));
        self.last_reclaimable = None;
        tracing::info!(parent: &self.span, job = id, ?args, "manual job started");
        id
    }

    pub fn suspend(&mut self) {
        self.state = self.state.suspend();
        tracing::info!(parent: &self.span, "cleaning suspended");
    }

    pub fn resume(&mut self) {
        self.state = self.state.resume();
        tracing::info!(parent: &self.span, status = ?self.state.status(), "cleaning resumed");
    }

    /// Cancel the manual job, returning its id
    pub fn stop(&mut self) -> Option<u32> {
        let cancelled = self.state.job().map(|job| job.id);
        self.state = self.state.stop();
        if let Some(job) = cancelled {
            tracing::info!(parent: &self.span, job, "manual job stopped");
        }
        cancelled
    }

    /// Adjust the manual job if there is one, automatic cleaning otherwise
    pub fn tune(&mut self, args: RunArgs) {
        match self.state.job_mut() {
            Some(job) => job.args.merge(&args),
            None => self.overrides.merge(&args),
        }
        tracing::info!(parent: &self.span, ?args, "cleaner tuned");
    }

    /// Switch to a new configuration; the old one stays on error
    pub fn reload(&mut self, config: CleanerConfig) -> Result<(), CleanerError> {
        config.validate()?;
        self.policy = Self::policy(&config)?;
        self.reclaimer.set_use_set_suinfo(config.use_set_suinfo);
        self.config = config;
        self.overrides = RunArgs::default();
        self.shrunk_batch = None;
        tracing::info!(parent: &self.span, "configuration reloaded");
        Ok(())
    }

    /// One step of the cleaning loop
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, CleanerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let check = self.config.clean_check_interval();

        if self.state.is_suspended() {
            return Ok(CycleOutcome::idle(check));
        }

        let stat = self.control.usage_stat()?;
        let geometry = *self.control.geometry();
        let Some(accelerated) = self.update_watermarks(&stat, &geometry) else {
            return Ok(CycleOutcome::idle(check));
        };
        let settings = self.settings(accelerated, &geometry);
        let now = self.now();

        let protcno = self.mapper.track_back(settings.protection_period)?;
        let prottime = now.saturating_sub(settings.protection_period);

        let written = self.last_nongc_ctime != Some(stat.nongc_ctime);
        self.last_nongc_ctime = Some(stat.nongc_ctime);
        let mut selection = if self.last_reclaimable == Some(0) && !written {
            tracing::trace!("no writes since nothing was reclaimable, skipping scan");
            Selection::default()
        } else {
            let limit = self.shrunk_batch.unwrap_or(settings.nsegments);
            self.select_segments(limit, prottime, now)?
        };
        self.last_reclaimable = Some(selection.reclaimable);

        if let CleanerState::RunningManual(job) = &mut self.state {
            if !job.in_pass() {
                job.remaining_segments = selection.reclaimable;
                tracing::debug!(job = job.id, segments = selection.reclaimable, "pass started");
            }
            selection
                .segnums
                .truncate(usize::try_from(job.remaining_segments).unwrap_or(usize::MAX));
        }

        if selection.segnums.is_empty() {
            let finished = self.end_manual_pass();
            return Ok(CycleOutcome {
                sleep: self.idle_timeout(&selection, settings.protection_period, now),
                stats: None,
                finished_job: finished,
            });
        }

        let params = ReclaimParams {
            protseq: stat.prot_seq,
            protcno: Some(protcno),
            min_reclaimable_blocks: settings.min_reclaimable,
            dry_run: false,
        };
        match self.reclaimer.reclaim(&selection.segnums, &params) {
            Ok(stats) => {
                if self.shrunk_batch.take().is_some() {
                    tracing::info!(batch = settings.nsegments, "batch size restored");
                }
                self.cleaned_total += stats.cleaned_segs as u64;
                let done = stats.cleaned_segs + stats.deferred_segs + stats.protected_segs;
                let finished = self.advance_manual_job(done as u64);
                Ok(CycleOutcome {
                    sleep: settings.interval,
                    stats: Some(stats),
                    finished_job: finished,
                })
            }
            Err(err) if err.is_transient() => {
                let shrunk = (selection.segnums.len() / 2).max(1);
                self.shrunk_batch = Some(shrunk);
                tracing::warn!(error = %err, batch = shrunk, "reclaim failed, retrying later");
                Ok(CycleOutcome::idle(self.config.retry_interval()))
            }
            Err(err) => Err(err),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now().realtime.max(0) as u64
    }

    /// Move between idle and automatic cleaning by clean-segment count
    ///
    /// Returns `None` when this cycle should not clean, otherwise whether
    /// clean segments are low enough to clean faster.
    fn update_watermarks(&mut self, stat: &UsageStat, geometry: &Geometry) -> Option<bool> {
        let reserved = geometry.reserved_segments();
        let min_clean = self.config.min_clean_segments.resolve(stat.nsegs);
        let max_clean = self.config.max_clean_segments.resolve(stat.nsegs);
        let low = min_clean + reserved;
        let high = max_clean + reserved;
        let accelerated = min_clean > 0 && stat.ncleansegs < low;

        match self.state {
            CleanerState::SuspendedManual { .. } => None,
            CleanerState::RunningManual(_) => Some(accelerated),
            _ if min_clean == 0 => {
                self.state = CleanerState::RunningAutomatic;
                Some(false)
            }
            CleanerState::Idle if stat.ncleansegs < low => {
                tracing::info!(clean = stat.ncleansegs, low, "clean segments low, cleaning");
                self.state = CleanerState::RunningAutomatic;
                Some(accelerated)
            }
            CleanerState::Idle => None,
            CleanerState::RunningAutomatic if stat.ncleansegs >= high => {
                tracing::info!(clean = stat.ncleansegs, high, "enough clean segments, pausing");
                self.state = CleanerState::Idle;
                None
            }
            CleanerState::RunningAutomatic => Some(accelerated),
        }
    }

    fn settings(&self, accelerated: bool, geometry: &Geometry) -> Settings {
        let config = &self.config;
        let args = self.state.job().map_or(self.overrides, |job| job.args);
        let (nsegments, interval, min_blocks) = if accelerated {
            (
                config.mc_nsegments_per_clean,
                config.mc_cleaning_interval,
                config.mc_min_reclaimable_blocks,
            )
        } else {
            (
                config.nsegments_per_clean,
                config.cleaning_interval,
                config.min_reclaimable_blocks,
            )
        };
        let min_reclaimable = args
            .min_reclaimable_blocks
            .unwrap_or_else(|| min_blocks.resolve(u64::from(geometry.blocks_per_segment)));

        Settings {
            protection_period: args.protection_period.unwrap_or(config.protection_period),
            nsegments: args.nsegments_per_clean.unwrap_or(nsegments).max(1) as usize,
            interval: Duration::from_secs(args.cleaning_interval.unwrap_or(interval)),
            min_reclaimable: (min_reclaimable > 0).then_some(min_reclaimable),
        }
    }

    /// Oldest unprotected reclaimable segments, at most `limit`
    fn select_segments(
        &self,
        limit: usize,
        prottime: u64,
        now: u64,
    ) -> Result<Selection, ControlError> {
        let nsegs = self.control.geometry().nsegments;
        let mut selection = Selection::default();
        let mut candidates = Vec::new();
        let mut start = 0;

        while start < nsegs {
            let batch = self.control.segment_usage(start, SUINFO_BATCH)?;
            let Some(last) = batch.last() else {
                break;
            };
            start = last.segnum + 1;
            for usage in batch.iter().filter(|u| u.is_reclaimable()) {
                selection.reclaimable += 1;
                let importance = self.policy.importance(usage, now);
                if importance < prottime {
                    candidates.push((importance, usage.segnum));
                } else {
                    selection.oldest_protected = Some(
                        selection
                            .oldest_protected
                            .map_or(usage.lastmod, |oldest| oldest.min(usage.lastmod)),
                    );
                }
            }
        }

        candidates.sort_unstable();
        selection.segnums = candidates
            .into_iter()
            .take(limit)
            .map(|(_, segnum)| segnum)
            .collect();
        tracing::debug!(
            selected = selection.segnums.len(),
            reclaimable = selection.reclaimable,
            "segments selected"
        );
        Ok(selection)
    }

    /// Sleep until the oldest protected segment may be cleaned
    fn idle_timeout(&self, selection: &Selection, period: u64, now: u64) -> Duration {
        let check = self.config.clean_check_interval();
        match selection.oldest_protected {
            Some(lastmod) => {
                let wait = lastmod.saturating_add(period).saturating_sub(now);
                check.max(Duration::from_secs(wait))
            }
            None => check,
        }
    }

    /// An empty selection ends the current manual pass
    fn end_manual_pass(&mut self) -> Option<u32> {
        let CleanerState::RunningManual(job) = &mut self.state else {
            return None;
        };
        let id = job.id;
        if job.end_pass() {
            self.state = self.state.finish();
            tracing::info!(job = id, "manual job finished");
            return Some(id);
        }
        None
    }

    fn advance_manual_job(&mut self, done: u64) -> Option<u32> {
        let CleanerState::RunningManual(job) = &mut self.state else {
            return None;
        };
        job.remaining_segments = job.remaining_segments.saturating_sub(done);
        if job.in_pass() {
            return None;
        }
        self.end_manual_pass()
    }
}
