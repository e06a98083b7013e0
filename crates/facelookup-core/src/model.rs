//! Model lifecycle: builds, swaps and serves the trained LBPH model.
//!
//! Readers load an `Arc<ModelSnapshot>` without taking any lock. Builds are
//! serialised by a mutex and publish a new snapshot with a single atomic
//! store, so a model and the label map it was trained with are always
//! observed together.
//!
//! Enrollment changes bump a generation counter. A snapshot built from an
//! older generation is stale; what readers get in that case depends on
//! [`StalenessPolicy`].

use crate::config::{LbphConfig, ModelConfig, StalenessPolicy};
use crate::enrollment::{EnrollmentSource, SampleExtractor};
use crate::lbph::{LabelMap, LbphModel, TrainedModel};
use crate::preprocess::CanonicalFace;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model rebuild failed: {0}")]
    RebuildFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// No usable enrollment data.
    Empty,
    /// A rebuild is running.
    Training,
    /// The model reflects current enrollment.
    Ready,
    /// Enrollment changed after the model was built; still queryable.
    Stale,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Training => "training",
            Self::Ready => "ready",
            Self::Stale => "stale",
        }
    }
}

/// Immutable view of the model handed to readers.
#[derive(Debug)]
pub struct ModelSnapshot {
    trained: Option<TrainedModel>,
    generation: u64,
}

impl ModelSnapshot {
    pub fn new(trained: Option<TrainedModel>, generation: u64) -> Self {
        Self { trained, generation }
    }

    fn empty(generation: u64) -> Self {
        Self::new(None, generation)
    }

    /// `None` when nothing is enrolled or no sample was usable.
    pub fn trained(&self) -> Option<&TrainedModel> {
        self.trained.as_ref()
    }

    /// Enrollment generation this snapshot was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity_count(&self) -> usize {
        self.trained.as_ref().map_or(0, |t| t.label_map().len())
    }

    pub fn sample_count(&self) -> usize {
        self.trained.as_ref().map_or(0, |t| t.model().sample_count())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub identity_count: usize,
    pub sample_count: usize,
    pub generation: u64,
    pub enrollment_generation: u64,
    pub last_build_duration_ms: Option<f64>,
    pub last_built_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub staleness_policy: StalenessPolicy,
}

#[derive(Debug, Default)]
struct BuildRecord {
    last_duration: Option<Duration>,
    last_built_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    failed_generation: Option<u64>,
}

/// Clears the building flag even if the build unwinds.
struct BuildingGuard<'a>(&'a AtomicBool);

impl<'a> BuildingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ModelManager {
    source: Arc<dyn EnrollmentSource>,
    extractor: SampleExtractor,
    lbph: LbphConfig,
    config: ModelConfig,
    current: ArcSwap<ModelSnapshot>,
    enrollment_generation: AtomicU64,
    building: AtomicBool,
    build_lock: Mutex<()>,
    record: Mutex<BuildRecord>,
    worker: Option<mpsc::UnboundedSender<()>>,
}

impl ModelManager {
    /// Create a manager. Nothing is trained until the first reader or an
    /// explicit [`rebuild`](Self::rebuild), unless a cached model is found.
    pub fn new(
        source: Arc<dyn EnrollmentSource>,
        extractor: SampleExtractor,
        lbph: LbphConfig,
        config: ModelConfig,
    ) -> Arc<Self> {
        let initial = ModelSnapshot::new(load_cache(&config, &lbph, extractor.canonical_size()), 0);
        let record = BuildRecord {
            last_built_at: initial.trained().map(|t| t.built_at()),
            ..BuildRecord::default()
        };

        let wants_worker = config.background_rebuild && config.staleness == StalenessPolicy::ServeStale;
        Arc::new_cyclic(|weak: &Weak<ModelManager>| {
            let worker = if wants_worker { spawn_worker(weak.clone()) } else { None };
            Self {
                source,
                extractor,
                lbph,
                config,
                current: ArcSwap::from_pointee(initial),
                // Starts ahead of the initial snapshot so it reads as out of date.
                enrollment_generation: AtomicU64::new(1),
                building: AtomicBool::new(false),
                build_lock: Mutex::new(()),
                record: Mutex::new(record),
                worker,
            }
        })
    }

    /// The model readers should match against.
    ///
    /// With no model at all this builds synchronously (cold start). With a
    /// stale model it either rebuilds first or returns the stale snapshot and
    /// schedules a background rebuild, per the staleness policy. Without a
    /// worker thread a stale model is always rebuilt here.
    pub fn current_model(&self) -> Arc<ModelSnapshot> {
        let snapshot = self.current.load_full();
        let generation = self.enrollment_generation.load(Ordering::SeqCst);
        if snapshot.generation >= generation {
            return snapshot;
        }
        if self.record.lock().failed_generation == Some(generation) {
            return snapshot;
        }

        let cold = snapshot.trained.is_none();
        if cold || self.config.staleness == StalenessPolicy::BlockUntilRebuilt || self.worker.is_none() {
            self.rebuild_for_reader();
            return self.current.load_full();
        }
        self.schedule_rebuild();
        snapshot
    }

    /// Mark the model out of date after an enrollment change.
    pub fn invalidate(&self) {
        let generation = self.enrollment_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "enrollment changed, model invalidated");
        self.schedule_rebuild();
    }

    /// Rebuild from the full enrollment set and swap the result in.
    ///
    /// On failure the previous snapshot stays active.
    pub fn rebuild(&self) -> Result<Arc<ModelSnapshot>, ModelError> {
        let _guard = self.build_lock.lock();
        self.build_locked()
    }

    /// Rebuild only if enrollment changed since the current snapshot.
    /// Returns whether a build ran.
    pub fn rebuild_if_needed(&self) -> Result<bool, ModelError> {
        let _guard = self.build_lock.lock();
        if !self.is_stale() {
            tracing::debug!("model up to date, rebuild skipped");
            return Ok(false);
        }
        self.build_locked().map(|_| true)
    }

    pub fn state(&self) -> ModelState {
        self.state_of(&self.current.load())
    }

    /// State as seen by a reader holding `snapshot`, which may already have
    /// been replaced.
    pub fn state_of(&self, snapshot: &ModelSnapshot) -> ModelState {
        if self.building.load(Ordering::SeqCst) {
            ModelState::Training
        } else if snapshot.trained.is_none() {
            ModelState::Empty
        } else if snapshot.generation < self.enrollment_generation.load(Ordering::SeqCst) {
            ModelState::Stale
        } else {
            ModelState::Ready
        }
    }

    pub fn status(&self) -> ModelStatus {
        let snapshot = self.current.load_full();
        let record = self.record.lock();
        ModelStatus {
            state: self.state(),
            identity_count: snapshot.identity_count(),
            sample_count: snapshot.sample_count(),
            generation: snapshot.generation,
            enrollment_generation: self.enrollment_generation.load(Ordering::SeqCst),
            last_build_duration_ms: record.last_duration.map(|d| d.as_secs_f64() * 1000.0),
            last_built_at: record.last_built_at,
            last_error: record.last_error.clone(),
            staleness_policy: self.config.staleness,
        }
    }

    fn is_stale(&self) -> bool {
        self.current.load().generation < self.enrollment_generation.load(Ordering::SeqCst)
    }

    fn schedule_rebuild(&self) {
        if let Some(tx) = &self.worker {
            let _ = tx.send(());
        }
    }

    /// Synchronous rebuild on the read path. Waits at most `rebuild_wait_secs`
    /// for a build another thread already started.
    fn rebuild_for_reader(&self) {
        let wait = Duration::from_secs(self.config.rebuild_wait_secs);
        let Some(_guard) = self.build_lock.try_lock_for(wait) else {
            tracing::warn!(wait_secs = wait.as_secs(), "timed out waiting for model rebuild, serving current snapshot");
            return;
        };
        // Another reader may have finished the build while we waited.
        if !self.is_stale() {
            return;
        }
        if let Err(e) = self.build_locked() {
            tracing::warn!(error = %e, "synchronous rebuild failed");
        }
    }

    /// Caller must hold `build_lock`.
    fn build_locked(&self) -> Result<Arc<ModelSnapshot>, ModelError> {
        let _building = BuildingGuard::set(&self.building);
        // Read before listing so a change that races the build leaves it stale.
        let generation = self.enrollment_generation.load(Ordering::SeqCst);
        let started = Instant::now();

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.train(generation)))
            .unwrap_or_else(|_| Err(ModelError::RebuildFailed("rebuild panicked".into())));
        let elapsed = started.elapsed();

        match outcome {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Arc::clone(&snapshot));
                {
                    let mut record = self.record.lock();
                    record.last_duration = Some(elapsed);
                    record.last_built_at = snapshot.trained().map(|t| t.built_at());
                    record.last_error = None;
                    record.failed_generation = None;
                }
                tracing::info!(
                    identities = snapshot.identity_count(),
                    samples = snapshot.sample_count(),
                    generation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "model rebuilt"
                );
                self.write_cache(snapshot.trained());
                Ok(snapshot)
            }
            Err(e) => {
                {
                    let mut record = self.record.lock();
                    record.last_error = Some(e.to_string());
                    record.failed_generation = Some(generation);
                }
                tracing::warn!(error = %e, generation, "model rebuild failed, keeping previous model");
                Err(e)
            }
        }
    }

    fn train(&self, generation: u64) -> Result<ModelSnapshot, ModelError> {
        let mut identities = self
            .source
            .list_identities()
            .map_err(|e| ModelError::RebuildFailed(e.to_string()))?;
        identities.sort_by_key(|i| i.id);

        let mut records = Vec::new();
        let mut faces: Vec<(u32, CanonicalFace)> = Vec::new();
        for identity in &identities {
            let samples = self.extractor.extract(identity);
            if samples.is_empty() {
                continue;
            }
            let label = records.len() as u32;
            records.push(identity.record());
            faces.extend(samples.into_iter().map(|face| (label, face)));
        }

        if faces.is_empty() {
            tracing::warn!(identities = identities.len(), "no usable face samples, model is empty");
            return Ok(ModelSnapshot::empty(generation));
        }

        let refs: Vec<(u32, &CanonicalFace)> = faces.iter().map(|(l, f)| (*l, f)).collect();
        let model = LbphModel::train(self.lbph, &refs).map_err(|e| ModelError::RebuildFailed(e.to_string()))?;
        let trained = TrainedModel::new(model, LabelMap::from_records(records))
            .map_err(|e| ModelError::RebuildFailed(e.to_string()))?;
        Ok(ModelSnapshot {
            trained: Some(trained),
            generation,
        })
    }

    /// Persist the model, or drop the cache when nothing is trained so a
    /// restart cannot resurrect deleted identities.
    fn write_cache(&self, trained: Option<&TrainedModel>) {
        let Some(path) = &self.config.cache_path else {
            return;
        };
        match trained {
            Some(trained) => {
                if let Err(e) = trained.save(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write model cache");
                }
            }
            None => match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "model empty, cache removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove model cache"),
            },
        }
    }
}

fn load_cache(config: &ModelConfig, lbph: &LbphConfig, canonical: (u32, u32)) -> Option<TrainedModel> {
    let path = config.cache_path.as_ref()?;
    if !path.exists() {
        return None;
    }
    match TrainedModel::load(path) {
        Ok(trained)
            if trained.model().params() == *lbph && trained.model().face_size() == [canonical.0, canonical.1] =>
        {
            tracing::info!(
                path = %path.display(),
                identities = trained.label_map().len(),
                built_at = %trained.built_at(),
                "loaded cached model"
            );
            Some(trained)
        }
        Ok(_) => {
            tracing::warn!(path = %path.display(), "cached model uses different parameters, ignored");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read cached model, ignored");
            None
        }
    }
}

/// Dedicated rebuild thread. Bursts of requests collapse into one build; the
/// thread exits when the manager is dropped.
fn spawn_worker(manager: Weak<ModelManager>) -> Option<mpsc::UnboundedSender<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let spawned = std::thread::Builder::new()
        .name("facelookup-model".into())
        .spawn(move || {
            tracing::debug!("model worker started");
            while rx.blocking_recv().is_some() {
                let mut coalesced = 0usize;
                while rx.try_recv().is_ok() {
                    coalesced += 1;
                }
                if coalesced > 0 {
                    tracing::debug!(coalesced, "coalesced rebuild requests");
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let generation = manager.enrollment_generation.load(Ordering::SeqCst);
                if manager.record.lock().failed_generation == Some(generation) {
                    continue;
                }
                // Errors are already logged and recorded in the status.
                let _ = manager.rebuild_if_needed();
            }
            tracing::debug!("model worker exiting");
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            tracing::warn!(error = %e, "cannot spawn model worker, rebuilds will run on demand");
            None
        }
    }
}
