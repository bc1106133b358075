//! Sequencing of one image through cache, segmentation, analysis, meshing
//! and delivery.

use crate::cache::CacheEntry;
use crate::cache::CacheError;
use crate::cache::ResultCache;
use crate::config::Config;
use crate::delivery::DeliveryClient;
use crate::delivery::PatientInfo;
use crate::delivery::WirePayload;
use crate::enums::PipelineState;
use crate::mesh_extractor::MeshError;
use crate::mesh_extractor::MeshExtractor;
use crate::metrics::VolumeAnalyzer;
use crate::metrics::VolumeMetrics;
use crate::predictor::Predictor;
use crate::predictor::PredictorError;
use crate::volume::LabelVolume;
use crate::volume_loader::VolumeLoader;
use crate::volume_loader::VolumeLoaderError;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input image not found: {0}")]
    MissingInput(PathBuf),

    #[error("run cancelled before {0}")]
    Cancelled(PipelineState),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Predictor(#[from] PredictorError),

    #[error(transparent)]
    Volume(#[from] VolumeLoaderError),

    #[error(transparent)]
    Mesh(#[from] MeshError),
}

/// Cooperative cancellation flag shared with the caller.
///
/// The pipeline checks it between stages; a stage that has started always
/// runs to completion. Files written before cancellation are left in place.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub from_cache: bool,
    pub label_volume_path: Option<PathBuf>,
    /// `None` on a cache hit whose label volume no longer exists.
    pub metrics: Option<VolumeMetrics>,
    pub mesh_assets: Vec<(u16, PathBuf)>,
    /// `None` when delivery was not requested or had nothing to send.
    pub delivered: Option<bool>,
}

/// Drives pipeline runs. Owns the result cache, so a single orchestrator is
/// the only writer of its index, and `&mut self` keeps runs sequential.
pub struct Pipeline<P: Predictor> {
    config: Config,
    predictor: P,
    cache: Option<ResultCache>,
    analyzer: VolumeAnalyzer,
    extractor: MeshExtractor,
    client: DeliveryClient,
    state: PipelineState,
}

impl<P: Predictor> Pipeline<P> {
    /// # Errors
    ///
    /// Fails if caching is enabled and the cache index cannot be loaded.
    pub fn new(config: Config, predictor: P) -> Result<Self, PipelineError> {
        let cache = if config.cache.enabled {
            Some(ResultCache::open(&config.paths.cache_dir)?)
        } else {
            None
        };
        let analyzer = VolumeAnalyzer::new(config.labels.liver, config.labels.tumor);
        let extractor = MeshExtractor::new(config.mesh.smoothing(), config.labels.names.clone());
        let client = DeliveryClient::new(config.delivery.timeout(), config.delivery.pacing());

        Ok(Self {
            config,
            predictor,
            cache,
            analyzer,
            extractor,
            client,
            state: PipelineState::Idle,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_mut(&mut self) -> Option<&mut ResultCache> {
        self.cache.as_mut()
    }

    /// Process `image`, delivering the result when `patient` is given.
    ///
    /// On error the pipeline ends in [`PipelineState::Failed`] and the cause
    /// is returned.
    pub fn run(
        &mut self,
        image: &Path,
        patient: Option<&PatientInfo>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        self.state = PipelineState::Idle;
        match self.run_stages(image, patient, cancel) {
            Ok(outcome) => {
                self.transition(PipelineState::Done);
                Ok(outcome)
            }
            Err(err) => {
                warn!(image = %image.display(), error = %err, "pipeline failed");
                self.transition(PipelineState::Failed);
                Err(err)
            }
        }
    }

    fn run_stages(
        &mut self,
        image: &Path,
        patient: Option<&PatientInfo>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        if !image.is_file() {
            return Err(PipelineError::MissingInput(image.to_path_buf()));
        }

        self.enter(PipelineState::CacheCheck, cancel)?;
        let key = match &self.cache {
            Some(_) => Some(ResultCache::content_key(image)?),
            None => None,
        };
        let hit = match (&self.cache, &key) {
            (Some(cache), Some(key)) => cache.lookup(key).cloned(),
            _ => None,
        };

        let mut outcome = match hit {
            Some(entry) => {
                self.enter(PipelineState::CacheHit, cancel)?;
                self.from_cache(entry)?
            }
            None => self.compute(image, key, cancel)?,
        };

        if let Some(patient) = patient {
            outcome.delivered = self.deliver_outcome(&outcome, patient, cancel)?;
        }
        Ok(outcome)
    }

    // Metrics are recomputed from the cached label volume; meshes are reused
    // verbatim.
    fn from_cache(&self, entry: CacheEntry) -> Result<RunOutcome, PipelineError> {
        info!(meshes = entry.mesh_assets.len(), "image processed before, loading from cache");
        let label_volume_path = entry
            .prediction_output_path
            .filter(|path| path.is_file());
        let metrics = match &label_volume_path {
            Some(path) => Some(self.analyze(path)?),
            None => {
                warn!("cached label volume is gone, metrics unavailable");
                None
            }
        };
        Ok(RunOutcome {
            from_cache: true,
            label_volume_path,
            metrics,
            mesh_assets: entry.mesh_assets,
            delivered: None,
        })
    }

    fn compute(
        &mut self,
        image: &Path,
        key: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        self.enter(PipelineState::Predicting, cancel)?;
        let started = Instant::now();
        let hint = self.prediction_hint(image);
        let label_volume_path = self.predictor.predict(image, &hint)?;
        info!(
            path = %label_volume_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "segmentation completed"
        );

        self.enter(PipelineState::Analyzing, cancel)?;
        let volume = VolumeLoader::load_from_nifti(&label_volume_path)?;
        let metrics = self.analyze_volume(&volume);

        self.enter(PipelineState::MeshBuilding, cancel)?;
        let started = Instant::now();
        let base_name = VolumeLoader::file_stem(&label_volume_path);
        let mesh_assets =
            self.extractor
                .extract_meshes(&volume, self.config.paths.assets_dir(), &base_name)?;
        info!(
            meshes = mesh_assets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "3D meshes created"
        );

        // A key is only computed when caching is enabled.
        if let Some(key) = key {
            self.enter(PipelineState::CacheWrite, cancel)?;
            if let Some(cache) = self.cache.as_mut() {
                let entry = CacheEntry::new(label_volume_path.clone(), mesh_assets.clone());
                cache.insert(key, entry)?;
                info!("results saved to cache");
            }
        }

        Ok(RunOutcome {
            from_cache: false,
            label_volume_path: Some(label_volume_path),
            metrics: Some(metrics),
            mesh_assets,
            delivered: None,
        })
    }

    fn analyze(&self, label_volume_path: &Path) -> Result<VolumeMetrics, PipelineError> {
        let volume = VolumeLoader::load_from_nifti(label_volume_path)?;
        Ok(self.analyze_volume(&volume))
    }

    fn analyze_volume(&self, volume: &LabelVolume) -> VolumeMetrics {
        let metrics = self.analyzer.analyze(volume);
        info!(
            liver_ml = metrics.liver_volume_ml,
            tumors = metrics.tumor_count,
            tumor_ml = metrics.total_tumor_volume_ml,
            "volume analysis completed"
        );
        metrics
    }

    fn deliver_outcome(
        &mut self,
        outcome: &RunOutcome,
        patient: &PatientInfo,
        cancel: &CancellationToken,
    ) -> Result<Option<bool>, PipelineError> {
        let Some(metrics) = outcome.metrics.clone() else {
            warn!("no analysis data available, skipping delivery");
            return Ok(None);
        };
        self.enter(PipelineState::Delivering, cancel)?;
        let payload = WirePayload {
            patient: patient.clone(),
            analysis: metrics,
        };
        Ok(Some(self.deliver(&outcome.mesh_assets, &payload)))
    }

    /// Deliver with the configured number of retries.
    pub fn deliver(&self, mesh_assets: &[(u16, PathBuf)], payload: &WirePayload) -> bool {
        let endpoint = self.config.delivery.endpoint();
        let attempts = self.config.delivery.retries.saturating_add(1);
        for attempt in 1..=attempts {
            if self.client.deliver(&endpoint, mesh_assets, payload) {
                return true;
            }
            if attempt < attempts {
                warn!(attempt, attempts, "delivery failed, retrying");
                thread::sleep(self.config.delivery.retry_delay());
            }
        }
        false
    }

    /// `<output_dir>/<stem>_pred.nii`
    fn prediction_hint(&self, image: &Path) -> PathBuf {
        let stem = VolumeLoader::file_stem(image);
        self.config.paths.output_dir.join(format!("{stem}_pred.nii"))
    }

    fn enter(&mut self, next: PipelineState, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(next));
        }
        self.transition(next);
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        self.state = next;
        info!(state = %next, "pipeline stage");
    }
}
