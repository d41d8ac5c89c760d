//! # Engine
//!
//! [`Engine`] owns one instance of every component and is the single entry
//! point a host talks to. Nothing is global: tests and hosts build as many
//! independent engines as they need.
//!
//! ## Exposed operations
//!
//! - [`Engine::generate`] - ranked playlist for a [`GenerationMethod`].
//! - [`Engine::index`] - add track embeddings to the similarity index.
//! - [`Engine::score`] - explainable score of one track.
//! - [`Engine::replenish`] - refill for the auto-queue or radio.
//!
//! None of these fail: missing providers, a cold index or an absent model all
//! degrade to smaller or rule-based results.

use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::catalog::{CatalogClient, CatalogSource};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::features::{FeatureAggregator, FeatureProvider};
use crate::generator::{GenerationMethod, Playlist, PlaylistGenerator, Sources};
use crate::index::SimilarityIndex;
use crate::model::{training_examples, PredictionModel, TrainingMetrics};
use crate::profile::{DislikeReason, ListenEvent, UserProfile};
use crate::radio::{self, QueueController, QueueMode, QueueState, Replenishment};
use crate::scoring::{RadioSeed, ScoreBreakdown, ScoringContext, ScoringEngine};
use crate::track::Track;

pub struct Engine {
    config: EngineConfig,
    index: SimilarityIndex,
    features: FeatureAggregator,
    catalog: CatalogClient,
    profile: UserProfile,
    model: Option<Arc<dyn PredictionModel>>,
    training_cycles: u32,
    generator: PlaylistGenerator,
    controller: QueueController,
    rng: Mutex<StdRng>,
}

impl Engine {
    pub fn new(config: EngineConfig, catalog: Arc<dyn CatalogSource>) -> Self {
        let index = SimilarityIndex::new(config.index.clone());
        Self::assemble(config, catalog, index, StdRng::from_entropy())
    }

    /// Engine whose index layers and playlist jitter are reproducible.
    pub fn with_seed(config: EngineConfig, catalog: Arc<dyn CatalogSource>, seed: u64) -> Self {
        let index = SimilarityIndex::with_seed(config.index.clone(), seed);
        Self::assemble(config, catalog, index, StdRng::seed_from_u64(seed))
    }

    fn assemble(
        config: EngineConfig,
        catalog: Arc<dyn CatalogSource>,
        index: SimilarityIndex,
        rng: StdRng,
    ) -> Self {
        let timeout = Duration::from_millis(config.generator.catalog_timeout_ms);
        let scoring = ScoringEngine::new(config.scoring.clone());
        Self {
            features: FeatureAggregator::new(config.aggregator.clone()),
            catalog: CatalogClient::new(catalog, timeout),
            profile: UserProfile::default(),
            model: None,
            training_cycles: 0,
            generator: PlaylistGenerator::new(config.generator.clone(), scoring),
            controller: QueueController::new(config.radio.clone()),
            rng: Mutex::new(rng),
            index,
            config,
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Plug in a prediction model that has completed `training_cycles` runs.
    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn PredictionModel>, training_cycles: u32) -> Self {
        self.model = Some(model);
        self.training_cycles = training_cycles;
        self
    }

    pub fn register_provider(&mut self, provider: Arc<dyn FeatureProvider>) {
        self.features.register(provider);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn similarity_index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn features(&self) -> &FeatureAggregator {
        &self.features
    }

    pub fn catalog(&self) -> &CatalogClient {
        &self.catalog
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn training_cycles(&self) -> u32 {
        self.training_cycles
    }

    pub fn mode(&self) -> &QueueMode {
        self.controller.mode()
    }

    pub fn controller(&self) -> &QueueController {
        &self.controller
    }

    fn sources(&self) -> Sources<'_> {
        Sources {
            index: &self.index,
            features: &self.features,
            catalog: &self.catalog,
            profile: &self.profile,
            model: self.model.as_deref(),
            training_cycles: self.training_cycles,
        }
    }

    // ---------------------------------------------------------------------
    // Indexing
    // ---------------------------------------------------------------------

    /// Index the embeddings of `tracks`; returns how many were new.
    ///
    /// A track without an embedding of its own is looked up through the
    /// feature providers. Re-indexing a known track only replaces its vector.
    pub async fn index(&mut self, tracks: &[Track]) -> usize {
        let mut added = 0;
        for track in tracks {
            let embedding = match &track.embedding {
                Some(embedding) => Some(embedding.clone()),
                None => self.features.get(&track.id).await.embedding,
            };
            match embedding {
                Some(vector) if !vector.is_empty() => {
                    if self.index.add(&track.id, &vector) {
                        added += 1;
                    }
                }
                _ => debug!("No embedding for {}, not indexed", track.id),
            }
        }
        if added > 0 {
            info!("Indexed {added} new tracks ({} total)", self.index.len());
        }
        added
    }

    pub fn remove_from_index(&mut self, track_id: &str) -> bool {
        self.index.remove(track_id)
    }

    // ---------------------------------------------------------------------
    // Generation & scoring
    // ---------------------------------------------------------------------

    pub async fn generate(&self, method: GenerationMethod, limit: usize) -> Playlist {
        self.generate_excluding(method, limit, HashSet::new()).await
    }

    /// Like [`Engine::generate`], never returning any of `exclude`.
    pub async fn generate_excluding(
        &self,
        method: GenerationMethod,
        limit: usize,
        exclude: HashSet<String>,
    ) -> Playlist {
        let mut request = self.generator.request(method, limit);
        request.exclude = exclude;
        let mut rng = self.request_rng();
        let playlist = self
            .generator
            .generate(&self.sources(), &request, Utc::now(), &mut rng)
            .await;
        if self.generator.is_stale(playlist.request_id) {
            debug!("Request {} was superseded", playlist.request_id);
        }
        playlist
    }

    /// Whether a newer playlist request has been opened since `request_id`.
    pub fn is_stale(&self, request_id: u64) -> bool {
        self.generator.is_stale(request_id)
    }

    fn request_rng(&self) -> StdRng {
        let seed = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen();
        StdRng::seed_from_u64(seed)
    }

    /// Score one track, blended with the model when one is plugged in.
    pub async fn score(&self, track: &Track, context: &ScoringContext) -> ScoreBreakdown {
        let scoring = self.generator.scoring();
        let breakdown = scoring.rule_score(track, &self.profile, context);
        let prediction = match &self.model {
            Some(model) => match model.predict(track, context).await {
                Ok(prediction) => Some(prediction),
                Err(e) => {
                    debug!("Rule-based score for {}: {e}", track.id);
                    None
                }
            },
            None => None,
        };
        scoring.blend_model(breakdown, prediction, self.training_cycles)
    }

    // ---------------------------------------------------------------------
    // Auto-queue & radio
    // ---------------------------------------------------------------------

    pub fn enable_auto_queue(&mut self) {
        self.controller.enable_auto_queue();
    }

    pub fn start_radio(&mut self, seed: RadioSeed) {
        self.controller.start_radio(seed);
    }

    /// Start a radio seeded on `track`, with its aggregated audio features.
    pub async fn start_track_radio(&mut self, track: &Track) {
        let features = self
            .features
            .get(&track.id)
            .await
            .effective_audio()
            .or_else(|| track.features.clone());
        self.controller
            .start_radio(RadioSeed::from_track(track, features));
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }

    pub async fn replenish(&mut self, state: &QueueState) -> Replenishment {
        self.replenish_at(state, Instant::now(), Utc::now()).await
    }

    /// Refill at a given instant. `now` drives the fetch interval and backoff,
    /// `wall` the time-of-day scoring.
    pub async fn replenish_at(
        &mut self,
        state: &QueueState,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Replenishment {
        let Some(plan) = self.controller.begin_fetch(state, now) else {
            return Replenishment {
                tracks: Vec::new(),
                retry_after: self.controller.retry_after(now),
            };
        };
        let tracks = radio::fetch_batch(&self.generator, &self.sources(), &plan, wall).await;
        let retry_after = self.controller.finish_fetch(tracks.len(), now);
        if !tracks.is_empty() {
            info!("Queued {} tracks ({:?})", tracks.len(), self.controller.mode());
        }
        Replenishment {
            tracks,
            retry_after,
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// A playback of `track`; also advances the queue session with the
    /// track's aggregated audio so refills can follow its flow.
    pub async fn record_listen(
        &mut self,
        track: &Track,
        listened_ms: u64,
        at: DateTime<Utc>,
    ) -> ListenEvent {
        let event = self.profile.record_listen(track, listened_ms, at);
        let features = self
            .features
            .get(&track.id)
            .await
            .effective_audio()
            .or_else(|| track.features.clone());
        self.controller.record_played(track, features);
        event
    }

    pub fn record_skip(&mut self, track: &Track, at: DateTime<Utc>) {
        self.profile.record_skip(track, at);
    }

    pub fn record_like(&mut self, track: &Track, at: DateTime<Utc>) {
        self.profile.record_like(track, at);
    }

    pub fn remove_like(&mut self, track_id: &str) -> bool {
        self.profile.remove_like(track_id)
    }

    pub fn record_dislike(
        &mut self,
        track: &Track,
        reasons: HashSet<DislikeReason>,
        at: DateTime<Utc>,
    ) {
        self.profile.record_dislike(track, reasons, at);
    }

    /// Reverse a dislike so the track can be recommended again.
    pub fn remove_dislike(&mut self, track_id: &str) -> bool {
        let removed = self.profile.remove_dislike(track_id);
        if removed {
            debug!("Removed dislike for {track_id}");
        }
        removed
    }

    pub fn record_reorder(
        &mut self,
        track: &Track,
        from_index: usize,
        to_index: usize,
        at: DateTime<Utc>,
    ) {
        self.profile.record_reorder(track, from_index, to_index, at);
    }

    /// Run one training pass of the plugged-in model over the listen history.
    ///
    /// `lookup` resolves track ids to catalog records.
    pub async fn train_model<'a>(
        &mut self,
        lookup: impl Fn(&str) -> Option<&'a Track>,
    ) -> Result<TrainingMetrics, EngineError> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::ModelUnavailable("no model registered".to_string()))?;
        let examples = training_examples(&self.profile, lookup);
        if examples.is_empty() {
            return Err(EngineError::ModelUnavailable(
                "no labelled listens to train on".to_string(),
            ));
        }
        let metrics = model.train(&examples).await?;
        self.training_cycles += 1;
        info!(
            "Training cycle {} on {} samples, loss {:.4}",
            self.training_cycles, metrics.samples, metrics.loss
        );
        Ok(metrics)
    }
}
