//! Multi-provider feature aggregation.
//!
//! A request for a track first checks the TTL cache, then the in-flight table
//! so concurrent callers for the same track share one fan-out, and only then
//! queries every registered provider in parallel. Each provider runs under its
//! own timeout; a slow or failing provider is left out of that one bundle and
//! never fails the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::provider::{Capabilities, FeatureProvider};
use super::{
    AggregatedFeatures, AudioFeatures, EmotionFeatures, FeatureField, LyricsFeatures,
    ProviderContribution,
};
use crate::error::EngineError;

/// How conflicting provider results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Each field comes whole from the highest-priority provider that has it.
    #[default]
    Priority,
    /// Audio sub-fields are unioned across providers, higher priority winning
    /// on overlap. Other fields behave as in `Priority`.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub strategy: MergeStrategy,
    pub cache_ttl_secs: u64,
    pub provider_timeout_ms: u64,
    /// Parallel fan-outs during batch fetches.
    pub batch_concurrency: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Priority,
            cache_ttl_secs: 30 * 60,
            provider_timeout_ms: 5_000,
            batch_concurrency: 4,
        }
    }
}

impl AggregatorConfig {
    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

/// A provider with its capabilities and priority resolved at registration.
#[derive(Clone)]
struct RegisteredProvider {
    id: String,
    priority: u32,
    capabilities: Capabilities,
    provider: Arc<dyn FeatureProvider>,
}

/// What one provider returned for one track.
#[derive(Debug, Default)]
struct ProviderResult {
    provider_id: String,
    audio: Option<AudioFeatures>,
    fingerprint: Option<String>,
    emotion: Option<EmotionFeatures>,
    lyrics: Option<LyricsFeatures>,
    embedding: Option<Vec<f32>>,
}

struct CacheEntry {
    features: AggregatedFeatures,
    expires_at: Instant,
}

type SharedFetch = Shared<BoxFuture<'static, AggregatedFeatures>>;

/// A fan-out in progress. `ticket` identifies it so a fetch that was
/// invalidated while running does not publish into the cache.
struct InFlight {
    ticket: u64,
    fetch: SharedFetch,
}

/// Collects one [`AggregatedFeatures`] bundle per track from every registered
/// [`FeatureProvider`].
pub struct FeatureAggregator {
    config: AggregatorConfig,
    providers: Vec<RegisteredProvider>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    fan_outs: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding one of these locks leaves plain map data behind,
    // which is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FeatureAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            fan_outs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Register a provider, replacing any provider with the same id.
    ///
    /// Cached bundles are dropped since they no longer reflect the provider set.
    pub fn register(&mut self, provider: Arc<dyn FeatureProvider>) {
        let registered = RegisteredProvider {
            id: provider.id().to_string(),
            priority: provider.priority(),
            capabilities: provider.capabilities(),
            provider,
        };
        if registered.capabilities.is_empty() {
            warn!("Provider '{}' declares no capabilities", registered.id);
        }
        debug!(
            "Registering provider '{}' (priority {}, {:?})",
            registered.id, registered.priority, registered.capabilities
        );

        self.providers.retain(|p| p.id != registered.id);
        self.providers.push(registered);
        // Stable sort keeps registration order among equal priorities.
        self.providers.sort_by_key(|p| p.priority);
        self.clear_cache();
    }

    /// Remove a provider. Returns `false` if no provider had that id.
    pub fn unregister(&mut self, provider_id: &str) -> bool {
        let before = self.providers.len();
        self.providers.retain(|p| p.id != provider_id);
        let removed = self.providers.len() != before;
        if removed {
            self.clear_cache();
        }
        removed
    }

    /// Registered provider ids, highest priority first.
    pub fn providers(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id.as_str()).collect()
    }

    /// Number of provider fan-outs performed so far.
    pub fn fan_out_count(&self) -> u64 {
        self.fan_outs.load(Ordering::Relaxed)
    }

    /// Features for one track. Never fails: with no successful provider the
    /// bundle simply has every optional field absent.
    pub async fn get(&self, track_id: &str) -> AggregatedFeatures {
        if let Some(hit) = self.cached(track_id) {
            return hit;
        }

        let (ticket, fetch) = {
            let mut in_flight = lock(&self.in_flight);
            // Re-check under the in-flight lock: a fetch may have completed
            // between the first cache lookup and here.
            if let Some(hit) = self.cached(track_id) {
                return hit;
            }
            match in_flight.get(track_id) {
                Some(running) => {
                    debug!("Joining in-flight feature fetch for {track_id}");
                    (running.ticket, running.fetch.clone())
                }
                None => {
                    let ticket = self.fan_outs.fetch_add(1, Ordering::Relaxed);
                    let fetch = self.start_fan_out(track_id);
                    in_flight.insert(
                        track_id.to_string(),
                        InFlight {
                            ticket,
                            fetch: fetch.clone(),
                        },
                    );
                    (ticket, fetch)
                }
            }
        };

        let features = fetch.await;

        // Whichever caller finishes first publishes the result, unless the
        // fetch was invalidated or superseded meanwhile.
        let mut in_flight = lock(&self.in_flight);
        let current = in_flight
            .get(track_id)
            .is_some_and(|running| running.ticket == ticket);
        if current {
            in_flight.remove(track_id);
            lock(&self.cache).insert(
                track_id.to_string(),
                CacheEntry {
                    features: features.clone(),
                    expires_at: Instant::now() + self.config.cache_ttl(),
                },
            );
        }
        features
    }

    /// Features for several tracks, in input order.
    pub async fn get_batch(&self, track_ids: &[String]) -> Vec<AggregatedFeatures> {
        stream::iter(track_ids)
            .map(|id| self.get(id))
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    /// Warm the cache for tracks that are neither cached nor being fetched.
    /// Returns how many tracks were fetched.
    pub async fn prefetch(&self, track_ids: &[String]) -> usize {
        let misses: Vec<&String> = track_ids
            .iter()
            .filter(|id| self.cached(id).is_none() && !lock(&self.in_flight).contains_key(*id))
            .collect();
        let count = misses.len();
        if count > 0 {
            debug!("Prefetching features for {count} tracks");
        }

        stream::iter(misses)
            .map(|id| self.get(id))
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .for_each(|_| async {})
            .await;
        count
    }

    /// Drop the cached bundle for `track_id`. A fetch already running for it
    /// still answers its callers but is not cached.
    pub fn invalidate(&self, track_id: &str) -> bool {
        let detached = lock(&self.in_flight).remove(track_id).is_some();
        let cached = lock(&self.cache).remove(track_id).is_some();
        if detached {
            debug!("Detached in-flight feature fetch for {track_id}");
        }
        cached
    }

    pub fn clear_cache(&self) {
        lock(&self.in_flight).clear();
        lock(&self.cache).clear();
    }

    /// Drop expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = lock(&self.cache);
        let before = cache.len();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    fn cached(&self, track_id: &str) -> Option<AggregatedFeatures> {
        let mut cache = lock(&self.cache);
        match cache.get(track_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.features.clone()),
            Some(_) => {
                cache.remove(track_id);
                None
            }
            None => None,
        }
    }

    fn start_fan_out(&self, track_id: &str) -> SharedFetch {
        fan_out(
            self.providers.clone(),
            track_id.to_string(),
            self.config.strategy,
            self.config.provider_timeout(),
        )
        .boxed()
        .shared()
    }
}

async fn fan_out(
    providers: Vec<RegisteredProvider>,
    track_id: String,
    strategy: MergeStrategy,
    timeout: Duration,
) -> AggregatedFeatures {
    let results: Vec<ProviderResult> = join_all(
        providers
            .iter()
            .map(|provider| query_provider(provider, &track_id, timeout)),
    )
    .await
    .into_iter()
    .flatten()
    .collect();

    debug!(
        "{} of {} providers answered for {track_id}",
        results.len(),
        providers.len()
    );
    merge_results(track_id, results, strategy)
}

/// Query every capability of one provider under a single timeout.
///
/// Returns `None` when the provider timed out or every call failed.
async fn query_provider(
    registered: &RegisteredProvider,
    track_id: &str,
    timeout: Duration,
) -> Option<ProviderResult> {
    let caps = registered.capabilities;
    let provider = &registered.provider;

    let calls = async {
        futures::join!(
            async {
                if caps.audio {
                    Some(provider.audio_features(track_id).await)
                } else {
                    None
                }
            },
            async {
                if caps.audio {
                    Some(provider.fingerprint(track_id).await)
                } else {
                    None
                }
            },
            async {
                if caps.emotion {
                    Some(provider.emotion_features(track_id).await)
                } else {
                    None
                }
            },
            async {
                if caps.lyrics {
                    Some(provider.lyrics_features(track_id).await)
                } else {
                    None
                }
            },
            async {
                if caps.embedding {
                    Some(provider.embedding(track_id).await)
                } else {
                    None
                }
            },
        )
    };

    let (audio, fingerprint, emotion, lyrics, embedding) =
        match tokio::time::timeout(timeout, calls).await {
            Ok(answers) => answers,
            Err(_) => {
                let err = EngineError::ProviderTimeout {
                    provider: registered.id.clone(),
                };
                warn!("{err} for {track_id}");
                return None;
            }
        };

    let mut tally = Tally::default();
    let result = ProviderResult {
        provider_id: registered.id.clone(),
        audio: tally.settle(audio, track_id),
        fingerprint: tally.settle(fingerprint, track_id),
        emotion: tally.settle(emotion, track_id),
        lyrics: tally.settle(lyrics, track_id),
        embedding: tally.settle(embedding, track_id),
    };

    if tally.attempted > 0 && tally.failed == tally.attempted {
        warn!("Provider '{}' failed every request for {track_id}", registered.id);
        return None;
    }
    Some(result)
}

#[derive(Default)]
struct Tally {
    attempted: usize,
    failed: usize,
}

impl Tally {
    /// `None` means the capability was not queried.
    fn settle<T>(&mut self, answer: Option<Result<Option<T>, EngineError>>, track_id: &str) -> Option<T> {
        let answer = answer?;
        self.attempted += 1;
        match answer {
            Ok(value) => value,
            Err(err) => {
                self.failed += 1;
                debug!("{err} for {track_id}");
                None
            }
        }
    }
}

/// Combine provider results, already ordered by priority.
fn merge_results(
    track_id: String,
    results: Vec<ProviderResult>,
    strategy: MergeStrategy,
) -> AggregatedFeatures {
    let mut bundle = AggregatedFeatures::empty(track_id);

    for result in results {
        let confidence = result
            .audio
            .as_ref()
            .and_then(|a| a.confidence)
            .or_else(|| result.emotion.as_ref().and_then(|e| e.confidence))
            .unwrap_or(1.0);
        let mut supplied = Vec::new();

        if let Some(audio) = result.audio {
            match (&mut bundle.audio, strategy) {
                (None, _) => {
                    bundle.audio = Some(audio);
                    supplied.push(FeatureField::Audio);
                }
                (Some(existing), MergeStrategy::Merge) => {
                    if existing.fill_gaps(&audio) > 0 {
                        supplied.push(FeatureField::Audio);
                    }
                }
                (Some(_), MergeStrategy::Priority) => {}
            }
        }
        if bundle.fingerprint.is_none() && result.fingerprint.is_some() {
            bundle.fingerprint = result.fingerprint;
            supplied.push(FeatureField::Fingerprint);
        }
        if bundle.emotion.is_none() && result.emotion.is_some() {
            bundle.emotion = result.emotion;
            supplied.push(FeatureField::Emotion);
        }
        if bundle.lyrics.is_none() && result.lyrics.is_some() {
            bundle.lyrics = result.lyrics;
            supplied.push(FeatureField::Lyrics);
        }
        if bundle.embedding.is_none() && result.embedding.is_some() {
            bundle.embedding = result.embedding;
            supplied.push(FeatureField::Embedding);
        }

        if !supplied.is_empty() {
            bundle.contributing_providers.push(ProviderContribution {
                provider_id: result.provider_id,
                supplied_fields: supplied,
                confidence: confidence.clamp(0.0, 1.0),
            });
        }
    }

    bundle.last_updated = Utc::now();
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeProvider {
        id: &'static str,
        priority: u32,
        capabilities: Capabilities,
        audio: Option<AudioFeatures>,
        embedding: Option<Vec<f32>>,
        delay: Duration,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        fn audio(id: &'static str, priority: u32, audio: AudioFeatures) -> Self {
            Self {
                id,
                priority,
                capabilities: Capabilities::AUDIO,
                audio: Some(audio),
                embedding: None,
                delay: Duration::ZERO,
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl FeatureProvider for FakeProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        async fn audio_features(&self, _track_id: &str) -> Result<Option<AudioFeatures>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EngineError::provider(self.id, "analysis crashed"));
            }
            Ok(self.audio.clone())
        }

        async fn embedding(&self, _track_id: &str) -> Result<Option<Vec<f32>>, EngineError> {
            Ok(self.embedding.clone())
        }
    }

    fn tempo_energy(tempo: Option<f64>, energy: Option<f64>) -> AudioFeatures {
        AudioFeatures {
            tempo,
            energy,
            ..AudioFeatures::default()
        }
    }

    #[tokio::test]
    async fn test_no_providers_yields_empty_bundle() {
        let aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let bundle = aggregator.get("t1").await;
        assert_eq!(bundle.track_id, "t1");
        assert!(!bundle.has_data());
        assert!(bundle.contributing_providers.is_empty());
    }

    #[tokio::test]
    async fn test_priority_strategy_takes_whole_field_from_best_provider() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        aggregator.register(Arc::new(FakeProvider::audio("low", 50, tempo_energy(Some(90.0), Some(0.4)))));
        aggregator.register(Arc::new(FakeProvider::audio("high", 10, tempo_energy(Some(120.0), None))));

        let bundle = aggregator.get("t1").await;
        let audio = bundle.audio.unwrap();
        assert_eq!(audio.tempo, Some(120.0));
        assert_eq!(audio.energy, None);
        assert_eq!(bundle.contributing_providers.len(), 1);
        assert_eq!(bundle.contributing_providers[0].provider_id, "high");
    }

    #[tokio::test]
    async fn test_merge_strategy_unions_audio_fields() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig {
            strategy: MergeStrategy::Merge,
            ..AggregatorConfig::default()
        });
        aggregator.register(Arc::new(FakeProvider::audio("low", 50, tempo_energy(Some(90.0), Some(0.4)))));
        aggregator.register(Arc::new(FakeProvider::audio("high", 10, tempo_energy(Some(120.0), None))));

        let bundle = aggregator.get("t1").await;
        let audio = bundle.audio.unwrap();
        assert_eq!(audio.tempo, Some(120.0));
        assert_eq!(audio.energy, Some(0.4));

        let ids: Vec<&str> = bundle
            .contributing_providers
            .iter()
            .map(|c| c.provider_id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_failing_and_slow_providers_are_excluded() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig {
            provider_timeout_ms: 50,
            ..AggregatorConfig::default()
        });
        let mut broken = FakeProvider::audio("broken", 1, tempo_energy(Some(100.0), None));
        broken.fail = true;
        let mut slow = FakeProvider::audio("slow", 2, tempo_energy(Some(110.0), None));
        slow.delay = Duration::from_secs(5);
        aggregator.register(Arc::new(broken));
        aggregator.register(Arc::new(slow));
        aggregator.register(Arc::new(FakeProvider::audio("ok", 3, tempo_energy(Some(128.0), None))));

        let bundle = aggregator.get("t1").await;
        assert_eq!(bundle.audio.unwrap().tempo, Some(128.0));
        assert_eq!(bundle.contributing_providers.len(), 1);
        assert_eq!(bundle.contributing_providers[0].provider_id, "ok");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fan_out() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let mut provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        provider.delay = Duration::from_millis(30);
        let calls = Arc::clone(&provider.calls);
        aggregator.register(Arc::new(provider));

        let (first, second) = tokio::join!(aggregator.get("t1"), aggregator.get("t1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.fan_out_count(), 1);
        assert_eq!(first, second);

        // Served from cache afterwards.
        aggregator.get("t1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_never_returned() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig {
            cache_ttl_secs: 0,
            ..AggregatorConfig::default()
        });
        let provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        let calls = Arc::clone(&provider.calls);
        aggregator.register(Arc::new(provider));

        aggregator.get("t1").await;
        aggregator.get("t1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(aggregator.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        let calls = Arc::clone(&provider.calls);
        aggregator.register(Arc::new(provider));

        aggregator.get("t1").await;
        assert!(aggregator.invalidate("t1"));
        aggregator.get("t1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_keeps_result_out_of_cache() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let mut provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        provider.delay = Duration::from_millis(50);
        let calls = Arc::clone(&provider.calls);
        aggregator.register(Arc::new(provider));

        let (bundle, _) = tokio::join!(aggregator.get("t1"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aggregator.invalidate("t1")
        });
        assert_eq!(bundle.audio.unwrap().tempo, Some(100.0));
        assert_eq!(aggregator.cache_len(), 0);

        aggregator.get("t1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(aggregator.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_during_fetch_keeps_result_out_of_cache() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let mut provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        provider.delay = Duration::from_millis(50);
        aggregator.register(Arc::new(provider));

        tokio::join!(aggregator.get("t1"), aggregator.get("t2"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aggregator.clear_cache();
        });
        assert_eq!(aggregator.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_batch_and_prefetch_skip_cached_tracks() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        let mut provider = FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None));
        provider.capabilities = Capabilities::AUDIO.union(Capabilities::EMBEDDING);
        provider.embedding = Some(vec![0.1, 0.2]);
        let calls = Arc::clone(&provider.calls);
        aggregator.register(Arc::new(provider));

        aggregator.get("a").await;
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(aggregator.prefetch(&ids).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let bundles = aggregator.get_batch(&ids).await;
        assert_eq!(bundles.iter().map(|b| b.track_id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert!(bundles.iter().all(|b| b.embedding.as_deref() == Some(&[0.1, 0.2][..])));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregister_removes_provider() {
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        aggregator.register(Arc::new(FakeProvider::audio("dsp", 1, tempo_energy(Some(100.0), None))));
        assert_eq!(aggregator.providers(), vec!["dsp"]);
        assert!(aggregator.unregister("dsp"));
        assert!(!aggregator.unregister("dsp"));
        assert!(!aggregator.get("t1").await.has_data());
    }
}
