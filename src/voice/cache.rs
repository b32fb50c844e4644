//! Pre-generated audio cache for instant responses
//!
//! Clips live under one directory next to a `manifest.json` that records the
//! voice settings they were generated with. The manifest carries a digest of
//! those settings, so a changed voice, model, speed, sample rate or persona
//! name invalidates the whole cache. Reads never synthesize: a clip is served
//! from memory, then disk, or reported missing.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::responses::{ResponseCategory, WakeResponsePool};
use super::tts::SpeechSynthesizer;
use crate::{Error, Result};

/// Manifest schema version
pub const MANIFEST_VERSION: &str = "1.0.0";

/// Manifest file name inside the cache directory
pub const MANIFEST_FILE: &str = "manifest.json";

const AUDIO_EXTENSIONS: [&str; 3] = ["wav", "mp3", "ogg"];

/// Voice settings the cached clips were generated with
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCacheConfig {
    pub voice_id: String,
    pub model: String,
    pub speed: f64,
    pub sample_rate: u32,
    /// Substituted into introduction lines before synthesis
    pub persona_name: String,
}

impl Default for AudioCacheConfig {
    fn default() -> Self {
        Self {
            voice_id: "am_adam".to_string(),
            model: "kokoro".to_string(),
            speed: 1.0,
            sample_rate: 24_000,
            persona_name: "Orin".to_string(),
        }
    }
}

impl AudioCacheConfig {
    /// Stable digest of the settings, `sha256:<hex>`
    #[must_use]
    pub fn hash(&self) -> String {
        let data = format!(
            "voice:{}|model:{}|speed:{:.2}|rate:{}|persona:{}",
            self.voice_id, self.model, self.speed, self.sample_rate, self.persona_name
        );
        format!("sha256:{}", hex::encode(Sha256::digest(data.as_bytes())))
    }
}

/// Metadata for one cached clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPhrase {
    pub text: String,
    pub category: String,
    /// Path relative to the cache directory
    pub file: String,
    pub size_bytes: u64,
    /// Clip length; 0 when the container is not WAV
    #[serde(default)]
    pub duration_ms: u64,
    pub generated_at: DateTime<Utc>,
}

/// Persisted description of a generated cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: String,
    pub voice_config_hash: String,
    pub voice_id: String,
    pub model: String,
    pub sample_rate: u32,
    #[serde(default)]
    pub persona_name: String,
    pub generated_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub phrases: BTreeMap<String, CachedPhrase>,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub valid: bool,
    /// Clips held in memory
    pub loaded_files: usize,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub manifest_files: usize,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CacheInner {
    manifest: Option<Arc<CacheManifest>>,
    memory: HashMap<String, Arc<[u8]>>,
}

/// Content-addressed store of pre-synthesized clips
pub struct AudioCache {
    cache_dir: PathBuf,
    config: AudioCacheConfig,
    pool: WakeResponsePool,
    inner: RwLock<CacheInner>,
}

impl AudioCache {
    /// Create a cache rooted at `cache_dir` using the default response pool
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>, config: AudioCacheConfig) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            config,
            pool: WakeResponsePool::default(),
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Replace the response pool used for generation and lookups
    #[must_use]
    pub fn with_pool(mut self, pool: WakeResponsePool) -> Self {
        self.pool = pool;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub const fn config(&self) -> &AudioCacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self) -> &WakeResponsePool {
        &self.pool
    }

    /// Digest of the current settings
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.config.hash()
    }

    /// Manifest currently held in memory
    #[must_use]
    pub fn manifest(&self) -> Option<Arc<CacheManifest>> {
        self.read().manifest.clone()
    }

    fn manifest_path(&self) -> PathBuf {
        self.cache_dir.join(MANIFEST_FILE)
    }

    /// Read the manifest from disk into memory
    ///
    /// # Errors
    ///
    /// Returns error if the manifest is missing or malformed
    pub async fn load_manifest(&self) -> Result<Arc<CacheManifest>> {
        let data = tokio::fs::read(self.manifest_path()).await?;
        let manifest: Arc<CacheManifest> = Arc::new(serde_json::from_slice(&data)?);
        self.write().manifest = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Persist a manifest atomically (temp file, then rename)
    async fn save_manifest(&self, manifest: &CacheManifest) -> Result<()> {
        let data = serde_json::to_vec_pretty(manifest)?;
        let path = self.manifest_path();
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Whether the clips on disk do not match the current settings
    ///
    /// True when the manifest is missing or unreadable, its digest differs
    /// from the current one, or a clip it references has vanished.
    pub async fn needs_regeneration(&self) -> bool {
        let manifest = match self.manifest() {
            Some(manifest) => manifest,
            None => match self.load_manifest().await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::debug!(error = %e, "no usable cache manifest");
                    return true;
                }
            },
        };

        if manifest.voice_config_hash != self.config_hash() {
            tracing::info!(
                cached = %manifest.voice_config_hash,
                current = %self.config_hash(),
                "voice settings changed, cache is stale"
            );
            return true;
        }

        for phrase in manifest.phrases.values() {
            let exists = tokio::fs::try_exists(self.cache_dir.join(&phrase.file))
                .await
                .unwrap_or(false);
            if !exists {
                tracing::info!(file = %phrase.file, "cached clip missing from disk");
                return true;
            }
        }

        false
    }

    /// Generate every pool line that declares a clip, unless the cache is valid
    ///
    /// The manifest is rebuilt from scratch and written only after every clip
    /// succeeded. Dropping the returned future abandons generation without
    /// touching the previous manifest.
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be created, synthesis fails, or the
    /// manifest cannot be written
    pub async fn ensure_generated(&self, synthesizer: &dyn SpeechSynthesizer) -> Result<()> {
        if !self.needs_regeneration().await {
            tracing::debug!(dir = %self.cache_dir.display(), "audio cache up to date");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tracing::info!(
            dir = %self.cache_dir.display(),
            voice = %self.config.voice_id,
            "generating audio cache"
        );

        let mut manifest = CacheManifest {
            version: MANIFEST_VERSION.to_string(),
            voice_config_hash: self.config_hash(),
            voice_id: self.config.voice_id.clone(),
            model: self.config.model.clone(),
            sample_rate: self.config.sample_rate,
            persona_name: self.config.persona_name.clone(),
            generated_at: Utc::now(),
            file_count: 0,
            total_size_bytes: 0,
            phrases: BTreeMap::new(),
        };

        for response in self.pool.all() {
            let Some(file) = &response.audio_file else {
                continue;
            };

            let path = self.cache_dir.join(file);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let text = response.render(&self.config.persona_name);
            synthesizer
                .synthesize_to_file(&text, &path, &self.config.voice_id)
                .await
                .map_err(|e| Error::Cache(format!("generate {file}: {e}")))?;

            let data = tokio::fs::read(&path).await?;
            let size_bytes = data.len() as u64;

            manifest.phrases.insert(
                file.clone(),
                CachedPhrase {
                    text,
                    category: response.category.as_str().to_string(),
                    file: file.clone(),
                    size_bytes,
                    duration_ms: wav_duration_ms(&data),
                    generated_at: Utc::now(),
                },
            );
            manifest.file_count += 1;
            manifest.total_size_bytes += size_bytes;
        }

        self.save_manifest(&manifest).await?;

        let file_count = manifest.file_count;
        {
            let mut inner = self.write();
            inner.manifest = Some(Arc::new(manifest));
            inner.memory.clear();
        }

        tracing::info!(files = file_count, "audio cache generated");
        Ok(())
    }

    /// Cached clip by relative path
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the clip is neither in memory nor on disk
    pub async fn get_audio(&self, audio_file: &str) -> Result<Arc<[u8]>> {
        if let Some(data) = self.read().memory.get(audio_file) {
            return Ok(Arc::clone(data));
        }

        let data: Arc<[u8]> = tokio::fs::read(self.cache_dir.join(audio_file))
            .await
            .map_err(|_| Error::NotFound(format!("audio not cached: {audio_file}")))?
            .into();

        self.write()
            .memory
            .insert(audio_file.to_string(), Arc::clone(&data));

        Ok(data)
    }

    /// Random cached clip of a category, with its text
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the category has no clips or the chosen
    /// clip is not cached
    pub async fn random_from_category(
        &self,
        category: ResponseCategory,
    ) -> Result<(Arc<[u8]>, String)> {
        let candidates: Vec<(String, String)> = self
            .pool
            .by_category(category)
            .filter_map(|r| {
                r.audio_file
                    .clone()
                    .map(|file| (file, r.render(&self.config.persona_name)))
            })
            .collect();

        let (file, text) = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no clips for category {category}")))?;

        let data = self.get_audio(&file).await?;
        Ok((data, text))
    }

    /// Load every audio file under the cache directory into memory
    ///
    /// Returns the number of clips loaded.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be walked or a clip cannot be read
    pub async fn preload_all(&self) -> Result<usize> {
        let mut pending = vec![self.cache_dir.clone()];
        let mut loaded = 0;

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                if !is_audio_file(&path) {
                    continue;
                }

                let Some(key) = relative_key(&self.cache_dir, &path) else {
                    continue;
                };

                let data: Arc<[u8]> = tokio::fs::read(&path).await?.into();
                self.write().memory.insert(key, data);
                loaded += 1;
            }
        }

        tracing::debug!(files = loaded, "preloaded audio cache");
        Ok(loaded)
    }

    /// Bytes of audio held in memory
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        self.read().memory.values().map(|d| d.len() as u64).sum()
    }

    /// Number of clips held in memory
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.read().memory.len()
    }

    /// Bytes on disk: the manifest total, else a directory walk
    pub async fn disk_size(&self) -> u64 {
        if let Some(manifest) = self.manifest() {
            return manifest.total_size_bytes;
        }

        let mut pending = vec![self.cache_dir.clone()];
        let mut total = 0;

        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }

        total
    }

    /// Occupancy snapshot
    pub async fn stats(&self) -> CacheStats {
        let valid = !self.needs_regeneration().await;
        let disk_bytes = self.disk_size().await;
        let manifest = self.manifest();

        CacheStats {
            cache_dir: self.cache_dir.clone(),
            valid,
            loaded_files: self.file_count(),
            memory_bytes: self.memory_size(),
            disk_bytes,
            manifest_files: manifest.as_ref().map_or(0, |m| m.file_count),
            generated_at: manifest.map(|m| m.generated_at),
        }
    }

    /// Drop every clip and the manifest, in memory and on disk
    ///
    /// # Errors
    ///
    /// Returns error if the directory exists but cannot be removed
    pub async fn clear(&self) -> Result<()> {
        {
            let mut inner = self.write();
            inner.memory.clear();
            inner.manifest = None;
        }

        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {
                tracing::info!(dir = %self.cache_dir.display(), "audio cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}

/// Manifest-style key (`/` separated) for a path under the cache directory
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Clip length read from a WAV header, 0 for anything else
fn wav_duration_ms(data: &[u8]) -> u64 {
    hound::WavReader::new(Cursor::new(data)).map_or(0, |reader| {
        let rate = u64::from(reader.spec().sample_rate);
        if rate == 0 {
            0
        } else {
            u64::from(reader.duration()) * 1000 / rate
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_wav(samples: usize, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..samples {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn hash_is_prefixed_and_stable() {
        let a = AudioCacheConfig::default();
        let b = AudioCacheConfig::default();
        assert!(a.hash().starts_with("sha256:"));
        assert_eq!(a.hash().len(), "sha256:".len() + 64);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_changes_with_every_field() {
        let base = AudioCacheConfig::default();
        let variants = [
            AudioCacheConfig { voice_id: "af_bella".into(), ..base.clone() },
            AudioCacheConfig { model: "piper".into(), ..base.clone() },
            AudioCacheConfig { speed: 1.25, ..base.clone() },
            AudioCacheConfig { sample_rate: 16_000, ..base.clone() },
            AudioCacheConfig { persona_name: "Iris".into(), ..base.clone() },
        ];
        for variant in variants {
            assert_ne!(variant.hash(), base.hash(), "{variant:?}");
        }
    }

    #[test]
    fn speed_is_hashed_at_two_decimals() {
        let a = AudioCacheConfig { speed: 1.0, ..AudioCacheConfig::default() };
        let b = AudioCacheConfig { speed: 1.001, ..AudioCacheConfig::default() };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn wav_duration_from_header() {
        assert_eq!(wav_duration_ms(&tiny_wav(24_000, 24_000)), 1000);
        assert_eq!(wav_duration_ms(&tiny_wav(8_000, 16_000)), 500);
        assert_eq!(wav_duration_ms(b"ID3 not a wav"), 0);
    }

    #[test]
    fn relative_key_uses_forward_slashes() {
        let root = Path::new("/cache");
        let path = root.join("wake").join("cold").join("hey.wav");
        assert_eq!(relative_key(root, &path).as_deref(), Some("wake/cold/hey.wav"));
        assert!(relative_key(root, Path::new("/elsewhere/x.wav")).is_none());
    }

    #[test]
    fn audio_extension_filter() {
        assert!(is_audio_file(Path::new("a/b.wav")));
        assert!(is_audio_file(Path::new("a/b.MP3")));
        assert!(!is_audio_file(Path::new("manifest.json")));
        assert!(!is_audio_file(Path::new("noext")));
    }

    #[tokio::test]
    async fn missing_manifest_needs_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), AudioCacheConfig::default());
        assert!(cache.needs_regeneration().await);
    }

    #[tokio::test]
    async fn get_audio_prefers_memory_then_disk() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("wake/warm")).await.unwrap();
        tokio::fs::write(dir.path().join("wake/warm/yeah.wav"), b"clip").await.unwrap();

        let cache = AudioCache::new(dir.path(), AudioCacheConfig::default());
        assert_eq!(&*cache.get_audio("wake/warm/yeah.wav").await.unwrap(), b"clip");
        assert_eq!(cache.file_count(), 1);

        // Served from memory once loaded
        tokio::fs::remove_file(dir.path().join("wake/warm/yeah.wav")).await.unwrap();
        assert_eq!(&*cache.get_audio("wake/warm/yeah.wav").await.unwrap(), b"clip");

        let missing = cache.get_audio("wake/warm/nope.wav").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn preload_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("confused")).await.unwrap();
        tokio::fs::write(dir.path().join("confused/hmm.wav"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("top.wav"), b"bc").await.unwrap();
        tokio::fs::write(dir.path().join(MANIFEST_FILE), b"{}").await.unwrap();

        let cache = AudioCache::new(dir.path(), AudioCacheConfig::default());
        assert_eq!(cache.preload_all().await.unwrap(), 2);
        assert_eq!(cache.memory_size(), 3);
        assert_eq!(&*cache.get_audio("confused/hmm.wav").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn clear_removes_directory_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("voice");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("x.wav"), b"x").await.unwrap();

        let cache = AudioCache::new(&root, AudioCacheConfig::default());
        cache.preload_all().await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.file_count(), 0);
        assert!(!root.exists());
        cache.clear().await.unwrap();
    }
}
