//! # Response and Audio Caches
//!
//! Two independent TTL caches sit on the voice path:
//! - **ResponseCache**: normalized transcript → agent reply text
//! - **AudioCache**: (locale, normalized reply text) → synthesized audio
//!
//! Both key by the SHA-256 hex digest of the normalized text, so two inputs
//! that differ only in case or whitespace share one entry. The audio key is
//! also the public media id served by `GET /audio/{key}`.
//!
//! Storage is behind `CacheBackend`; `MemoryCache` is the in-process
//! implementation.

pub mod memory;

pub use memory::MemoryCache;

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Storage contract for a TTL cache. Implementations must be safe for
/// concurrent `get`/`put`; last writer wins.
pub trait CacheBackend<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn put(&self, key: String, value: V, ttl: Duration);
    /// Drop every expired entry, returning how many were removed.
    fn sweep(&self) -> usize;
    fn entry_count(&self) -> usize;
}

/// Lowercase, trim and collapse internal whitespace runs to one space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for a piece of user-visible text.
pub fn text_key(text: &str) -> String {
    digest(&normalize_text(text))
}

/// Transcript → reply text.
#[derive(Clone)]
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend<String>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend<String>>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCache::new()), ttl)
    }

    pub fn get(&self, transcript: &str) -> Option<String> {
        self.backend.get(&text_key(transcript))
    }

    pub fn put(&self, transcript: &str, reply: &str) {
        self.backend.put(text_key(transcript), reply.to_string(), self.ttl);
    }

    pub fn sweep(&self) -> usize {
        self.backend.sweep()
    }

    /// Live and not yet swept entries.
    pub fn entry_count(&self) -> usize {
        self.backend.entry_count()
    }
}

/// Encoded speech ready to hand to the messaging gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAudio {
    pub bytes: Arc<Vec<u8>>,
    pub content_type: String,
}

/// (locale, reply text) → synthesized audio.
#[derive(Clone)]
pub struct AudioCache {
    backend: Arc<dyn CacheBackend<CachedAudio>>,
    ttl: Duration,
}

impl AudioCache {
    pub fn new(backend: Arc<dyn CacheBackend<CachedAudio>>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCache::new()), ttl)
    }

    /// Key for `text` spoken in `locale`. The unit separator keeps
    /// `("en", "x y")` and `("en x", "y")` apart.
    pub fn key_for(locale: &str, text: &str) -> String {
        digest(&format!("{}\u{1f}{}", locale.to_ascii_lowercase(), normalize_text(text)))
    }

    pub fn get(&self, locale: &str, text: &str) -> Option<(String, CachedAudio)> {
        let key = Self::key_for(locale, text);
        self.backend.get(&key).map(|audio| (key, audio))
    }

    /// Lookup by media id, used by the audio endpoint.
    pub fn get_by_key(&self, key: &str) -> Option<CachedAudio> {
        self.backend.get(key)
    }

    /// Store audio and return its media id.
    pub fn put(&self, locale: &str, text: &str, audio: CachedAudio) -> String {
        let key = Self::key_for(locale, text);
        self.backend.put(key.clone(), audio, self.ttl);
        key
    }

    pub fn sweep(&self) -> usize {
        self.backend.sweep()
    }

    /// Live and not yet swept entries.
    pub fn entry_count(&self) -> usize {
        self.backend.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_equivalence() {
        assert_eq!(normalize_text("  Hello   WORLD\t\n"), "hello world");
        assert_eq!(text_key("What are your hours?"), text_key("what are  your hours?  "));
        assert_ne!(text_key("what are your hours"), text_key("what are your hours?"));
    }

    #[test]
    fn test_key_is_sha256_hex() {
        let key = text_key("hello");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    }

    #[test]
    fn test_response_cache_hit_for_equivalent_transcripts() {
        let cache = ResponseCache::in_memory(Duration::from_secs(60));
        cache.put("Track my ORDER", "Your order ships today.");
        assert_eq!(cache.get("track my order").as_deref(), Some("Your order ships today."));
        assert_eq!(cache.get("track my parcel"), None);
    }

    #[test]
    fn test_audio_key_namespaces_locale() {
        assert_ne!(AudioCache::key_for("en-US", "hello"), AudioCache::key_for("ar-EG", "hello"));
        assert_eq!(AudioCache::key_for("en-US", "Hello "), AudioCache::key_for("EN-us", "hello"));
    }

    #[test]
    fn test_audio_cache_put_returns_media_id() {
        let cache = AudioCache::in_memory(Duration::from_secs(60));
        let audio = CachedAudio {
            bytes: Arc::new(vec![0xFF, 0xFB]),
            content_type: "audio/mpeg".to_string(),
        };
        let key = cache.put("en-US", "Hi there", audio.clone());
        assert_eq!(cache.get_by_key(&key), Some(audio.clone()));
        assert_eq!(cache.get("en-US", "hi there"), Some((key, audio)));
    }
}
