use std::collections::HashMap;

use pulldown_cmark::{html, Options as MdOptions, Parser as MdParser};
use serde::Serialize;
use tracing::debug;

use crate::error::RenderError;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

pub trait Renderer: Send + Sync {
    fn render(&self, raw: &str) -> Result<String, RenderError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn render(&self, raw: &str) -> Result<String, RenderError> {
        let mut opts = MdOptions::empty();
        opts.insert(MdOptions::ENABLE_TABLES);
        opts.insert(MdOptions::ENABLE_STRIKETHROUGH);
        opts.insert(MdOptions::ENABLE_FOOTNOTES);
        opts.insert(MdOptions::ENABLE_TASKLISTS);
        let parser = MdParser::new_ext(raw, opts);
        let mut out = String::with_capacity(raw.len() * 3 / 2);
        html::push_html(&mut out, parser);
        Ok(out)
    }
}

#[derive(Serialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Rendered output keyed by `(entry id, predicate)`.
///
/// When full, one arbitrary entry is evicted; there is no recency tracking.
/// Callers must invalidate a key whenever its source attribute changes.
#[derive(Debug)]
pub struct RenderCache {
    entries: HashMap<(String, String), String>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), capacity, hits: 0, misses: 0, evictions: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached rendering of `raw`, rendering and caching it on a miss.
    /// Failed renders are not cached.
    pub fn get_or_render(
        &mut self,
        id: &str,
        predicate: &str,
        raw: &str,
        renderer: &dyn Renderer,
    ) -> Result<String, RenderError> {
        let key = (id.to_string(), predicate.to_string());
        if let Some(hit) = self.entries.get(&key) {
            self.hits += 1;
            debug!(id, predicate, "render cache hit");
            return Ok(hit.clone());
        }
        self.misses += 1;
        let rendered = renderer.render(raw)?;
        if self.capacity == 0 {
            return Ok(rendered);
        }
        if self.entries.len() >= self.capacity {
            if let Some(victim) = self.entries.keys().next().cloned() {
                self.entries.remove(&victim);
                self.evictions += 1;
            }
        }
        self.entries.insert(key, rendered.clone());
        Ok(rendered)
    }

    pub fn invalidate(&mut self, id: &str, predicate: &str) -> bool {
        self.entries.remove(&(id.to_string(), predicate.to_string())).is_some()
    }

    /// Drops every cached predicate of `id`.
    pub fn invalidate_entry(&mut self, id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(entry, _), _| entry != id);
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps the markdown renderer and counts calls; fails on input containing `FAIL`.
    #[derive(Default, Clone)]
    pub(crate) struct CountingRenderer {
        pub calls: Arc<AtomicUsize>,
    }

    impl CountingRenderer {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RenderCache {
        fn contains(&self, id: &str, predicate: &str) -> bool {
            self.entries.contains_key(&(id.to_string(), predicate.to_string()))
        }
    }

    impl Renderer for CountingRenderer {
        fn render(&self, raw: &str) -> Result<String, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if raw.contains("FAIL") {
                return Err(RenderError("forced failure".to_string()));
            }
            MarkdownRenderer.render(raw)
        }
    }

    #[test]
    fn markdown_renders_html() {
        let html = MarkdownRenderer.render("# Title\n\n~~gone~~ *em*").unwrap();
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<del>gone</del>"));
        assert!(html.contains("<em>em</em>"));
    }

    #[test]
    fn read_through_and_invalidate() {
        let renderer = CountingRenderer::default();
        let mut cache = RenderCache::new(8);
        let a = cache.get_or_render("e", "text", "one", &renderer).unwrap();
        let b = cache.get_or_render("e", "text", "two", &renderer).unwrap();
        // Second call is served from cache even though raw differs: invalidation is the caller's job.
        assert_eq!(a, b);
        assert_eq!(renderer.calls(), 1);
        assert!(cache.invalidate("e", "text"));
        let c = cache.get_or_render("e", "text", "two", &renderer).unwrap();
        assert!(c.contains("two"));
        assert_eq!(renderer.calls(), 2);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[test]
    fn failures_are_not_cached() {
        let renderer = CountingRenderer::default();
        let mut cache = RenderCache::new(8);
        assert!(cache.get_or_render("e", "text", "FAIL", &renderer).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let renderer = CountingRenderer::default();
        let mut cache = RenderCache::new(3);
        for i in 0..10 {
            cache.get_or_render(&format!("e{}", i), "text", "x", &renderer).unwrap();
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
        assert!(cache.contains("e9", "text"));
    }

    #[test]
    fn invalidate_entry_drops_all_predicates() {
        let renderer = CountingRenderer::default();
        let mut cache = RenderCache::new(8);
        cache.get_or_render("e", "text", "x", &renderer).unwrap();
        cache.get_or_render("e", "notes", "y", &renderer).unwrap();
        cache.get_or_render("f", "text", "z", &renderer).unwrap();
        assert_eq!(cache.invalidate_entry("e"), 2);
        assert!(cache.contains("f", "text"));
    }
}
