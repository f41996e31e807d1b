use indexmap::IndexMap;

use super::{CommonMarkConverter, ConvertError, Fragment, MarkupConverter};

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Memoizes markdown conversion by exact raw text.
///
/// Eviction is strict insertion order: a hit does not refresh an entry.
pub struct MarkdownCache {
    converter: Box<dyn MarkupConverter>,
    entries: IndexMap<String, Fragment>,
    capacity: usize,
}

impl MarkdownCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_converter(capacity, Box::new(CommonMarkConverter::default()))
    }

    pub fn with_converter(capacity: usize, converter: Box<dyn MarkupConverter>) -> Self {
        let capacity = capacity.max(1);
        Self {
            converter,
            entries: IndexMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns an independent copy of the sanitized fragment for `raw`.
    ///
    /// Conversion failures fall back to plain text and are not cached.
    pub fn render(&mut self, raw: &str) -> Fragment {
        if let Some(fragment) = self.entries.get(raw) {
            return fragment.clone();
        }

        match self.converter.convert(raw) {
            Ok(fragment) => {
                if self.entries.len() >= self.capacity {
                    self.entries.shift_remove_index(0);
                }
                self.entries.insert(raw.to_string(), fragment.clone());
                fragment
            }
            Err(error) => plain_text_fallback(raw, &error),
        }
    }

    /// Like [`render`](Self::render) but never inserts; for partial text
    /// that will not be asked for again.
    pub fn preview(&self, raw: &str) -> Fragment {
        if let Some(fragment) = self.entries.get(raw) {
            return fragment.clone();
        }
        self.converter
            .convert(raw)
            .unwrap_or_else(|error| plain_text_fallback(raw, &error))
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.entries.contains_key(raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn plain_text_fallback(raw: &str, error: &ConvertError) -> Fragment {
    tracing::warn!(
        stage = error.stage(),
        %error,
        length = raw.len(),
        "markdown conversion failed, showing plain text"
    );
    Fragment::plain_text(raw)
}

impl Default for MarkdownCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for MarkdownCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MarkdownCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
