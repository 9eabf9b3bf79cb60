//! Favorites kept in memory and written behind to their store.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use super::write_behind::{BackingStore, WriteBehindCache};
use crate::model::types::Favorite;

/// Favorites keyed by URL, listed in position order.
pub struct FavoritesCache {
    cache: WriteBehindCache<String, Favorite>,
    /// Serializes read-modify-write edits so two new favorites never share a position.
    edit_lock: Mutex<()>,
}

impl FavoritesCache {
    /// Start the cache and load what the store already holds.
    pub fn open(store: Arc<dyn BackingStore<String, Favorite>>) -> Result<Self> {
        let cache = WriteBehindCache::new("favorites", store)?;
        cache.load()?;
        Ok(Self {
            cache,
            edit_lock: Mutex::new(()),
        })
    }

    /// Add a favorite at the end of the list, or update the title and icon of
    /// an existing one in place.
    pub fn add(&self, url: &str, title: &str, favicon_url: Option<String>) -> Favorite {
        let _guard = self.edit_lock.lock();
        let position = match self.cache.get(&url.to_string()) {
            Some(existing) => existing.position,
            None => self.all().last().map_or(1, |last| last.position + 1),
        };
        let favorite = Favorite {
            url: url.to_string(),
            title: title.to_string(),
            favicon_url,
            position,
        };
        self.cache.set(favorite.url.clone(), favorite.clone());
        favorite
    }

    /// Returns whether the URL was a favorite.
    pub fn remove(&self, url: &str) -> bool {
        let _guard = self.edit_lock.lock();
        let key = url.to_string();
        let present = self.cache.get(&key).is_some();
        if present {
            self.cache.delete(&key);
        }
        present
    }

    pub fn get(&self, url: &str) -> Option<Favorite> {
        self.cache.get(&url.to_string())
    }

    /// Every favorite, by position then URL.
    pub fn all(&self) -> Vec<Favorite> {
        let mut favorites = self.cache.list();
        favorites.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.url.cmp(&b.url)));
        favorites
    }

    /// Block until pending writes reach the store.
    pub fn flush(&self) {
        self.cache.flush();
    }
}
