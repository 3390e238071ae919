use crate::matcher::CategoryMatch;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// Persistence for CategoryMatch, keyed by group identifier. Lookups never
/// fail: an unreachable backend reads as a miss.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get(&self, tag: &str) -> Option<CategoryMatch>;
    async fn put(&self, category_match: &CategoryMatch);
}

#[derive(Default)]
pub struct MemoryMatchStore {
    entries: RwLock<HashMap<String, CategoryMatch>>,
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn get(&self, tag: &str) -> Option<CategoryMatch> {
        self.entries.read().await.get(tag.trim()).cloned()
    }

    async fn put(&self, category_match: &CategoryMatch) {
        self.entries
            .write()
            .await
            .insert(category_match.tag.trim().to_string(), category_match.clone());
    }
}

pub struct RedisMatchStore {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisMatchStore {
    pub fn new(client: redis::Client, ttl_secs: u64) -> Self {
        Self { client, ttl_secs }
    }
}

pub fn match_key(tag: &str) -> String {
    format!("metafield:match:{}", urlencoding::encode(tag.trim()))
}

#[async_trait]
impl MatchStore for RedisMatchStore {
    async fn get(&self, tag: &str) -> Option<CategoryMatch> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(target = "metafield.matcher", error = %err, "match store unavailable");
                return None;
            }
        };
        let raw: Option<String> = conn.get(match_key(tag)).await.ok().flatten();
        raw.and_then(|value| serde_json::from_str(&value).ok())
    }

    async fn put(&self, category_match: &CategoryMatch) {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await
            && let Ok(json) = serde_json::to_string(category_match)
        {
            let key = match_key(&category_match.tag);
            let result: Result<(), _> = if self.ttl_secs > 0 {
                conn.set_ex(key, json, self.ttl_secs).await
            } else {
                conn.set(key, json).await
            };
            if let Err(err) = result {
                warn!(target = "metafield.matcher", tag = %category_match.tag, error = %err, "match store write failed");
            }
        }
    }
}
