// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use coordination_engine::config::RedisConfig;
use coordination_engine::store::RedisStore;
use redis::AsyncCommands;
use std::sync::Arc;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams and Lua capable).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container plus helpers for opening stores against it.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    /// Test-tuned Redis settings under `prefix`.
    pub fn config(&self, prefix: &str) -> RedisConfig {
        RedisConfig::for_testing(&self.url, prefix)
    }

    /// Open a store client. Two clients with the same prefix see the same data,
    /// like two processes sharing a deployment.
    pub async fn store(&self, prefix: &str) -> Arc<RedisStore> {
        RedisStore::connect(self.config(prefix))
            .await
            .expect("Failed to connect to test Redis")
    }

    /// Length of a collection's change stream.
    pub async fn change_stream_len(&self, prefix: &str, collection: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.xlen(format!("{}{}:changes", prefix, collection)).await
    }

    /// Trim a change stream to nothing, simulating MAXLEN eviction.
    pub async fn trim_change_stream(&self, prefix: &str, collection: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("XTRIM")
            .arg(format!("{}{}:changes", prefix, collection))
            .arg("MAXLEN")
            .arg(0)
            .query_async(&mut conn)
            .await
    }

    /// Overwrite a lock record's owner field directly, simulating theft.
    pub async fn steal_lock(&self, prefix: &str, collection: &str, name: &str, thief: &str) -> redis::RedisResult<()> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.hset(format!("{}{}:doc:{}", prefix, collection, name), "owner", thief)
            .await
    }
}
