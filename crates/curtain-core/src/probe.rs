//! Readiness probes.
//!
//! A probe performs one read-only check against a dependency. It never retries;
//! retrying and deadlines belong to [`crate::waiter`].

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;

use crate::config::{DependencyConfig, ProbeSpec};
use crate::error::{CurtainError, Result};

/// Outcome of a single probe attempt; the error is a human-readable reason.
pub type ProbeResult = std::result::Result<(), String>;

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> ProbeResult;

    fn describe(&self) -> String;
}

/// Builds probes for declared dependencies. Swapped out in tests.
pub trait ProbeFactory: Send + Sync {
    fn probe_for(&self, name: &str, dependency: &DependencyConfig) -> Result<Arc<dyn Probe>>;
}

/// Builds the real network probe for each [`ProbeSpec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProbes;

impl ProbeFactory for NetworkProbes {
    fn probe_for(&self, _name: &str, dependency: &DependencyConfig) -> Result<Arc<dyn Probe>> {
        build_probe(&dependency.probe)
    }
}

pub fn build_probe(spec: &ProbeSpec) -> Result<Arc<dyn Probe>> {
    let probe: Arc<dyn Probe> = match spec {
        ProbeSpec::Tcp { address } => Arc::new(TcpProbe {
            address: address.clone(),
        }),
        ProbeSpec::Postgres { url } => Arc::new(PostgresProbe { url: url.clone() }),
        ProbeSpec::Redis { url } => Arc::new(RedisProbe { url: url.clone() }),
        ProbeSpec::Http {
            url,
            expect_status,
            expect_body,
        } => {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| CurtainError::InvalidConfig(format!("http client: {e}")))?;
            Arc::new(HttpProbe {
                client,
                url: url.clone(),
                expect_status: expect_status.clone(),
                expect_body: expect_body.clone(),
                label: spec.describe(),
            })
        }
    };
    Ok(probe)
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

pub struct TcpProbe {
    pub address: String,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> ProbeResult {
        tokio::net::TcpStream::connect(&self.address)
            .await
            .map(|_| ())
            .map_err(|e| format!("connect {}: {e}", self.address))
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

pub struct PostgresProbe {
    pub url: String,
}

#[async_trait]
impl Probe for PostgresProbe {
    async fn check(&self) -> ProbeResult {
        let mut conn = sqlx::PgConnection::connect(&self.url)
            .await
            .map_err(|e| e.to_string())?;
        let result = sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string());
        let _ = conn.close().await;
        result
    }

    fn describe(&self) -> String {
        ProbeSpec::Postgres {
            url: self.url.clone(),
        }
        .describe()
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

pub struct RedisProbe {
    pub url: String,
}

#[async_trait]
impl Probe for RedisProbe {
    async fn check(&self) -> ProbeResult {
        let client = redis::Client::open(self.url.as_str()).map_err(|e| e.to_string())?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| e.to_string())?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(format!("unexpected PING reply: {pong}"))
        }
    }

    fn describe(&self) -> String {
        ProbeSpec::Redis {
            url: self.url.clone(),
        }
        .describe()
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    expect_status: Vec<u16>,
    expect_body: Option<String>,
    label: String,
}

impl HttpProbe {
    fn accepts(&self, status: reqwest::StatusCode) -> bool {
        if self.expect_status.is_empty() {
            status.is_success()
        } else {
            self.expect_status.contains(&status.as_u16())
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> ProbeResult {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !self.accepts(status) {
            return Err(format!("unexpected status {status}"));
        }
        if let Some(expected) = &self.expect_body {
            let body = response.text().await.map_err(|e| e.to_string())?;
            if body.trim() != expected {
                let preview: String = body.trim().chars().take(80).collect();
                return Err(format!("unexpected body '{preview}'"));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
