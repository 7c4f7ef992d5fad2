//! Deployment record model
//!
//! A [`DeploymentRecord`] is immutable once written except for its status and
//! `deployed_at`. Each record carries a version that is unique and gap-free
//! within its [`DeploymentKey`].

use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between key components in encoded keys
const KEY_SEP: u8 = 0;

/// Lifecycle label of a deployment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Deployed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 5] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Deploying,
        DeploymentStatus::Deployed,
        DeploymentStatus::Failed,
        DeploymentStatus::RolledBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "invalid status {:?}; must be one of: pending, deploying, deployed, failed, rolled_back",
                    s
                ))
            })
    }
}

/// The (domain, app_name) pair that owns a version lineage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentKey {
    pub domain: String,
    pub app_name: String,
}

impl DeploymentKey {
    pub fn new(domain: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            app_name: app_name.into(),
        }
    }

    /// `domain \0 app_name`
    pub(crate) fn head_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.domain.len() + self.app_name.len() + 1);
        key.extend_from_slice(self.domain.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(self.app_name.as_bytes());
        key
    }

    /// `domain \0 app_name \0 version` with a big-endian version so that all
    /// versions of a key sort together in ascending order.
    pub(crate) fn version_key(&self, version: u64) -> Vec<u8> {
        let mut key = self.head_key();
        key.push(KEY_SEP);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.app_name)
    }
}

/// Split an encoded version key into its key prefix and version.
pub(crate) fn split_version_key(raw: &[u8]) -> Option<(&[u8], u64)> {
    if raw.len() < 9 || raw[raw.len() - 9] != KEY_SEP {
        return None;
    }
    let (prefix, version) = raw.split_at(raw.len() - 8);
    let version = u64::from_be_bytes(version.try_into().ok()?);
    Some((&prefix[..prefix.len() - 1], version))
}

/// A validated request to append a new version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDeployment {
    pub domain: String,
    pub app_name: String,
    pub docker_image: String,
    pub port: u16,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NewDeployment {
    pub fn new(
        domain: impl Into<String>,
        app_name: impl Into<String>,
        docker_image: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            domain: domain.into(),
            app_name: app_name.into(),
            docker_image: docker_image.into(),
            port,
            env: Vec::new(),
            updated_at: None,
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(self.domain.clone(), self.app_name.clone())
    }

    pub fn validate(&self) -> Result<()> {
        require_key_part("domain", &self.domain)?;
        require_key_part("app_name", &self.app_name)?;
        if self.docker_image.trim().is_empty() {
            return Err(Error::Validation("docker_image is required".into()));
        }
        if self.port == 0 {
            return Err(Error::Validation(
                "port must be between 1 and 65535, got 0".into(),
            ));
        }
        Ok(())
    }
}

fn require_key_part(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    if value.as_bytes().contains(&KEY_SEP) {
        return Err(Error::Validation(format!(
            "{} must not contain NUL bytes",
            field
        )));
    }
    Ok(())
}

/// Push item as received on the wire.
///
/// Everything is optional here so that one bad item is reported against its
/// own index instead of rejecting the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentRequest {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeploymentRequest {
    pub fn validate(&self) -> Result<NewDeployment> {
        let port = match self.port {
            None => return Err(Error::Validation("port is required".into())),
            Some(p) => u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    Error::Validation(format!("port must be between 1 and 65535, got {}", p))
                })?,
        };

        let new = NewDeployment {
            domain: self.domain.clone(),
            app_name: self.app_name.clone(),
            docker_image: self.docker_image.clone(),
            port,
            env: self.env.clone().unwrap_or_default(),
            updated_at: self.updated_at,
        };
        new.validate()?;
        Ok(new)
    }
}

impl From<NewDeployment> for DeploymentRequest {
    fn from(new: NewDeployment) -> Self {
        Self {
            domain: new.domain,
            app_name: new.app_name,
            docker_image: new.docker_image,
            port: Some(i64::from(new.port)),
            env: Some(new.env),
            updated_at: new.updated_at,
        }
    }
}

/// One immutable version of an application's deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub request_id: String,
    pub domain: String,
    pub app_name: String,
    pub docker_image: String,
    pub port: u16,
    pub env: Vec<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(self.domain.clone(), self.app_name.clone())
    }

    /// Apply a status transition. Any status may follow any other; only
    /// `deployed` touches `deployed_at`.
    pub fn apply_status(&mut self, status: DeploymentStatus, now: DateTime<Utc>) {
        self.status = status;
        if status == DeploymentStatus::Deployed {
            self.deployed_at = Some(now);
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Aggregate counts over the latest record of every key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStats {
    pub total_deployments: u64,
    pub pending_count: u64,
    pub deployed_count: u64,
    pub failed_count: u64,
}

impl DeploymentStats {
    pub fn from_latest<'a>(records: impl IntoIterator<Item = &'a DeploymentRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_deployments += 1;
            match record.status {
                DeploymentStatus::Pending => stats.pending_count += 1,
                DeploymentStatus::Deployed => stats.deployed_count += 1,
                DeploymentStatus::Failed => stats.failed_count += 1,
                DeploymentStatus::Deploying | DeploymentStatus::RolledBack => {}
            }
        }
        stats
    }
}
