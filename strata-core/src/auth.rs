//! Authentication and capability checks.
//!
//! Token validation lives behind a provider trait so the server can plug in
//! different backends; the core engines only see an [`AuthContext`] carrying
//! the authenticated user and their capabilities.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Capabilities an operation may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    CommitWrite,
    SchemaWrite,
    InstanceWrite,
    Push,
    CreateDb,
    DeleteDb,
}

impl Capability {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Capability::Read),
            "commit_write" => Some(Capability::CommitWrite),
            "schema_write" => Some(Capability::SchemaWrite),
            "instance_write" => Some(Capability::InstanceWrite),
            "push" => Some(Capability::Push),
            "create_db" => Some(Capability::CreateDb),
            "delete_db" => Some(Capability::DeleteDb),
            _ => None,
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: String,
    capabilities: HashSet<Capability>,
}

impl AuthContext {
    pub fn new(user: impl Into<String>, capabilities: HashSet<Capability>) -> Self {
        Self {
            user: user.into(),
            capabilities,
        }
    }

    /// A context holding every capability; used by the CLI operating on its
    /// own local store.
    pub fn superuser(user: impl Into<String>) -> Self {
        let capabilities = [
            Capability::Read,
            Capability::CommitWrite,
            Capability::SchemaWrite,
            Capability::InstanceWrite,
            Capability::Push,
            Capability::CreateDb,
            Capability::DeleteDb,
        ]
        .into_iter()
        .collect();
        Self::new(user, capabilities)
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Require a capability, failing with `Unauthorized` otherwise.
    pub fn require(&self, capability: Capability) -> Result<(), crate::error::SyncError> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(crate::error::SyncError::Unauthorized(format!(
                "user {} lacks {:?}",
                self.user, capability
            )))
        }
    }
}

/// Validates bearer tokens into auth contexts.
#[async_trait]
pub trait TokenAuthProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<AuthContext>;
}

/// Token table loaded from a file.
///
/// One entry per line: `token:user:cap1,cap2,…`. Blank lines and `#` comments
/// are skipped.
pub struct StaticTokenProvider {
    tokens: HashMap<String, AuthContext>,
}

impl StaticTokenProvider {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("failed to read token file: {}", e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let mut tokens = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.splitn(3, ':').collect();
            if parts.len() != 3 {
                return Err(format!("invalid token line: {}", line));
            }
            let (token, user, caps) = (parts[0].trim(), parts[1].trim(), parts[2].trim());
            if token.is_empty() || user.is_empty() {
                return Err(format!("invalid token line (empty field): {}", line));
            }
            let mut capabilities = HashSet::new();
            for cap in caps.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                match Capability::parse(cap) {
                    Some(c) => {
                        capabilities.insert(c);
                    }
                    None => return Err(format!("unknown capability {} in line: {}", cap, line)),
                }
            }
            tokens.insert(token.to_string(), AuthContext::new(user, capabilities));
        }
        if tokens.is_empty() {
            return Err("no valid tokens found".to_string());
        }
        Ok(Self { tokens })
    }
}

#[async_trait]
impl TokenAuthProvider for StaticTokenProvider {
    async fn authenticate(&self, token: &str) -> Option<AuthContext> {
        self.tokens.get(token).cloned()
    }
}

/// Accepts any token, granting full capabilities. Useful when authentication
/// is handled by another layer (e.g. a reverse proxy) or in tests.
#[derive(Default)]
pub struct OpenAuthProvider;

#[async_trait]
impl TokenAuthProvider for OpenAuthProvider {
    async fn authenticate(&self, _token: &str) -> Option<AuthContext> {
        Some(AuthContext::superuser("anonymous"))
    }
}
