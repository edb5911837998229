//! Orchestrator: the external-facing operations.
//!
//! Every operation authorizes the caller, resolves the database context and
//! delegates to an engine. Bundle and unbundle are not a separate codec: a
//! bundle is a push against a synthetic in-memory remote, and unbundle is the
//! matching pull.

use crate::auth::{AuthContext, Capability};
use crate::clone::{clone_db, CloneReport};
use crate::commit::{GraphKind, TripleDelta};
use crate::db::{DatabaseContext, DatabaseRegistry, DatabaseSpec};
use crate::error::SyncError;
use crate::exchange::{pack_from_head, receive_payload};
use crate::fetch::{fetch, FetchOutcome};
use crate::graph::{RepoDelta, RepositoryGraph};
use crate::history::{append_commit, branch_log, build_commit, LogEntry};
use crate::layer::{CommitId, LayerId};
use crate::meta::RemoteKind;
use crate::pull::{pull, PullReport};
use crate::push::{push, PushResult};
use crate::transport::{InMemoryPayloadTransport, Transport, BUNDLE_URL};
use bytes::Bytes;
use std::sync::Arc;

/// Name under which the synthetic bundle remote is temporarily installed.
const BUNDLE_REMOTE: &str = "_bundle";

/// Resolve a push target to a branch name.
///
/// Accepts a bare branch name or a `local/branch/<name>` reference; anything
/// else (a commit or repository reference) is not pushable.
pub fn resolve_branch_target(target: &str) -> Result<String, SyncError> {
    if !target.contains('/') {
        if target.is_empty() {
            return Err(SyncError::PushRequiresBranch(target.to_string()));
        }
        return Ok(target.to_string());
    }
    let segments: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["local", "branch", name] => Ok((*name).to_string()),
        _ => Err(SyncError::PushRequiresBranch(target.to_string())),
    }
}

/// The external-facing API over a database registry.
pub struct Orchestrator {
    registry: Arc<DatabaseRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<DatabaseRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.registry
    }

    fn open(&self, spec: &DatabaseSpec) -> Result<DatabaseContext, SyncError> {
        self.registry.open_db(spec)
    }

    /// Serve a pack of the local repository chain down to `baseline`.
    /// `None` means the requester is already up to date.
    pub async fn pack(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        baseline: Option<LayerId>,
    ) -> Result<Option<Bytes>, SyncError> {
        auth.require(Capability::Read)?;
        let ctx = self.open(spec)?;
        let head = ctx.meta.snapshot().await.local_head;
        pack_from_head(ctx.store.as_ref(), head, baseline).await
    }

    /// Receive a payload and advance the local repository head.
    pub async fn unpack(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        payload: &[u8],
    ) -> Result<LayerId, SyncError> {
        auth.require(Capability::Push)?;
        let ctx = self.open(spec)?;
        receive_payload(ctx.store.as_ref(), ctx.meta.as_ref(), payload).await
    }

    pub async fn fetch(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        remote_name: &str,
        transport: &dyn Transport,
    ) -> Result<FetchOutcome, SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;
        fetch(&ctx, remote_name, transport).await
    }

    pub async fn push(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        branch_target: &str,
        remote_name: &str,
        transport: &dyn Transport,
    ) -> Result<PushResult, SyncError> {
        auth.require(Capability::Push)?;
        let branch = resolve_branch_target(branch_target)?;
        let ctx = self.open(spec)?;
        push(&ctx, &branch, remote_name, transport).await
    }

    pub async fn pull(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        local_branch: &str,
        remote_name: &str,
        remote_branch: &str,
        transport: &dyn Transport,
    ) -> Result<PullReport, SyncError> {
        auth.require(Capability::SchemaWrite)?;
        auth.require(Capability::InstanceWrite)?;
        let ctx = self.open(spec)?;
        pull(&ctx, local_branch, remote_name, remote_branch, transport).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn clone_db(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        label: &str,
        comment: &str,
        public: bool,
        remote_url: &str,
        transport: &dyn Transport,
    ) -> Result<CloneReport, SyncError> {
        auth.require(Capability::CreateDb)?;
        clone_db(
            &self.registry,
            spec,
            label,
            comment,
            public,
            remote_url,
            transport,
        )
        .await
    }

    /// Produce a self-contained payload of `branch`'s history by pushing to a
    /// capture-to-memory remote. `None` when the branch is empty.
    pub async fn bundle(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        branch: Option<&str>,
    ) -> Result<Option<Bytes>, SyncError> {
        auth.require(Capability::Read)?;
        let ctx = self.open(spec)?;
        let branch = branch.unwrap_or("main");

        self.install_bundle_remote(&ctx).await?;
        let transport = InMemoryPayloadTransport::capture();
        let result = push(&ctx, branch, BUNDLE_REMOTE, &transport).await;
        let captured = transport.captured().await;
        self.remove_bundle_remote(&ctx).await?;

        result?;
        Ok(captured)
    }

    /// Apply a bundle payload by pulling from a replay remote.
    pub async fn unbundle(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        payload: Bytes,
    ) -> Result<PullReport, SyncError> {
        auth.require(Capability::SchemaWrite)?;
        auth.require(Capability::InstanceWrite)?;
        let ctx = self.open(spec)?;

        self.install_bundle_remote(&ctx).await?;
        let transport = InMemoryPayloadTransport::replay(payload);
        let result = pull(&ctx, "main", BUNDLE_REMOTE, "main", &transport).await;
        self.remove_bundle_remote(&ctx).await?;

        result
    }

    async fn install_bundle_remote(&self, ctx: &DatabaseContext) -> Result<(), SyncError> {
        let mut txn = ctx.meta.begin().await;
        if txn.doc().remote(BUNDLE_REMOTE).is_ok() {
            txn.doc_mut().remove_remote(BUNDLE_REMOTE)?;
        }
        txn.doc_mut()
            .add_remote(BUNDLE_REMOTE, BUNDLE_URL, RemoteKind::Remote)?;
        txn.commit()
    }

    async fn remove_bundle_remote(&self, ctx: &DatabaseContext) -> Result<(), SyncError> {
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut().remove_remote(BUNDLE_REMOTE)?;
        txn.commit()
    }

    /// Append a commit to `branch` of the local repository.
    pub async fn commit(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        branch: &str,
        message: &str,
        deltas: &[(GraphKind, TripleDelta)],
        timestamp: Option<i64>,
    ) -> Result<CommitId, SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;

        let mut txn = ctx.meta.begin().await;
        let mut local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head).await?;
        if !local.has_branch(branch) {
            return Err(SyncError::NotFound(format!("branch {}", branch)));
        }
        let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let (record, layers) =
            build_commit(&local, branch, &auth.user, message, timestamp, deltas)?;
        let id = append_commit(&mut local, ctx.store.as_ref(), branch, record, layers).await?;
        txn.doc_mut().local_head = local.head;
        txn.commit()?;
        Ok(id)
    }

    pub async fn log(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        branch: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, SyncError> {
        auth.require(Capability::Read)?;
        let ctx = self.open(spec)?;
        let local = ctx.local_graph().await?;
        if !local.has_branch(branch) {
            return Err(SyncError::NotFound(format!("branch {}", branch)));
        }
        branch_log(&local, branch, limit)
    }

    pub async fn create_branch(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        name: &str,
        from: Option<CommitId>,
    ) -> Result<(), SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;

        let mut txn = ctx.meta.begin().await;
        let mut local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head).await?;
        if local.has_branch(name) {
            return Err(SyncError::RemoteAlreadyExists(format!("branch {}", name)));
        }
        if let Some(commit) = from {
            if !local.has_commit(&commit) {
                return Err(SyncError::NotFound(format!("commit {}", commit)));
            }
        }
        local
            .append(
                ctx.store.as_ref(),
                &RepoDelta {
                    branches: vec![(name.to_string(), from)],
                    ..Default::default()
                },
            )
            .await?;
        txn.doc_mut().local_head = local.head;
        txn.commit()
    }

    pub async fn delete_branch(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        name: &str,
    ) -> Result<(), SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;

        let mut txn = ctx.meta.begin().await;
        let mut local = RepositoryGraph::load(ctx.store.as_ref(), txn.doc().local_head).await?;
        if !local.has_branch(name) {
            return Err(SyncError::NotFound(format!("branch {}", name)));
        }
        local
            .append(
                ctx.store.as_ref(),
                &RepoDelta {
                    deleted_branches: vec![name.to_string()],
                    ..Default::default()
                },
            )
            .await?;
        txn.doc_mut().local_head = local.head;
        txn.commit()
    }

    /// List branch names of the local repository.
    pub async fn list_branches(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
    ) -> Result<Vec<String>, SyncError> {
        auth.require(Capability::Read)?;
        let ctx = self.open(spec)?;
        let local = ctx.local_graph().await?;
        Ok(local.branch_names().cloned().collect())
    }

    /// Register a remote on an existing database.
    pub async fn add_remote(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        name: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut().add_remote(name, url, RemoteKind::Remote)?;
        txn.commit()
    }

    pub async fn remove_remote(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        name: &str,
    ) -> Result<(), SyncError> {
        auth.require(Capability::CommitWrite)?;
        let ctx = self.open(spec)?;
        let mut txn = ctx.meta.begin().await;
        txn.doc_mut().remove_remote(name)?;
        txn.commit()
    }

    /// List remotes as (name, url, head) tuples.
    pub async fn list_remotes(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
    ) -> Result<Vec<(String, String, Option<LayerId>)>, SyncError> {
        auth.require(Capability::Read)?;
        let ctx = self.open(spec)?;
        let doc = ctx.meta.snapshot().await;
        Ok(doc
            .remotes
            .iter()
            .map(|(name, record)| (name.clone(), record.url.clone(), record.head))
            .collect())
    }

    /// Create a fresh, finalized database.
    pub async fn create_db(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
        label: &str,
        comment: &str,
        public: bool,
    ) -> Result<(), SyncError> {
        auth.require(Capability::CreateDb)?;
        self.registry.create(spec, label, comment, public).await?;
        Ok(())
    }

    /// Delete a database outright.
    pub async fn delete_db(
        &self,
        auth: &AuthContext,
        spec: &DatabaseSpec,
    ) -> Result<(), SyncError> {
        auth.require(Capability::DeleteDb)?;
        if !self.registry.exists(spec)? {
            return Err(SyncError::NotFound(format!("database {}", spec)));
        }
        self.registry.force_delete(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Triple;
    use tempfile::TempDir;

    fn harness() -> (TempDir, Orchestrator, AuthContext) {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(DatabaseRegistry::open(tmp.path()).unwrap());
        let orchestrator = Orchestrator::new(registry);
        let auth = AuthContext::superuser("alice");
        (tmp, orchestrator, auth)
    }

    #[test]
    fn test_resolve_branch_target() {
        assert_eq!(resolve_branch_target("main").unwrap(), "main");
        assert_eq!(resolve_branch_target("local/branch/dev").unwrap(), "dev");
        assert!(matches!(
            resolve_branch_target("local/commit/abc123"),
            Err(SyncError::PushRequiresBranch(_))
        ));
        assert!(matches!(
            resolve_branch_target(""),
            Err(SyncError::PushRequiresBranch(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_and_log() {
        let (_tmp, api, auth) = harness();
        let spec = DatabaseSpec::new("acme", "crm");
        api.create_db(&auth, &spec, "CRM", "", false).await.unwrap();

        api.commit(
            &auth,
            &spec,
            "main",
            "add customer",
            &[(
                GraphKind::Instance,
                TripleDelta::additions(vec![Triple::new("c1", "name", "Acme")]),
            )],
            Some(1000),
        )
        .await
        .unwrap();

        let log = api.log(&auth, &spec, "main", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "add customer");
        assert_eq!(log[0].author, "alice");
    }

    #[tokio::test]
    async fn test_capability_checks() {
        let (_tmp, api, _) = harness();
        let spec = DatabaseSpec::new("acme", "crm");
        let reader = AuthContext::new(
            "bob",
            [Capability::Read].into_iter().collect(),
        );

        let err = api
            .create_db(&reader, &spec, "CRM", "", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));

        let admin = AuthContext::superuser("alice");
        api.create_db(&admin, &spec, "CRM", "", false).await.unwrap();

        let err = api
            .commit(&reader, &spec, "main", "nope", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_bundle_of_empty_branch_is_none() {
        let (_tmp, api, auth) = harness();
        let spec = DatabaseSpec::new("acme", "crm");
        api.create_db(&auth, &spec, "CRM", "", false).await.unwrap();

        let bundle = api.bundle(&auth, &spec, None).await.unwrap();
        assert!(bundle.is_none());

        // The synthetic remote must be gone afterwards.
        let remotes = api.list_remotes(&auth, &spec).await.unwrap();
        assert!(remotes.is_empty());
    }

    #[tokio::test]
    async fn test_bundle_roundtrip() {
        let (_tmp, api, auth) = harness();
        let src = DatabaseSpec::new("acme", "src");
        api.create_db(&auth, &src, "Src", "", false).await.unwrap();
        let c1 = api
            .commit(
                &auth,
                &src,
                "main",
                "seed",
                &[(
                    GraphKind::Instance,
                    TripleDelta::additions(vec![Triple::new("s", "p", "o")]),
                )],
                Some(1000),
            )
            .await
            .unwrap();

        let payload = api.bundle(&auth, &src, None).await.unwrap().unwrap();

        let dst = DatabaseSpec::new("acme", "dst");
        api.create_db(&auth, &dst, "Dst", "", false).await.unwrap();
        let report = api.unbundle(&auth, &dst, payload).await.unwrap();
        assert_eq!(report.applied_commits(), &[c1]);

        let log = api.log(&auth, &dst, "main", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "seed");
    }

    #[tokio::test]
    async fn test_branch_management() {
        let (_tmp, api, auth) = harness();
        let spec = DatabaseSpec::new("acme", "crm");
        api.create_db(&auth, &spec, "CRM", "", false).await.unwrap();

        let c1 = api
            .commit(&auth, &spec, "main", "seed", &[], Some(1000))
            .await
            .unwrap();
        api.create_branch(&auth, &spec, "dev", Some(c1))
            .await
            .unwrap();

        let log = api.log(&auth, &spec, "dev", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(
            api.list_branches(&auth, &spec).await.unwrap(),
            vec!["dev".to_string(), "main".to_string()]
        );

        api.delete_branch(&auth, &spec, "dev").await.unwrap();
        assert!(api.log(&auth, &spec, "dev", 10).await.is_err());
        assert_eq!(
            api.list_branches(&auth, &spec).await.unwrap(),
            vec!["main".to_string()]
        );
    }

    #[tokio::test]
    async fn test_pack_against_own_head_is_none() {
        let (_tmp, api, auth) = harness();
        let spec = DatabaseSpec::new("acme", "crm");
        api.create_db(&auth, &spec, "CRM", "", false).await.unwrap();

        let ctx = api.registry().open_db(&spec).unwrap();
        let head = ctx.meta.snapshot().await.local_head;
        let pack = api.pack(&auth, &spec, head).await.unwrap();
        assert!(pack.is_none());

        let full = api.pack(&auth, &spec, None).await.unwrap();
        assert!(full.is_some());
    }
}
