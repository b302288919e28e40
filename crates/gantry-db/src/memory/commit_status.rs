use async_trait::async_trait;
use gantry_core::RepoId;
use gantry_core::commit_status::CommitStatus;

use super::MemoryTransaction;
use crate::{CommitStatusRepo, DbResult};

#[async_trait]
impl CommitStatusRepo for MemoryTransaction {
    async fn latest_commit_status(
        &mut self,
        repo_id: RepoId,
        sha: &str,
        context: &str,
    ) -> DbResult<Option<CommitStatus>> {
        Ok(self
            .staged
            .commit_statuses
            .iter()
            .rev()
            .find(|s| s.repo_id == repo_id && s.sha == sha && s.context == context)
            .cloned())
    }

    async fn insert_commit_status(&mut self, status: &CommitStatus) -> DbResult<()> {
        self.staged.commit_statuses.push(status.clone());
        Ok(())
    }

    async fn commit_statuses(&mut self, repo_id: RepoId, sha: &str) -> DbResult<Vec<CommitStatus>> {
        Ok(self
            .staged
            .commit_statuses
            .iter()
            .filter(|s| s.repo_id == repo_id && s.sha == sha)
            .cloned()
            .collect())
    }
}
