// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Investigator sessions.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rewind_common::{
    Bookmark, BranchId, EntityKind, Finding, ForensicSession, Result, SessionId, Severity,
    TimeMachineError,
};
use tracing::info;

/// In-memory registry of [`ForensicSession`]s.
///
/// Sessions only record ids. Callers resolve branch ids before attaching them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, ForensicSession>,
    order: RwLock<Vec<SessionId>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session.
    pub fn create_session(
        &self,
        name: impl Into<String>,
        target_contracts: Vec<String>,
        target_transactions: Vec<String>,
    ) -> Result<ForensicSession> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TimeMachineError::validation("session name must not be empty"));
        }
        let now = Utc::now();
        let session = ForensicSession {
            id: SessionId::generate(),
            name,
            target_contracts,
            target_transactions,
            branch_ids: Vec::new(),
            bookmarks: Vec::new(),
            findings: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        info!(session = %session.id, name = %session.name, "opened forensic session");
        self.order.write().push(session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn update(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut ForensicSession) -> Result<()>,
    ) -> Result<ForensicSession> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Session, id))?;
        f(session.value_mut())?;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    /// Attaches a branch; attaching twice is a no-op.
    pub fn attach_branch(&self, id: &SessionId, branch: BranchId) -> Result<ForensicSession> {
        self.update(id, |session| {
            if !session.branch_ids.contains(&branch) {
                session.branch_ids.push(branch);
            }
            Ok(())
        })
    }

    /// Bookmarks a branch.
    pub fn add_bookmark(
        &self,
        id: &SessionId,
        branch_id: BranchId,
        label: impl Into<String>,
        note: Option<String>,
    ) -> Result<ForensicSession> {
        let label = label.into();
        self.update(id, |session| {
            session.bookmarks.push(Bookmark { branch_id, label, note, created_at: Utc::now() });
            Ok(())
        })
    }

    /// Records a finding. The title must not be blank.
    pub fn add_finding(
        &self,
        id: &SessionId,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        branch_id: Option<BranchId>,
    ) -> Result<ForensicSession> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(TimeMachineError::validation("finding title must not be empty"));
        }
        let description = description.into();
        self.update(id, |session| {
            info!(session = %session.id, %severity, %title, "recorded finding");
            session.findings.push(Finding {
                severity,
                title,
                description,
                branch_id,
                created_at: Utc::now(),
            });
            Ok(())
        })
    }

    /// Looks a session up.
    pub fn get(&self, id: &SessionId) -> Result<ForensicSession> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| TimeMachineError::not_found(EntityKind::Session, id))
    }

    /// Sessions in creation order.
    pub fn list(&self) -> Vec<ForensicSession> {
        self.order.read().iter().filter_map(|id| self.sessions.get(id).map(|s| s.clone())).collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let session =
            registry.create_session("exploit", vec!["0xabc".into()], Vec::new()).unwrap();
        let branch = BranchId::new("br-1");

        registry.attach_branch(&session.id, branch.clone()).unwrap();
        let updated = registry.attach_branch(&session.id, branch.clone()).unwrap();
        assert_eq!(updated.branch_ids, vec![branch.clone()]);

        registry.add_bookmark(&session.id, branch.clone(), "before drain", None).unwrap();
        let updated = registry
            .add_finding(&session.id, Severity::High, "reentrancy", "vault drained", Some(branch))
            .unwrap();
        assert_eq!(updated.bookmarks.len(), 1);
        assert_eq!(updated.findings[0].severity, Severity::High);
        assert!(updated.updated_at >= updated.created_at);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_invalid_inputs() {
        let registry = SessionRegistry::new();
        assert!(registry.create_session(" ", Vec::new(), Vec::new()).is_err());
        let session = registry.create_session("s", Vec::new(), Vec::new()).unwrap();
        assert!(matches!(
            registry.add_finding(&session.id, Severity::Low, "", "", None),
            Err(TimeMachineError::Validation(_))
        ));
        let missing = SessionId::new("sess-missing");
        assert!(registry.get(&missing).unwrap_err().is_not_found(EntityKind::Session));
        assert!(registry.attach_branch(&missing, BranchId::new("b")).is_err());
        assert!(!registry.is_empty());
    }
}
