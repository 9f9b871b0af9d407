//! Identity to role resolution

use crate::identity::{EntityRecord, EntityRole, Identity, Role};
use crate::runtime::{BackendError, EntityStores};
use thiserror::Error;

/// Outcome of resolving one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRole {
    pub role: Role,
    pub record: Option<EntityRecord>,
    pub is_privileged: bool,
}

impl ResolvedRole {
    pub fn unknown() -> Self {
        Self {
            role: Role::Unknown,
            record: None,
            is_privileged: false,
        }
    }

    pub fn display_name(&self) -> Option<String> {
        self.record.as_ref().map(EntityRecord::display_name)
    }
}

#[derive(Debug, Error)]
#[error("could not resolve role for {identity}: {errors:?}")]
pub struct ResolutionFailed {
    pub identity: Identity,
    pub errors: Vec<(EntityRole, BackendError)>,
}

/// Probes entity stores in priority order; the first match wins
#[derive(Clone)]
pub struct RoleResolver {
    stores: EntityStores,
}

impl RoleResolver {
    pub fn new(stores: EntityStores) -> Self {
        Self { stores }
    }

    /// A failing store does not stop the probe. It only matters when no later
    /// store matches: then the identity cannot safely be called Unknown.
    pub async fn resolve(&self, identity: Identity) -> Result<ResolvedRole, ResolutionFailed> {
        let mut errors = Vec::new();
        for role in EntityRole::PRIORITY {
            match self.stores.get(role).find_by_identity(identity).await {
                Ok(Some(record)) => {
                    if !errors.is_empty() {
                        tracing::warn!(
                            %identity,
                            ?errors,
                            role = role.as_str(),
                            "Resolved role despite store errors"
                        );
                    }
                    return Ok(ResolvedRole {
                        role: role.into(),
                        is_privileged: record.is_privileged(),
                        record: Some(record),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%identity, role = role.as_str(), error = %e, "Entity lookup failed");
                    errors.push((role, e));
                }
            }
        }
        if errors.is_empty() {
            Ok(ResolvedRole::unknown())
        } else {
            Err(ResolutionFailed { identity, errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AdminRecord, ParentRecord, StudentRecord, TutorRecord};
    use crate::runtime::testing::InMemoryBackend;
    use std::sync::Arc;

    fn admin(id: i64, is_admin: bool) -> EntityRecord {
        EntityRecord::Admin(AdminRecord {
            telegram_id: Identity(id),
            name: "Boss".into(),
            is_admin,
        })
    }

    fn tutor(id: i64, is_admin: bool) -> EntityRecord {
        EntityRecord::Tutor(TutorRecord {
            telegram_id: Identity(id),
            name: "Maria".into(),
            is_admin,
        })
    }

    fn student(id: i64) -> EntityRecord {
        EntityRecord::Student(StudentRecord {
            telegram_id: Identity(id),
            first_name: "Ivan".into(),
            last_name: "Petrov".into(),
            is_admin: false,
            payed_lessons: 0,
            parent: None,
        })
    }

    fn parent(id: i64) -> EntityRecord {
        EntityRecord::Parent(ParentRecord {
            telegram_id: Identity(id),
            full_name: "Anna Petrova".into(),
        })
    }

    fn resolver(backend: &Arc<InMemoryBackend>) -> RoleResolver {
        RoleResolver::new(backend.entity_stores())
    }

    #[tokio::test]
    async fn test_single_store_match() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_record(tutor(2, false));
        backend.insert_record(student(3));
        backend.insert_record(parent(4));
        let resolver = resolver(&backend);

        assert_eq!(resolver.resolve(Identity(2)).await.unwrap().role, Role::Tutor);
        assert_eq!(resolver.resolve(Identity(3)).await.unwrap().role, Role::Student);
        let resolved = resolver.resolve(Identity(4)).await.unwrap();
        assert_eq!(resolved.role, Role::Parent);
        assert!(!resolved.is_privileged);
    }

    #[tokio::test]
    async fn test_admin_wins_over_other_stores() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_record(student(1));
        backend.insert_record(parent(1));
        backend.insert_record(admin(1, true));
        let resolved = resolver(&backend).resolve(Identity(1)).await.unwrap();
        assert_eq!(resolved.role, Role::Admin);
        assert!(resolved.is_privileged);
    }

    #[tokio::test]
    async fn test_privilege_comes_from_record_flag() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_record(tutor(5, true));
        backend.insert_record(admin(6, false));
        let resolver = resolver(&backend);

        let head_tutor = resolver.resolve(Identity(5)).await.unwrap();
        assert_eq!(head_tutor.role, Role::Tutor);
        assert!(head_tutor.is_privileged);

        let demoted = resolver.resolve(Identity(6)).await.unwrap();
        assert_eq!(demoted.role, Role::Admin);
        assert!(!demoted.is_privileged);
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let backend = Arc::new(InMemoryBackend::new());
        let resolved = resolver(&backend).resolve(Identity(99)).await.unwrap();
        assert_eq!(resolved, ResolvedRole::unknown());
    }

    #[tokio::test]
    async fn test_failed_store_is_skipped_when_later_store_matches() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_record(student(7));
        backend.fail_lookups(EntityRole::Tutor);
        let resolved = resolver(&backend).resolve(Identity(7)).await.unwrap();
        assert_eq!(resolved.role, Role::Student);
    }

    #[tokio::test]
    async fn test_outage_is_not_reported_as_unknown() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_lookups(EntityRole::Admin);
        let err = resolver(&backend).resolve(Identity(8)).await.unwrap_err();
        assert_eq!(err.identity, Identity(8));
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].0, EntityRole::Admin);
    }
}
