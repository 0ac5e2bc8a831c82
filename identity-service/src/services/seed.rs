use super::store::AccessStore;
use super::ServiceError;
use crate::models::{Role, DEFAULT_ROLES};

/// Insert any missing default role. Existing rows, including renamed
/// descriptions, are left alone, so running it again is a no-op.
pub async fn seed_default_roles(access: &dyn AccessStore) -> Result<usize, ServiceError> {
    let mut inserted = 0;
    for (name, description) in DEFAULT_ROLES {
        let role = Role::new(name.to_string(), Some(description.to_string()));
        if access.ensure_role(&role).await? {
            inserted += 1;
        }
    }
    tracing::info!(inserted, "Default roles seeded");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::MemoryStore;

    #[tokio::test]
    async fn seeding_twice_is_a_no_op() {
        let store = MemoryStore::new();

        assert_eq!(seed_default_roles(&store).await.unwrap(), DEFAULT_ROLES.len());
        let first = store.list_roles().await.unwrap();

        assert_eq!(seed_default_roles(&store).await.unwrap(), 0);
        assert_eq!(store.list_roles().await.unwrap(), first);
    }
}
