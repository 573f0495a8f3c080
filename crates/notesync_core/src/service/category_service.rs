//! Category use-case service.

use crate::model::entity::{Category, Entity, EntityId, EntityKind};
use crate::model::now_epoch_ms;
use crate::repo::entity_repo::EntityListQuery;
use crate::repo::store::Persisted;
use crate::service::{normalize_list_limit, ListResult, Mutation, ServiceError};
use crate::sync::apply::LocalMutation;
use crate::sync::session::SyncSession;
use uuid::Uuid;

/// Category service facade over one sync session.
pub struct CategoryService<'s, 'conn> {
    session: &'s SyncSession<'conn>,
}

impl<'s, 'conn> CategoryService<'s, 'conn> {
    pub fn new(session: &'s SyncSession<'conn>) -> Self {
        Self { session }
    }

    /// Creates one category. Names are trimmed and must not be empty.
    pub fn create_category(
        &self,
        name: &str,
        color: Option<&str>,
    ) -> Result<Mutation<Category>, ServiceError> {
        let mut category = Category::blank(
            Uuid::new_v4(),
            self.session.caller().cloned(),
            now_epoch_ms(),
        );
        category.name = normalize_name(name)?;
        category.color = normalize_color(color);
        let persisted = self
            .session
            .engine()
            .record_local_create(Entity::Category(category))?;
        into_category_mutation(persisted)
    }

    /// Renames and/or recolors a category with replacement semantics.
    pub fn update_category(
        &self,
        id: EntityId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Mutation<Category>, ServiceError> {
        let mut category = self.get_category(id)?.ok_or(ServiceError::NotFound {
            kind: EntityKind::Category,
            id,
        })?;
        category.name = normalize_name(name)?;
        category.color = normalize_color(color);
        let persisted = self
            .session
            .engine()
            .record_local_update(&self.session.scope(), Entity::Category(category))?;
        into_category_mutation(persisted)
    }

    pub fn delete_category(&self, id: EntityId) -> Result<Mutation<Category>, ServiceError> {
        let persisted = self.session.engine().record_local_delete(
            &self.session.scope(),
            EntityKind::Category,
            id,
        )?;
        into_category_mutation(persisted)
    }

    pub fn get_category(&self, id: EntityId) -> Result<Option<Category>, ServiceError> {
        let scope = self.session.scope();
        match self.session.store().get(EntityKind::Category, id)? {
            Some(Entity::Category(category))
                if category.deleted_at.is_none() && scope.permits(category.owner_id.as_ref()) =>
            {
                Ok(Some(category))
            }
            Some(Entity::Category(_)) | None => Ok(None),
            Some(Entity::Note(_)) => Err(ServiceError::InconsistentState(
                "category lookup returned a note",
            )),
        }
    }

    pub fn list_categories(
        &self,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<ListResult<Category>, ServiceError> {
        let applied_limit = normalize_list_limit(limit);
        let query = EntityListQuery {
            limit: Some(applied_limit),
            offset,
            ..EntityListQuery::active(EntityKind::Category, self.session.scope())
        };
        let items = self
            .session
            .store()
            .list(&query)?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Category(category) => Some(category),
                Entity::Note(_) => None,
            })
            .collect();
        Ok(ListResult {
            items,
            applied_limit,
        })
    }
}

fn normalize_name(name: &str) -> Result<String, ServiceError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidInput(
            "category name cannot be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn normalize_color(color: Option<&str>) -> Option<String> {
    color
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn into_category_mutation(
    persisted: Persisted<LocalMutation>,
) -> Result<Mutation<Category>, ServiceError> {
    let Persisted {
        value: LocalMutation { entity, record },
        cache_degraded,
    } = persisted;
    match entity {
        Entity::Category(category) => Ok(Mutation {
            value: category,
            record,
            cache_degraded,
        }),
        Entity::Note(_) => Err(ServiceError::InconsistentState(
            "category mutation returned a note",
        )),
    }
}
