use std::path::PathBuf;

use impact_tracker_core::{
    apply_entity_attributes, apply_join_attributes, authorize_entity, authorize_join,
    entity_scope, join_endpoints_from_attributes, nested_join, permitted_attributes,
    timestamps_match, validate_entity, validate_join, Action, AttributeMap, AttributionContext,
    Entity, EntityId, EntityKind, JoinId, JoinKind, JoinRecord, Principal, PrincipalId,
    RequestError, Role, TrackedKind, ValidationErrors, VersionRecord,
};
use impact_tracker_store_sqlite::{ParentLink, SchemaStatus, TrackerStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Newest-first pagination window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: DEFAULT_PAGE_SIZE, offset: 0 }
    }
}

/// Path-implied parent filter for nested index requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPrincipal {
    pub email: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// The uniform five-operation boundary over every resource type. Each call
/// composes scope resolution, authorization, the optimistic-concurrency
/// precheck, attribute allow-listing, and transactional persistence.
#[derive(Debug, Clone)]
pub struct TrackerApi {
    db_path: PathBuf,
}

impl TrackerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<TrackerStore, RequestError> {
        let mut store = TrackerStore::open(&self.db_path).map_err(storage)?;
        store.migrate().map_err(storage)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns [`RequestError::Storage`] when the database cannot be opened
    /// or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, RequestError> {
        let store = TrackerStore::open(&self.db_path).map_err(storage)?;
        store.schema_status().map_err(storage)
    }

    /// Apply pending migrations, or report planned versions in dry-run mode.
    ///
    /// # Errors
    /// Returns [`RequestError::Storage`] when planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, RequestError> {
        let mut store = TrackerStore::open(&self.db_path).map_err(storage)?;
        let before = store.schema_status().map_err(storage)?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate().map_err(storage)?;
        let after = store.schema_status().map_err(storage)?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Resolve a principal by id for request binding. No policy applies;
    /// the caller decides how to treat unknown or archived principals.
    ///
    /// # Errors
    /// Returns [`RequestError::Storage`] when the lookup fails.
    pub fn principal_by_id(&self, id: PrincipalId) -> Result<Option<Principal>, RequestError> {
        let store = self.open_store()?;
        store.get_principal(id).map_err(storage)
    }

    /// Register a new principal. The requested role is honored only when an
    /// admin is acting; self-signup always lands as `guest`.
    ///
    /// # Errors
    /// Returns [`RequestError::Validation`] for blank or duplicate emails,
    /// or [`RequestError::Storage`] on persistence failure.
    pub fn register_principal(
        &self,
        ctx: &AttributionContext,
        input: NewPrincipal,
    ) -> Result<Principal, RequestError> {
        let mut store = self.open_store()?;

        let mut errors = ValidationErrors::new();
        if input.email.trim().is_empty() {
            errors.add("email", "can't be blank");
        } else if store.principal_email_exists(&input.email).map_err(storage)? {
            errors.add("email", "has already been taken");
        }
        if input.name.trim().is_empty() {
            errors.add("name", "can't be blank");
        }
        errors.into_result()?;

        let role = match ctx.principal().map(|principal| principal.role) {
            Some(Role::Admin) => input.role,
            _ => Role::Guest,
        };

        let now = OffsetDateTime::now_utc();
        let principal = Principal {
            id: PrincipalId::new(),
            email: input.email,
            name: input.name,
            role,
            created_at: now,
            updated_at: now,
            relationship_updated_at: None,
            relationship_updated_by_id: None,
            archived_at: None,
        };
        store.insert_principal(&principal).map_err(storage)?;
        Ok(principal)
    }

    /// All principals, admin only.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Forbidden` below admin,
    /// `Storage` on read failure.
    pub fn list_principals(
        &self,
        ctx: &AttributionContext,
    ) -> Result<Vec<Principal>, RequestError> {
        require_admin(ctx)?;
        let store = self.open_store()?;
        store.list_principals().map_err(storage)
    }

    /// Soft-archive one principal, admin only.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Forbidden` below admin,
    /// `NotFound` for an unknown id, `Storage` on write failure.
    pub fn archive_principal(
        &self,
        ctx: &AttributionContext,
        id: PrincipalId,
    ) -> Result<(), RequestError> {
        require_admin(ctx)?;
        let mut store = self.open_store()?;
        let archived =
            store.archive_principal(id, OffsetDateTime::now_utc()).map_err(storage)?;
        if archived {
            Ok(())
        } else {
            Err(RequestError::NotFound)
        }
    }

    /// List entities of one kind through the caller's scope, newest first,
    /// optionally narrowed to the children of a parent record.
    ///
    /// # Errors
    /// `Forbidden` when the scope admits nothing, `NotFound` for an
    /// unresolvable parent, `Storage` on read failure.
    pub fn list_entities(
        &self,
        ctx: &AttributionContext,
        kind: EntityKind,
        parent: Option<ParentRef>,
        page: Page,
    ) -> Result<Vec<Entity>, RequestError> {
        let principal = ctx.principal();
        authorize_entity(principal, Action::List, kind, None)?;
        let store = self.open_store()?;

        let link = match parent {
            None => None,
            Some(parent_ref) => {
                let (join_kind, child_side) = nested_join(parent_ref.kind, kind)
                    .ok_or(RequestError::NotFound)?;
                let parent_visible = store
                    .get_entity(
                        parent_ref.kind,
                        parent_ref.id,
                        entity_scope(principal, parent_ref.kind),
                    )
                    .map_err(storage)?;
                if parent_visible.is_none() {
                    return Err(RequestError::NotFound);
                }
                Some(ParentLink { join_kind, child_side, parent_id: parent_ref.id.into() })
            }
        };

        store
            .list_entities(kind, entity_scope(principal, kind), link, page.limit, page.offset)
            .map_err(storage)
    }

    /// Fetch one entity through the caller's scope.
    ///
    /// # Errors
    /// `Forbidden` when the scope admits nothing, `NotFound` when the id is
    /// not visible, `Storage` on read failure.
    pub fn get_entity(
        &self,
        ctx: &AttributionContext,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<Entity, RequestError> {
        let principal = ctx.principal();
        authorize_entity(principal, Action::Show, kind, None)?;
        let store = self.open_store()?;
        let entity = store
            .get_entity(kind, id, entity_scope(principal, kind))
            .map_err(storage)?
            .ok_or(RequestError::NotFound)?;
        authorize_entity(principal, Action::Show, kind, Some(&entity))?;
        Ok(entity)
    }

    /// Create one entity from allow-listed attributes.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Forbidden` for read-only roles,
    /// `Validation` for domain errors, `Storage` on write failure.
    pub fn create_entity(
        &self,
        ctx: &AttributionContext,
        kind: EntityKind,
        attributes: &AttributeMap,
    ) -> Result<Entity, RequestError> {
        let principal = ctx.principal();
        let now = OffsetDateTime::now_utc();
        let mut entity = Entity {
            id: EntityId::new(),
            kind,
            title: String::new(),
            description: None,
            reference: None,
            published: false,
            created_by_id: ctx.whodunnit(),
            created_at: now,
            updated_at: now,
            relationship_updated_at: None,
            relationship_updated_by_id: None,
        };

        let mut errors = ValidationErrors::new();
        let filtered = permitted_attributes(attributes, kind.permitted_attributes());
        apply_entity_attributes(&mut entity, &filtered, &mut errors);

        authorize_entity(principal, Action::Create, kind, Some(&entity))?;

        errors.merge(validate_entity(&entity));
        errors.into_result()?;

        let mut store = self.open_store()?;
        store.insert_entity(&entity, ctx).map_err(storage)?;
        Ok(entity)
    }

    /// Update one entity: scope resolution, resolved-record authorization,
    /// optimistic-concurrency precheck, then allow-listed application.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `NotFound` outside the scope,
    /// `Forbidden` for read-only roles, `Conflict` on a stale `updated_at`,
    /// `Validation` for domain errors, `Storage` on write failure.
    pub fn update_entity(
        &self,
        ctx: &AttributionContext,
        kind: EntityKind,
        id: EntityId,
        attributes: &AttributeMap,
    ) -> Result<Entity, RequestError> {
        let principal = ctx.principal().ok_or(RequestError::Unauthorized)?;
        let mut store = self.open_store()?;

        let current = store
            .get_entity(kind, id, entity_scope(Some(principal), kind))
            .map_err(storage)?
            .ok_or(RequestError::NotFound)?;
        authorize_entity(Some(principal), Action::Update, kind, Some(&current))?;

        concurrency_precheck(attributes, current.updated_at)?;

        let mut after = current.clone();
        let mut errors = ValidationErrors::new();
        let filtered = permitted_attributes(attributes, kind.permitted_attributes());
        apply_entity_attributes(&mut after, &filtered, &mut errors);
        errors.merge(validate_entity(&after));
        errors.into_result()?;

        after.updated_at = OffsetDateTime::now_utc();
        store.update_entity(&current, &after, ctx).map_err(storage)?;
        Ok(after)
    }

    /// Destroy one entity; ownership decides for manager-grade roles.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `NotFound` outside the scope (a
    /// repeated destroy lands here), `Forbidden` for non-owners below admin,
    /// `Storage` on write failure.
    pub fn delete_entity(
        &self,
        ctx: &AttributionContext,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<(), RequestError> {
        let principal = ctx.principal().ok_or(RequestError::Unauthorized)?;
        let mut store = self.open_store()?;

        let entity = store
            .get_entity(kind, id, entity_scope(Some(principal), kind))
            .map_err(storage)?
            .ok_or(RequestError::NotFound)?;
        authorize_entity(Some(principal), Action::Destroy, kind, Some(&entity))?;

        store.delete_entity(&entity, ctx).map_err(storage)?;
        Ok(())
    }

    /// List join records of one kind, newest first.
    ///
    /// # Errors
    /// `Forbidden` outside the join scope, `Storage` on read failure.
    pub fn list_joins(
        &self,
        ctx: &AttributionContext,
        kind: JoinKind,
        page: Page,
    ) -> Result<Vec<JoinRecord>, RequestError> {
        authorize_join(ctx.principal(), Action::List, None)?;
        let store = self.open_store()?;
        store.list_joins(kind, page.limit, page.offset).map_err(storage)
    }

    /// Fetch one join record.
    ///
    /// # Errors
    /// `Forbidden` outside the join scope, `NotFound` for an unknown id,
    /// `Storage` on read failure.
    pub fn get_join(
        &self,
        ctx: &AttributionContext,
        kind: JoinKind,
        id: JoinId,
    ) -> Result<JoinRecord, RequestError> {
        authorize_join(ctx.principal(), Action::Show, None)?;
        let store = self.open_store()?;
        let join = store.get_join(kind, id).map_err(storage)?.ok_or(RequestError::NotFound)?;
        authorize_join(ctx.principal(), Action::Show, Some(&join))?;
        Ok(join)
    }

    /// Create one join record: endpoint extraction, self-edge and existence
    /// validation, uniqueness probe, then transactional persistence with
    /// version record and relationship propagation.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Forbidden` for read-only roles,
    /// `Validation` for endpoint errors, `Storage` on write failure.
    pub fn create_join(
        &self,
        ctx: &AttributionContext,
        kind: JoinKind,
        attributes: &AttributeMap,
    ) -> Result<JoinRecord, RequestError> {
        authorize_join(ctx.principal(), Action::Create, None)?;
        let mut store = self.open_store()?;

        let endpoints = match join_endpoints_from_attributes(kind, attributes) {
            Ok(endpoints) => endpoints,
            Err(errors) => return Err(RequestError::Validation(errors)),
        };

        let now = OffsetDateTime::now_utc();
        let join = JoinRecord {
            id: JoinId::new(),
            kind,
            left_id: endpoints.left_id,
            right_id: endpoints.right_id,
            value: endpoints.value,
            created_by_id: ctx.whodunnit(),
            created_at: now,
            updated_at: now,
        };

        let descriptor = kind.descriptor();
        let mut errors = validate_join(&join);
        if !store.node_exists(descriptor.left_node, join.left_id).map_err(storage)? {
            errors.add(descriptor.left_field, "must exist");
        }
        if !store.node_exists(descriptor.right_node, join.right_id).map_err(storage)? {
            errors.add(descriptor.right_field, "must exist");
        }
        if errors.is_empty()
            && store.join_exists(kind, join.left_id, join.right_id).map_err(storage)?
        {
            errors.add(descriptor.left_field, "has already been taken");
        }
        errors.into_result()?;

        store.insert_join(&join, ctx).map_err(storage)?;
        Ok(join)
    }

    /// Update one join record. Only value-bearing kinds expose this; for
    /// every other kind the operation is not routable.
    ///
    /// # Errors
    /// `NotFound` for non-updatable kinds or unknown ids, `Unauthorized`
    /// without a principal, `Forbidden` for read-only roles, `Conflict` on
    /// a stale `updated_at`, `Validation` for domain errors, `Storage` on
    /// write failure.
    pub fn update_join(
        &self,
        ctx: &AttributionContext,
        kind: JoinKind,
        id: JoinId,
        attributes: &AttributeMap,
    ) -> Result<JoinRecord, RequestError> {
        if !kind.descriptor().update_permitted {
            return Err(RequestError::NotFound);
        }
        let principal = ctx.principal().ok_or(RequestError::Unauthorized)?;
        let mut store = self.open_store()?;

        let current = store.get_join(kind, id).map_err(storage)?.ok_or(RequestError::NotFound)?;
        authorize_join(Some(principal), Action::Update, Some(&current))?;

        concurrency_precheck(attributes, current.updated_at)?;

        let mut after = current.clone();
        let mut errors = ValidationErrors::new();
        let filtered = permitted_attributes(attributes, &["value"]);
        apply_join_attributes(&mut after, &filtered, &mut errors);
        errors.into_result()?;

        after.updated_at = OffsetDateTime::now_utc();
        store.update_join(&current, &after, ctx).map_err(storage)?;
        Ok(after)
    }

    /// Destroy one join record; ownership decides for manager-grade roles.
    /// Both endpoints are touched even though the edge itself is gone.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `NotFound` for an unknown id (a
    /// repeated destroy lands here), `Forbidden` for non-owners below admin,
    /// `Storage` on write failure.
    pub fn delete_join(
        &self,
        ctx: &AttributionContext,
        kind: JoinKind,
        id: JoinId,
    ) -> Result<(), RequestError> {
        let principal = ctx.principal().ok_or(RequestError::Unauthorized)?;
        let mut store = self.open_store()?;

        let join = store.get_join(kind, id).map_err(storage)?.ok_or(RequestError::NotFound)?;
        authorize_join(Some(principal), Action::Destroy, Some(&join))?;

        store.delete_join(&join, ctx).map_err(storage)?;
        Ok(())
    }

    /// The audit trail for one tracked record, admin only, oldest first.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Forbidden` below admin,
    /// `Storage` on read failure.
    pub fn versions(
        &self,
        ctx: &AttributionContext,
        item_type: TrackedKind,
        item_id: Ulid,
    ) -> Result<Vec<VersionRecord>, RequestError> {
        require_admin(ctx)?;
        let store = self.open_store()?;
        store.versions_for(item_type, item_id).map_err(storage)
    }
}

fn require_admin(ctx: &AttributionContext) -> Result<(), RequestError> {
    let principal = ctx.principal().ok_or(RequestError::Unauthorized)?;
    if principal.role == Role::Admin {
        Ok(())
    } else {
        Err(RequestError::Forbidden)
    }
}

/// Reject a stale update before any attribute is applied. The caller's
/// comparison value rides in the raw payload as `updated_at` and is matched
/// at whole-second precision.
fn concurrency_precheck(
    attributes: &AttributeMap,
    current_updated_at: OffsetDateTime,
) -> Result<(), RequestError> {
    let Some(raw) = attributes.get("updated_at") else {
        return Ok(());
    };

    let Value::String(text) = raw else {
        let mut errors = ValidationErrors::new();
        errors.add("updated_at", "is invalid");
        return Err(RequestError::Validation(errors));
    };

    let expected =
        OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339).map_err(
            |_| {
                let mut errors = ValidationErrors::new();
                errors.add("updated_at", "is invalid");
                RequestError::Validation(errors)
            },
        )?;

    if timestamps_match(expected, current_updated_at) {
        Ok(())
    } else {
        Err(RequestError::Conflict)
    }
}

fn storage(err: anyhow::Error) -> RequestError {
    RequestError::Storage(err.to_string())
}
