use std::path::Path;

use anyhow::{anyhow, Context, Result};
use impact_tracker_core::{
    change_set_between, change_set_for_create, change_set_for_destroy, AttributionContext,
    ChangeSet, EdgeSide, Entity, EntityId, EntityKind, JoinId, JoinKind, JoinRecord, NodeId,
    NodeKind, Principal, PrincipalId, Role, Scope, Tracked, TrackedKind, VersionEvent, VersionId,
    VersionRecord,
};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS principals (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('guest','analyst','manager','coordinator','admin')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  relationship_updated_at TEXT,
  relationship_updated_by_id TEXT,
  archived_at TEXT
);

CREATE TABLE IF NOT EXISTS entities (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('actor','category','indicator','measure','recommendation','resource')),
  title TEXT NOT NULL,
  description TEXT,
  reference TEXT,
  published INTEGER NOT NULL DEFAULT 0,
  created_by_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  relationship_updated_at TEXT,
  relationship_updated_by_id TEXT
);

CREATE TABLE IF NOT EXISTS join_records (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN (
    'actor_category','actor_measure','membership','measure_category',
    'measure_indicator','measure_measure','measure_resource',
    'recommendation_category','recommendation_indicator','recommendation_measure',
    'recommendation_recommendation','user_actor','user_category'
  )),
  left_id TEXT NOT NULL,
  right_id TEXT NOT NULL,
  value TEXT,
  created_by_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (kind, left_id, right_id)
);

CREATE TABLE IF NOT EXISTS version_records (
  id TEXT PRIMARY KEY,
  item_type TEXT NOT NULL,
  item_id TEXT NOT NULL,
  event TEXT NOT NULL CHECK (event IN ('create','update','destroy')),
  whodunnit TEXT,
  object_changes TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
CREATE INDEX IF NOT EXISTS idx_entities_created_at ON entities(created_at);
CREATE INDEX IF NOT EXISTS idx_join_records_kind ON join_records(kind);
CREATE INDEX IF NOT EXISTS idx_join_records_left ON join_records(left_id);
CREATE INDEX IF NOT EXISTS idx_join_records_right ON join_records(right_id);
CREATE INDEX IF NOT EXISTS idx_version_records_item ON version_records(item_type, item_id);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Scoped filter for child entities reachable from a parent through a join
/// kind; `child_side` names the join column holding the child entity id.
#[derive(Debug, Clone, Copy)]
pub struct ParentLink {
    pub join_kind: JoinKind,
    pub child_side: EdgeSide,
    pub parent_id: NodeId,
}

pub struct TrackerStore {
    conn: Connection,
}

impl TrackerStore {
    /// Open a SQLite-backed tracker store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or a migration fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one principal row.
    ///
    /// # Errors
    /// Returns an error when the insert fails (including a duplicate email).
    pub fn insert_principal(&mut self, principal: &Principal) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO principals(
                    id, email, name, role, created_at, updated_at,
                    relationship_updated_at, relationship_updated_by_id, archived_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    principal.id.to_string(),
                    principal.email,
                    principal.name,
                    principal.role.as_str(),
                    rfc3339(principal.created_at)?,
                    rfc3339(principal.updated_at)?,
                    optional_rfc3339(principal.relationship_updated_at)?,
                    principal.relationship_updated_by_id.map(|id| id.to_string()),
                    optional_rfc3339(principal.archived_at)?,
                ],
            )
            .context("failed to insert principal")?;
        Ok(())
    }

    /// Look up one principal by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_principal(&self, id: PrincipalId) -> Result<Option<Principal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, role, created_at, updated_at,
                    relationship_updated_at, relationship_updated_by_id, archived_at
             FROM principals WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(principal_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// True when a principal with this email already exists.
    ///
    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn principal_email_exists(&self, email: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM principals WHERE email = ?1)",
            params![email],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// All principals, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_principals(&self) -> Result<Vec<Principal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, role, created_at, updated_at,
                    relationship_updated_at, relationship_updated_by_id, archived_at
             FROM principals
             ORDER BY created_at DESC, id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut principals = Vec::new();
        while let Some(row) = rows.next()? {
            principals.push(principal_from_row(row)?);
        }
        Ok(principals)
    }

    /// Soft-archive one principal; the row is kept for attribution.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn archive_principal(&mut self, id: PrincipalId, at: OffsetDateTime) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE principals SET archived_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![rfc3339(at)?, id.to_string()],
            )
            .context("failed to archive principal")?;
        Ok(affected == 1)
    }

    /// Persist one entity with its create version record, atomically.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn insert_entity(&mut self, entity: &Entity, ctx: &AttributionContext) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO entities(
                id, kind, title, description, reference, published, created_by_id,
                created_at, updated_at, relationship_updated_at, relationship_updated_by_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entity.id.to_string(),
                entity.kind.as_str(),
                entity.title,
                entity.description,
                entity.reference,
                i64::from(entity.published),
                entity.created_by_id.map(|id| id.to_string()),
                rfc3339(entity.created_at)?,
                rfc3339(entity.updated_at)?,
                optional_rfc3339(entity.relationship_updated_at)?,
                entity.relationship_updated_by_id.map(|id| id.to_string()),
            ],
        )
        .context("failed to insert entity")?;

        let changes = change_set_for_create(&entity.audit_snapshot());
        insert_version(&tx, entity, VersionEvent::Create, changes, ctx)?;

        tx.commit().context("failed to commit entity insert")?;
        Ok(())
    }

    /// Fetch one entity through the caller's scope.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
        scope: Scope,
    ) -> Result<Option<Entity>> {
        let sql = format!(
            "SELECT e.id, e.kind, e.title, e.description, e.reference, e.published,
                    e.created_by_id, e.created_at, e.updated_at,
                    e.relationship_updated_at, e.relationship_updated_by_id
             FROM entities e
             WHERE e.kind = ?1 AND e.id = ?2 AND {}",
            scope_condition(scope)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![kind.as_str(), id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(entity_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// List entities of one kind through the caller's scope, newest first,
    /// optionally narrowed to children of a parent record.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entities(
        &self,
        kind: EntityKind,
        scope: Scope,
        parent: Option<ParentLink>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Entity>> {
        let base = "SELECT e.id, e.kind, e.title, e.description, e.reference, e.published,
                    e.created_by_id, e.created_at, e.updated_at,
                    e.relationship_updated_at, e.relationship_updated_by_id
             FROM entities e";

        let mut entities = Vec::new();
        match parent {
            None => {
                let sql = format!(
                    "{base} WHERE e.kind = ?1 AND {} {order}",
                    scope_condition(scope),
                    order = "ORDER BY e.created_at DESC, e.id ASC LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query(params![kind.as_str(), limit, offset])?;
                while let Some(row) = rows.next()? {
                    entities.push(entity_from_row(row)?);
                }
            }
            Some(link) => {
                let (child_column, parent_column) = match link.child_side {
                    EdgeSide::Left => ("left_id", "right_id"),
                    EdgeSide::Right => ("right_id", "left_id"),
                };
                let sql = format!(
                    "{base}
                     JOIN join_records j ON j.kind = ?2 AND j.{child_column} = e.id AND j.{parent_column} = ?3
                     WHERE e.kind = ?1 AND {} {order}",
                    scope_condition(scope),
                    order = "ORDER BY e.created_at DESC, e.id ASC LIMIT ?4 OFFSET ?5"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query(params![
                    kind.as_str(),
                    link.join_kind.as_str(),
                    link.parent_id.to_string(),
                    limit,
                    offset,
                ])?;
                while let Some(row) = rows.next()? {
                    entities.push(entity_from_row(row)?);
                }
            }
        }
        Ok(entities)
    }

    /// Persist an entity update with its field-diff version record,
    /// atomically. An update that changes nothing writes no version.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn update_entity(
        &mut self,
        before: &Entity,
        after: &Entity,
        ctx: &AttributionContext,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "UPDATE entities
             SET title = ?1, description = ?2, reference = ?3, published = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                after.title,
                after.description,
                after.reference,
                i64::from(after.published),
                rfc3339(after.updated_at)?,
                after.id.to_string(),
            ],
        )
        .context("failed to update entity")?;

        let changes = change_set_between(&before.audit_snapshot(), &after.audit_snapshot());
        if !changes.is_empty() {
            insert_version(&tx, after, VersionEvent::Update, changes, ctx)?;
        }

        tx.commit().context("failed to commit entity update")?;
        Ok(())
    }

    /// Delete one entity with its destroy version record, atomically.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn delete_entity(&mut self, entity: &Entity, ctx: &AttributionContext) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute("DELETE FROM entities WHERE id = ?1", params![entity.id.to_string()])
            .context("failed to delete entity")?;

        let changes = change_set_for_destroy(&entity.audit_snapshot());
        insert_version(&tx, entity, VersionEvent::Destroy, changes, ctx)?;

        tx.commit().context("failed to commit entity delete")?;
        Ok(())
    }

    /// True when an entity of this kind and id exists, regardless of scope.
    ///
    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn entity_exists(&self, kind: EntityKind, id: NodeId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE kind = ?1 AND id = ?2)",
            params![kind.as_str(), id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// True when the node a join endpoint refers to exists.
    ///
    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn node_exists(&self, node: NodeKind, id: NodeId) -> Result<bool> {
        match node {
            NodeKind::Entity(kind) => self.entity_exists(kind, id),
            NodeKind::Principal => {
                let exists = self.conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM principals WHERE id = ?1)",
                    params![id.to_string()],
                    |row| row.get::<_, i64>(0),
                )?;
                Ok(exists == 1)
            }
        }
    }

    /// Persist one join record with its create version record, then touch
    /// both endpoints' relationship metadata — all in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails (including
    /// the duplicate-edge uniqueness backstop).
    pub fn insert_join(&mut self, join: &JoinRecord, ctx: &AttributionContext) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO join_records(
                id, kind, left_id, right_id, value, created_by_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                join.id.to_string(),
                join.kind.as_str(),
                join.left_id.to_string(),
                join.right_id.to_string(),
                join.value,
                join.created_by_id.map(|id| id.to_string()),
                rfc3339(join.created_at)?,
                rfc3339(join.updated_at)?,
            ],
        )
        .context("failed to insert join record")?;

        let changes = change_set_for_create(&join.audit_snapshot());
        insert_version(&tx, join, VersionEvent::Create, changes, ctx)?;
        propagate_relationship_change(&tx, join, ctx)?;

        tx.commit().context("failed to commit join insert")?;
        Ok(())
    }

    /// Fetch one join record by kind and id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_join(&self, kind: JoinKind, id: JoinId) -> Result<Option<JoinRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, left_id, right_id, value, created_by_id, created_at, updated_at
             FROM join_records WHERE kind = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(params![kind.as_str(), id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(join_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// List join records of one kind, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_joins(&self, kind: JoinKind, limit: u32, offset: u32) -> Result<Vec<JoinRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, left_id, right_id, value, created_by_id, created_at, updated_at
             FROM join_records WHERE kind = ?1
             ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let mut rows = stmt.query(params![kind.as_str(), limit, offset])?;
        let mut joins = Vec::new();
        while let Some(row) = rows.next()? {
            joins.push(join_from_row(row)?);
        }
        Ok(joins)
    }

    /// True when an edge with these endpoints already exists.
    ///
    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn join_exists(&self, kind: JoinKind, left_id: NodeId, right_id: NodeId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM join_records WHERE kind = ?1 AND left_id = ?2 AND right_id = ?3
             )",
            params![kind.as_str(), left_id.to_string(), right_id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Persist a join update with its diff version record and endpoint
    /// touches, atomically.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn update_join(
        &mut self,
        before: &JoinRecord,
        after: &JoinRecord,
        ctx: &AttributionContext,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "UPDATE join_records SET value = ?1, updated_at = ?2 WHERE id = ?3",
            params![after.value, rfc3339(after.updated_at)?, after.id.to_string()],
        )
        .context("failed to update join record")?;

        let changes = change_set_between(&before.audit_snapshot(), &after.audit_snapshot());
        if !changes.is_empty() {
            insert_version(&tx, after, VersionEvent::Update, changes, ctx)?;
        }
        propagate_relationship_change(&tx, after, ctx)?;

        tx.commit().context("failed to commit join update")?;
        Ok(())
    }

    /// Delete one join record with its destroy version record, then touch
    /// whichever endpoints still exist — all in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn delete_join(&mut self, join: &JoinRecord, ctx: &AttributionContext) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute("DELETE FROM join_records WHERE id = ?1", params![join.id.to_string()])
            .context("failed to delete join record")?;

        let changes = change_set_for_destroy(&join.audit_snapshot());
        insert_version(&tx, join, VersionEvent::Destroy, changes, ctx)?;
        propagate_relationship_change(&tx, join, ctx)?;

        tx.commit().context("failed to commit join delete")?;
        Ok(())
    }

    /// The audit trail for one tracked record, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn versions_for(&self, item_type: TrackedKind, item_id: Ulid) -> Result<Vec<VersionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_type, item_id, event, whodunnit, object_changes, created_at
             FROM version_records
             WHERE item_type = ?1 AND item_id = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let mut rows = stmt.query(params![item_type.as_str(), item_id.to_string()])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(version_from_row(row)?);
        }
        Ok(versions)
    }
}

/// Stamp `relationship_updated_at`/`relationship_updated_by_id` on both
/// endpoints of a join inside the surrounding transaction. Direct column
/// updates: no validation, no version records, no recursion. An endpoint
/// that no longer exists matches zero rows and is skipped.
fn propagate_relationship_change(
    tx: &Transaction<'_>,
    join: &JoinRecord,
    ctx: &AttributionContext,
) -> Result<()> {
    let touched_at = rfc3339(OffsetDateTime::now_utc())?;
    let whodunnit = ctx.whodunnit().map(|id| id.to_string());

    for (node, id) in join.endpoints() {
        let sql = match node {
            NodeKind::Entity(_) => {
                "UPDATE entities SET relationship_updated_at = ?1, relationship_updated_by_id = ?2
                 WHERE id = ?3"
            }
            NodeKind::Principal => {
                "UPDATE principals SET relationship_updated_at = ?1, relationship_updated_by_id = ?2
                 WHERE id = ?3"
            }
        };
        tx.execute(sql, params![touched_at, whodunnit, id.to_string()])
            .context("failed to touch relationship endpoint")?;
    }

    Ok(())
}

fn insert_version<T: Tracked>(
    tx: &Transaction<'_>,
    record: &T,
    event: VersionEvent,
    changes: ChangeSet,
    ctx: &AttributionContext,
) -> Result<()> {
    let version = VersionRecord {
        id: VersionId::new(),
        item_type: record.tracked_kind(),
        item_id: record.tracked_id(),
        event,
        whodunnit: ctx.whodunnit(),
        object_changes: changes,
        created_at: OffsetDateTime::now_utc(),
    };

    tx.execute(
        "INSERT INTO version_records(
            id, item_type, item_id, event, whodunnit, object_changes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            version.id.to_string(),
            version.item_type.as_str(),
            version.item_id.to_string(),
            version.event.as_str(),
            version.whodunnit.map(|id| id.to_string()),
            serde_json::to_string(&version.object_changes)
                .context("failed to serialize object changes")?,
            rfc3339(version.created_at)?,
        ],
    )
    .context("failed to insert version record")?;

    Ok(())
}

fn scope_condition(scope: Scope) -> &'static str {
    match scope {
        Scope::All => "1 = 1",
        Scope::PublishedOnly => "e.published = 1",
        Scope::Nothing => "0 = 1",
    }
}

fn principal_from_row(row: &rusqlite::Row<'_>) -> Result<Principal> {
    let role_raw: String = row.get(3)?;
    Ok(Principal {
        id: parse_principal_id(&row.get::<_, String>(0)?)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: Role::parse(&role_raw).ok_or_else(|| anyhow!("unknown role: {role_raw}"))?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        relationship_updated_at: parse_optional_rfc3339(row.get(6)?)?,
        relationship_updated_by_id: parse_optional_principal_id(row.get(7)?)?,
        archived_at: parse_optional_rfc3339(row.get(8)?)?,
    })
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> Result<Entity> {
    let kind_raw: String = row.get(1)?;
    Ok(Entity {
        id: EntityId(parse_ulid(&row.get::<_, String>(0)?)?),
        kind: EntityKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown entity kind: {kind_raw}"))?,
        title: row.get(2)?,
        description: row.get(3)?,
        reference: row.get(4)?,
        published: row.get::<_, i64>(5)? != 0,
        created_by_id: parse_optional_principal_id(row.get(6)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        relationship_updated_at: parse_optional_rfc3339(row.get(9)?)?,
        relationship_updated_by_id: parse_optional_principal_id(row.get(10)?)?,
    })
}

fn join_from_row(row: &rusqlite::Row<'_>) -> Result<JoinRecord> {
    let kind_raw: String = row.get(1)?;
    Ok(JoinRecord {
        id: JoinId(parse_ulid(&row.get::<_, String>(0)?)?),
        kind: JoinKind::parse(&kind_raw).ok_or_else(|| anyhow!("unknown join kind: {kind_raw}"))?,
        left_id: NodeId(parse_ulid(&row.get::<_, String>(2)?)?),
        right_id: NodeId(parse_ulid(&row.get::<_, String>(3)?)?),
        value: row.get(4)?,
        created_by_id: parse_optional_principal_id(row.get(5)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> Result<VersionRecord> {
    let item_type_raw: String = row.get(1)?;
    let event_raw: String = row.get(3)?;
    let changes_json: String = row.get(5)?;
    Ok(VersionRecord {
        id: VersionId(parse_ulid(&row.get::<_, String>(0)?)?),
        item_type: TrackedKind::parse(&item_type_raw)
            .ok_or_else(|| anyhow!("unknown tracked kind: {item_type_raw}"))?,
        item_id: parse_ulid(&row.get::<_, String>(2)?)?,
        event: VersionEvent::parse(&event_raw)
            .ok_or_else(|| anyhow!("unknown version event: {event_raw}"))?,
        whodunnit: parse_optional_principal_id(row.get(4)?)?,
        object_changes: serde_json::from_str(&changes_json)
            .context("failed to deserialize object changes")?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn optional_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(rfc3339).transpose()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_principal_id(raw: &str) -> Result<PrincipalId> {
    Ok(PrincipalId(parse_ulid(raw)?))
}

fn parse_optional_principal_id(value: Option<String>) -> Result<Option<PrincipalId>> {
    value.as_deref().map(parse_principal_id).transpose()
}
