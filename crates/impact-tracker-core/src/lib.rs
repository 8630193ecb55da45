use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Field-level validation messages, keyed by attribute name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: &str) {
        self.0.entry(field.to_string()).or_default().push(message.to_string());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn messages(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    /// Convert accumulated messages into a request outcome.
    ///
    /// # Errors
    /// Returns [`RequestError::Validation`] when any message was recorded.
    pub fn into_result(self) -> Result<(), RequestError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(RequestError::Validation(self))
        }
    }
}

/// Terminal outcomes of one resource request.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("authentication required")]
    Unauthorized,
    #[error("action not allowed")]
    Forbidden,
    #[error("record not found")]
    NotFound,
    #[error("record outdated")]
    Conflict,
    #[error("validation failed")]
    Validation(ValidationErrors),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PrincipalId(pub Ulid);

impl PrincipalId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub Ulid);

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JoinId(pub Ulid);

impl JoinId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for JoinId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JoinId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionId(pub Ulid);

impl VersionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one relationship endpoint: an entity or a principal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub Ulid);

impl NodeId {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EntityId> for NodeId {
    fn from(value: EntityId) -> Self {
        Self(value.0)
    }
}

impl From<PrincipalId> for NodeId {
    fn from(value: PrincipalId) -> Self {
        Self(value.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Analyst,
    Manager,
    Coordinator,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Analyst => "analyst",
            Self::Manager => "manager",
            Self::Coordinator => "coordinator",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "guest" => Some(Self::Guest),
            "analyst" => Some(Self::Analyst),
            "manager" => Some(Self::Manager),
            "coordinator" => Some(Self::Coordinator),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn all() -> [Self; 5] {
        [Self::Guest, Self::Analyst, Self::Manager, Self::Coordinator, Self::Admin]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Actor,
    Category,
    Indicator,
    Measure,
    Recommendation,
    Resource,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Category => "category",
            Self::Indicator => "indicator",
            Self::Measure => "measure",
            Self::Recommendation => "recommendation",
            Self::Resource => "resource",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "actor" => Some(Self::Actor),
            "category" => Some(Self::Category),
            "indicator" => Some(Self::Indicator),
            "measure" => Some(Self::Measure),
            "recommendation" => Some(Self::Recommendation),
            "resource" => Some(Self::Resource),
            _ => None,
        }
    }

    /// Plural path segment this kind is served under.
    #[must_use]
    pub fn resource_name(self) -> &'static str {
        match self {
            Self::Actor => "actors",
            Self::Category => "categories",
            Self::Indicator => "indicators",
            Self::Measure => "measures",
            Self::Recommendation => "recommendations",
            Self::Resource => "resources",
        }
    }

    #[must_use]
    pub fn from_resource_name(value: &str) -> Option<Self> {
        Self::all().into_iter().find(|kind| kind.resource_name() == value)
    }

    /// Attributes a caller may set on this kind; everything else is dropped.
    #[must_use]
    pub fn permitted_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Actor | Self::Category => &["title", "description", "published"],
            Self::Indicator | Self::Measure | Self::Recommendation | Self::Resource => {
                &["title", "description", "reference", "published"]
            }
        }
    }

    /// Reference data is visible to unauthenticated readers once published.
    #[must_use]
    pub fn is_reference_data(self) -> bool {
        matches!(self, Self::Category | Self::Indicator | Self::Measure | Self::Recommendation)
    }

    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::Actor,
            Self::Category,
            Self::Indicator,
            Self::Measure,
            Self::Recommendation,
            Self::Resource,
        ]
    }
}

/// The node family an edge endpoint points into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Principal,
    Entity(EntityKind),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    ActorCategory,
    ActorMeasure,
    Membership,
    MeasureCategory,
    MeasureIndicator,
    MeasureMeasure,
    MeasureResource,
    RecommendationCategory,
    RecommendationIndicator,
    RecommendationMeasure,
    RecommendationRecommendation,
    UserActor,
    UserCategory,
}

/// Static shape of one join type: endpoint attributes, endpoint node
/// families, and the behavior flags the generic endpoint dispatches on.
#[derive(Debug, Clone, Copy)]
pub struct JoinDescriptor {
    pub left_field: &'static str,
    pub right_field: &'static str,
    pub left_node: NodeKind,
    pub right_node: NodeKind,
    pub has_value: bool,
    pub update_permitted: bool,
    pub forbid_self_edge: bool,
}

impl JoinKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActorCategory => "actor_category",
            Self::ActorMeasure => "actor_measure",
            Self::Membership => "membership",
            Self::MeasureCategory => "measure_category",
            Self::MeasureIndicator => "measure_indicator",
            Self::MeasureMeasure => "measure_measure",
            Self::MeasureResource => "measure_resource",
            Self::RecommendationCategory => "recommendation_category",
            Self::RecommendationIndicator => "recommendation_indicator",
            Self::RecommendationMeasure => "recommendation_measure",
            Self::RecommendationRecommendation => "recommendation_recommendation",
            Self::UserActor => "user_actor",
            Self::UserCategory => "user_category",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::all().into_iter().find(|kind| kind.as_str() == value)
    }

    /// Plural path segment this kind is served under.
    #[must_use]
    pub fn resource_name(self) -> &'static str {
        match self {
            Self::ActorCategory => "actor_categories",
            Self::ActorMeasure => "actor_measures",
            Self::Membership => "memberships",
            Self::MeasureCategory => "measure_categories",
            Self::MeasureIndicator => "measure_indicators",
            Self::MeasureMeasure => "measure_measures",
            Self::MeasureResource => "measure_resources",
            Self::RecommendationCategory => "recommendation_categories",
            Self::RecommendationIndicator => "recommendation_indicators",
            Self::RecommendationMeasure => "recommendation_measures",
            Self::RecommendationRecommendation => "recommendation_recommendations",
            Self::UserActor => "user_actors",
            Self::UserCategory => "user_categories",
        }
    }

    #[must_use]
    pub fn from_resource_name(value: &str) -> Option<Self> {
        Self::all().into_iter().find(|kind| kind.resource_name() == value)
    }

    #[must_use]
    pub fn descriptor(self) -> JoinDescriptor {
        let entity = |kind| NodeKind::Entity(kind);
        match self {
            Self::ActorCategory => JoinDescriptor {
                left_field: "actor_id",
                right_field: "category_id",
                left_node: entity(EntityKind::Actor),
                right_node: entity(EntityKind::Category),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::ActorMeasure => JoinDescriptor {
                left_field: "actor_id",
                right_field: "measure_id",
                left_node: entity(EntityKind::Actor),
                right_node: entity(EntityKind::Measure),
                has_value: true,
                update_permitted: true,
                forbid_self_edge: false,
            },
            Self::Membership => JoinDescriptor {
                left_field: "member_id",
                right_field: "memberof_id",
                left_node: entity(EntityKind::Actor),
                right_node: entity(EntityKind::Actor),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: true,
            },
            Self::MeasureCategory => JoinDescriptor {
                left_field: "measure_id",
                right_field: "category_id",
                left_node: entity(EntityKind::Measure),
                right_node: entity(EntityKind::Category),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::MeasureIndicator => JoinDescriptor {
                left_field: "measure_id",
                right_field: "indicator_id",
                left_node: entity(EntityKind::Measure),
                right_node: entity(EntityKind::Indicator),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::MeasureMeasure => JoinDescriptor {
                left_field: "measure_id",
                right_field: "other_measure_id",
                left_node: entity(EntityKind::Measure),
                right_node: entity(EntityKind::Measure),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: true,
            },
            Self::MeasureResource => JoinDescriptor {
                left_field: "measure_id",
                right_field: "resource_id",
                left_node: entity(EntityKind::Measure),
                right_node: entity(EntityKind::Resource),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::RecommendationCategory => JoinDescriptor {
                left_field: "recommendation_id",
                right_field: "category_id",
                left_node: entity(EntityKind::Recommendation),
                right_node: entity(EntityKind::Category),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::RecommendationIndicator => JoinDescriptor {
                left_field: "recommendation_id",
                right_field: "indicator_id",
                left_node: entity(EntityKind::Recommendation),
                right_node: entity(EntityKind::Indicator),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::RecommendationMeasure => JoinDescriptor {
                left_field: "recommendation_id",
                right_field: "measure_id",
                left_node: entity(EntityKind::Recommendation),
                right_node: entity(EntityKind::Measure),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::RecommendationRecommendation => JoinDescriptor {
                left_field: "recommendation_id",
                right_field: "other_recommendation_id",
                left_node: entity(EntityKind::Recommendation),
                right_node: entity(EntityKind::Recommendation),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: true,
            },
            Self::UserActor => JoinDescriptor {
                left_field: "user_id",
                right_field: "actor_id",
                left_node: NodeKind::Principal,
                right_node: entity(EntityKind::Actor),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
            Self::UserCategory => JoinDescriptor {
                left_field: "user_id",
                right_field: "category_id",
                left_node: NodeKind::Principal,
                right_node: entity(EntityKind::Category),
                has_value: false,
                update_permitted: false,
                forbid_self_edge: false,
            },
        }
    }

    #[must_use]
    pub fn all() -> [Self; 13] {
        [
            Self::ActorCategory,
            Self::ActorMeasure,
            Self::Membership,
            Self::MeasureCategory,
            Self::MeasureIndicator,
            Self::MeasureMeasure,
            Self::MeasureResource,
            Self::RecommendationCategory,
            Self::RecommendationIndicator,
            Self::RecommendationMeasure,
            Self::RecommendationRecommendation,
            Self::UserActor,
            Self::UserCategory,
        ]
    }
}

/// Which endpoint of a join a given entity occupies.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EdgeSide {
    Left,
    Right,
}

/// Resolve the join kind that links `child` entities under a `parent`
/// entity, and the side the child occupies. Kinds whose two endpoints are
/// the same node family are skipped as ambiguous.
#[must_use]
pub fn nested_join(parent: EntityKind, child: EntityKind) -> Option<(JoinKind, EdgeSide)> {
    for kind in JoinKind::all() {
        let descriptor = kind.descriptor();
        if descriptor.left_node == descriptor.right_node {
            continue;
        }
        if descriptor.left_node == NodeKind::Entity(child)
            && descriptor.right_node == NodeKind::Entity(parent)
        {
            return Some((kind, EdgeSide::Left));
        }
        if descriptor.left_node == NodeKind::Entity(parent)
            && descriptor.right_node == NodeKind::Entity(child)
        {
            return Some((kind, EdgeSide::Right));
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub id: PrincipalId,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub relationship_updated_at: Option<OffsetDateTime>,
    pub relationship_updated_by_id: Option<PrincipalId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
}

impl Principal {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub title: String,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub published: bool,
    pub created_by_id: Option<PrincipalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub relationship_updated_at: Option<OffsetDateTime>,
    pub relationship_updated_by_id: Option<PrincipalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRecord {
    pub id: JoinId,
    pub kind: JoinKind,
    pub left_id: NodeId,
    pub right_id: NodeId,
    pub value: Option<String>,
    pub created_by_id: Option<PrincipalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl JoinRecord {
    /// The two endpoints to touch when this edge changes.
    #[must_use]
    pub fn endpoints(&self) -> [(NodeKind, NodeId); 2] {
        let descriptor = self.kind.descriptor();
        [(descriptor.left_node, self.left_id), (descriptor.right_node, self.right_id)]
    }
}

/// Record types the audit subsystem tracks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum TrackedKind {
    Entity(EntityKind),
    Join(JoinKind),
}

impl TrackedKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity(kind) => kind.as_str(),
            Self::Join(kind) => kind.as_str(),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if let Some(kind) = EntityKind::parse(value) {
            return Some(Self::Entity(kind));
        }
        JoinKind::parse(value).map(Self::Join)
    }
}

impl From<TrackedKind> for String {
    fn from(value: TrackedKind) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for TrackedKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown tracked kind: {value}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionEvent {
    Create,
    Update,
    Destroy,
}

impl VersionEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// Field diffs as `name -> (old, new)` pairs, serialized `[old, new]`.
pub type ChangeSet = BTreeMap<String, (Value, Value)>;

/// One immutable audit entry describing one mutation of a tracked record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionRecord {
    pub id: VersionId,
    pub item_type: TrackedKind,
    pub item_id: Ulid,
    pub event: VersionEvent,
    pub whodunnit: Option<PrincipalId>,
    pub object_changes: ChangeSet,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Capability: a record that knows who created it.
pub trait Owned {
    fn created_by(&self) -> Option<PrincipalId>;
}

impl Owned for Entity {
    fn created_by(&self) -> Option<PrincipalId> {
        self.created_by_id
    }
}

impl Owned for JoinRecord {
    fn created_by(&self) -> Option<PrincipalId> {
        self.created_by_id
    }
}

/// Capability: a record whose mutations produce version records.
pub trait Tracked {
    fn tracked_kind(&self) -> TrackedKind;
    fn tracked_id(&self) -> Ulid;
    /// Auditable field values; the diff in each version record is computed
    /// from snapshots taken before and after a mutation.
    fn audit_snapshot(&self) -> BTreeMap<String, Value>;
}

impl Tracked for Entity {
    fn tracked_kind(&self) -> TrackedKind {
        TrackedKind::Entity(self.kind)
    }

    fn tracked_id(&self) -> Ulid {
        self.id.0
    }

    fn audit_snapshot(&self) -> BTreeMap<String, Value> {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("title".to_string(), Value::String(self.title.clone()));
        snapshot.insert(
            "description".to_string(),
            self.description.clone().map_or(Value::Null, Value::String),
        );
        if self.kind.permitted_attributes().contains(&"reference") {
            snapshot.insert(
                "reference".to_string(),
                self.reference.clone().map_or(Value::Null, Value::String),
            );
        }
        snapshot.insert("published".to_string(), Value::Bool(self.published));
        snapshot.insert(
            "created_by_id".to_string(),
            self.created_by_id.map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        snapshot
    }
}

impl Tracked for JoinRecord {
    fn tracked_kind(&self) -> TrackedKind {
        TrackedKind::Join(self.kind)
    }

    fn tracked_id(&self) -> Ulid {
        self.id.0
    }

    fn audit_snapshot(&self) -> BTreeMap<String, Value> {
        let descriptor = self.kind.descriptor();
        let mut snapshot = BTreeMap::new();
        snapshot
            .insert(descriptor.left_field.to_string(), Value::String(self.left_id.to_string()));
        snapshot
            .insert(descriptor.right_field.to_string(), Value::String(self.right_id.to_string()));
        if descriptor.has_value {
            snapshot
                .insert("value".to_string(), self.value.clone().map_or(Value::Null, Value::String));
        }
        snapshot.insert(
            "created_by_id".to_string(),
            self.created_by_id.map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        snapshot
    }
}

/// Diff for a freshly created record: `null -> value` per populated field.
#[must_use]
pub fn change_set_for_create(snapshot: &BTreeMap<String, Value>) -> ChangeSet {
    snapshot
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(field, value)| (field.clone(), (Value::Null, value.clone())))
        .collect()
}

/// Diff between two snapshots of the same record: changed fields only.
#[must_use]
pub fn change_set_between(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (field, new_value) in after {
        let old_value = before.get(field).cloned().unwrap_or(Value::Null);
        if old_value != *new_value {
            changes.insert(field.clone(), (old_value, new_value.clone()));
        }
    }
    for (field, old_value) in before {
        if !after.contains_key(field) && !old_value.is_null() {
            changes.insert(field.clone(), (old_value.clone(), Value::Null));
        }
    }
    changes
}

/// Diff for a destroyed record: `value -> null` per populated field.
#[must_use]
pub fn change_set_for_destroy(snapshot: &BTreeMap<String, Value>) -> ChangeSet {
    snapshot
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(field, value)| (field.clone(), (value.clone(), Value::Null)))
        .collect()
}

/// Per-request identity under which mutations are attributed. Constructed
/// once at the boundary and threaded explicitly; nothing reads it from
/// global state.
#[derive(Debug, Clone)]
pub struct AttributionContext {
    pub request_id: String,
    principal: Option<Principal>,
}

impl AttributionContext {
    #[must_use]
    pub fn anonymous() -> Self {
        Self { request_id: Ulid::new().to_string(), principal: None }
    }

    #[must_use]
    pub fn acting_as(principal: Principal) -> Self {
        Self { request_id: Ulid::new().to_string(), principal: Some(principal) }
    }

    /// The acting principal. Archived principals carry no authority.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref().filter(|principal| !principal.is_archived())
    }

    #[must_use]
    pub fn whodunnit(&self) -> Option<PrincipalId> {
        self.principal().map(|principal| principal.id)
    }
}

/// The filtered view of a collection a principal may see.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Scope {
    All,
    PublishedOnly,
    Nothing,
}

impl Scope {
    #[must_use]
    pub fn permits(self, entity: &Entity) -> bool {
        match self {
            Self::All => true,
            Self::PublishedOnly => entity.published,
            Self::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Action {
    List,
    Show,
    Create,
    Update,
    Destroy,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Show => "show",
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }

    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Destroy)
    }
}

/// Visible subset of an entity collection for a principal.
#[must_use]
pub fn entity_scope(principal: Option<&Principal>, kind: EntityKind) -> Scope {
    match principal.map(|p| p.role) {
        None | Some(Role::Guest) => {
            if kind.is_reference_data() {
                Scope::PublishedOnly
            } else {
                Scope::Nothing
            }
        }
        Some(_) => Scope::All,
    }
}

/// Visible subset of join-record collections for a principal.
#[must_use]
pub fn join_scope(principal: Option<&Principal>) -> Scope {
    match principal.map(|p| p.role) {
        None | Some(Role::Guest) => Scope::Nothing,
        Some(_) => Scope::All,
    }
}

fn authorize_mutation(
    principal: Option<&Principal>,
    action: Action,
    owner: Option<PrincipalId>,
) -> Result<(), RequestError> {
    let Some(principal) = principal else {
        return Err(RequestError::Unauthorized);
    };

    match principal.role {
        Role::Guest | Role::Analyst => Err(RequestError::Forbidden),
        Role::Admin => Ok(()),
        Role::Manager | Role::Coordinator => match action {
            Action::Create | Action::Update => Ok(()),
            // Destroy is always decided against the resolved record.
            Action::Destroy => {
                if owner == Some(principal.id) {
                    Ok(())
                } else {
                    Err(RequestError::Forbidden)
                }
            }
            Action::List | Action::Show => Ok(()),
        },
    }
}

/// Authorize one action against an entity collection or resolved record.
///
/// # Errors
/// `Unauthorized` when a mutation arrives without a principal; `Forbidden`
/// when the principal's role (or, for destroy, non-ownership) denies it.
pub fn authorize_entity(
    principal: Option<&Principal>,
    action: Action,
    kind: EntityKind,
    target: Option<&Entity>,
) -> Result<(), RequestError> {
    if action.is_mutation() {
        return authorize_mutation(principal, action, target.and_then(Owned::created_by));
    }

    if entity_scope(principal, kind) == Scope::Nothing {
        return Err(RequestError::Forbidden);
    }
    Ok(())
}

/// Authorize one action against a join-record collection or resolved record.
///
/// # Errors
/// `Unauthorized` when a mutation arrives without a principal; `Forbidden`
/// when the principal's role (or, for destroy, non-ownership) denies it,
/// and for all reads outside the join scope.
pub fn authorize_join(
    principal: Option<&Principal>,
    action: Action,
    target: Option<&JoinRecord>,
) -> Result<(), RequestError> {
    if action.is_mutation() {
        return authorize_mutation(principal, action, target.and_then(Owned::created_by));
    }

    if join_scope(principal) == Scope::Nothing {
        return Err(RequestError::Forbidden);
    }
    Ok(())
}

/// Free-form attributes supplied by a caller, before allow-listing.
pub type AttributeMap = BTreeMap<String, Value>;

/// Retain only the attributes named by the allow-list; everything else is
/// silently dropped.
#[must_use]
pub fn permitted_attributes(attributes: &AttributeMap, allowed: &[&str]) -> AttributeMap {
    attributes
        .iter()
        .filter(|(key, _)| allowed.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn string_attribute(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Apply allow-listed attributes to an entity, collecting type errors.
pub fn apply_entity_attributes(
    entity: &mut Entity,
    attributes: &AttributeMap,
    errors: &mut ValidationErrors,
) {
    for (field, value) in attributes {
        match field.as_str() {
            "title" => match value {
                Value::String(text) => entity.title = text.clone(),
                _ => errors.add("title", "is invalid"),
            },
            "description" => match value {
                Value::String(text) => entity.description = Some(text.clone()),
                Value::Null => entity.description = None,
                _ => errors.add("description", "is invalid"),
            },
            "reference" => match value {
                Value::String(text) => entity.reference = Some(text.clone()),
                Value::Null => entity.reference = None,
                _ => errors.add("reference", "is invalid"),
            },
            "published" => match value {
                Value::Bool(flag) => entity.published = *flag,
                _ => errors.add("published", "is invalid"),
            },
            _ => {}
        }
    }
}

/// Apply allow-listed attributes to a join record (value-bearing kinds).
pub fn apply_join_attributes(
    join: &mut JoinRecord,
    attributes: &AttributeMap,
    errors: &mut ValidationErrors,
) {
    for (field, value) in attributes {
        if field == "value" {
            match value {
                Value::Null => join.value = None,
                other => match string_attribute(other) {
                    Some(text) => join.value = Some(text),
                    None => errors.add("value", "is invalid"),
                },
            }
        }
    }
}

/// Endpoint ids and value extracted from a create payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEndpoints {
    pub left_id: NodeId,
    pub right_id: NodeId,
    pub value: Option<String>,
}

/// Read both endpoint ids (and the value, where carried) out of a raw
/// attribute map.
///
/// # Errors
/// Returns field-level messages for missing or malformed endpoint ids.
pub fn join_endpoints_from_attributes(
    kind: JoinKind,
    attributes: &AttributeMap,
) -> Result<JoinEndpoints, ValidationErrors> {
    let descriptor = kind.descriptor();
    let mut errors = ValidationErrors::new();

    let mut endpoint = |field: &str| -> Option<NodeId> {
        match attributes.get(field).and_then(string_attribute) {
            None => {
                errors.add(field, "can't be blank");
                None
            }
            Some(raw) => match NodeId::parse(&raw) {
                Some(id) => Some(id),
                None => {
                    errors.add(field, "is invalid");
                    None
                }
            },
        }
    };

    let left_id = endpoint(descriptor.left_field);
    let right_id = endpoint(descriptor.right_field);

    let value = if descriptor.has_value {
        attributes.get("value").and_then(string_attribute)
    } else {
        None
    };

    match (left_id, right_id) {
        (Some(left_id), Some(right_id)) if errors.is_empty() => {
            Ok(JoinEndpoints { left_id, right_id, value })
        }
        _ => Err(errors),
    }
}

/// Domain validation for an entity record.
#[must_use]
pub fn validate_entity(entity: &Entity) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    if entity.title.trim().is_empty() {
        errors.add("title", "can't be blank");
    }
    errors
}

/// Domain validation for a join record; endpoint existence and uniqueness
/// are checked against storage by the caller.
#[must_use]
pub fn validate_join(join: &JoinRecord) -> ValidationErrors {
    let descriptor = join.kind.descriptor();
    let mut errors = ValidationErrors::new();
    if descriptor.forbid_self_edge && join.left_id == join.right_id {
        errors.add(
            descriptor.right_field,
            &format!("can't be the same as {}", descriptor.left_field),
        );
    }
    errors
}

/// Optimistic-concurrency comparison: timestamps match when equal at
/// whole-second precision.
#[must_use]
pub fn timestamps_match(lhs: OffsetDateTime, rhs: OffsetDateTime) -> bool {
    lhs.unix_timestamp() == rhs.unix_timestamp()
}
