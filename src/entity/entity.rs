//! Entity types and identity management.
//!
//! An entity is the canonical cluster for one real-world referent. Mentions
//! point at it through `resolved_entity_id`; the entity itself only carries
//! the canonical text, type and the aggregated attributes drawn from its
//! members.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EntityEmbeddingPolicy;
use crate::ids::{EntityId, MentionId, OrgId};
use crate::mention::Mention;
use crate::normalize::normalize;

/// Classification of entities and mentions.
///
/// Extraction tags mentions either with a built-in type, an ontology class
/// IRI, or a `custom:` tag. The wire form is the lowercase name, the IRI, or
/// `custom:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    /// Goods, software, documents.
    Product,
    Concept,
    /// Ontology class, e.g. `https://schema.org/SportsTeam`.
    Iri(String),
    /// Free-form tag from an extraction prompt.
    Custom(String),
}

const BUILTIN_TYPES: [(&str, EntityType); 6] = [
    ("person", EntityType::Person),
    ("organization", EntityType::Organization),
    ("location", EntityType::Location),
    ("event", EntityType::Event),
    ("product", EntityType::Product),
    ("concept", EntityType::Concept),
];

impl EntityType {
    /// Name used on the wire for built-in types.
    const fn builtin_name(&self) -> Option<&'static str> {
        match self {
            Self::Person => Some("person"),
            Self::Organization => Some("organization"),
            Self::Location => Some("location"),
            Self::Event => Some("event"),
            Self::Product => Some("product"),
            Self::Concept => Some("concept"),
            Self::Iri(_) | Self::Custom(_) => None,
        }
    }
}

impl TryFrom<String> for EntityType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        let lower = value.to_ascii_lowercase();

        if let Some(tag) = lower.strip_prefix("custom:") {
            let tag = value[value.len() - tag.len()..].trim();
            if tag.is_empty() {
                return Err("custom entity type needs a tag after 'custom:'".to_string());
            }
            return Ok(Self::Custom(tag.to_string()));
        }
        if ["http://", "https://", "urn:"]
            .iter()
            .any(|scheme| lower.len() > scheme.len() && lower.starts_with(scheme))
        {
            return Ok(Self::Iri(value.to_string()));
        }

        BUILTIN_TYPES
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, ty)| ty.clone())
            .ok_or_else(|| {
                if value.is_empty() {
                    "entity type cannot be empty".to_string()
                } else {
                    format!("unknown entity type '{value}'; expected a built-in name, an IRI or custom:<tag>")
                }
            })
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iri(iri) => f.write_str(iri),
            Self::Custom(tag) => write!(f, "custom:{tag}"),
            builtin => f.write_str(builtin.builtin_name().unwrap_or_default()),
        }
    }
}

/// Lifecycle of an entity. Entities are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "target")]
pub enum EntityStatus {
    /// Accepts new mentions and appears in candidate search.
    Active,
    /// Folded into another entity by a manual override merge.
    MergedInto(EntityId),
}

/// The canonical record for one real-world referent.
///
/// # Examples
///
/// ```
/// use kyro_resolve::{Entity, EntityType, OrgId};
///
/// let entity = Entity::new(OrgId::new(), "Cristiano Ronaldo", EntityType::Person);
/// assert_eq!(entity.normalized_text, "cristiano ronaldo");
/// assert_eq!(entity.version, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique identifier.
    pub id: EntityId,

    /// Owning organization.
    pub org_id: OrgId,

    /// Display form of the canonical name.
    pub canonical_text: String,

    /// Normalized canonical text; the key for bloom and trigram indexes.
    pub normalized_text: String,

    /// Other surface forms merged into this entity.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// The type classification of the entity.
    pub entity_type: EntityType,

    /// Representative embedding used for similarity ranking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Mention the representative embedding was taken from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representative_mention: Option<MentionId>,

    pub status: EntityStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Version number (incremented on update).
    pub version: u64,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Entity {
    /// Creates a new active entity with the given name and type.
    #[must_use]
    pub fn new(org_id: OrgId, name: impl Into<String>, entity_type: EntityType) -> Self {
        Self::with_id(EntityId::new(), org_id, name, entity_type)
    }

    /// Creates a new entity with a specific ID.
    #[must_use]
    pub fn with_id(
        id: EntityId,
        org_id: OrgId,
        name: impl Into<String>,
        entity_type: EntityType,
    ) -> Self {
        let canonical_text = name.into();
        let now = Utc::now();
        Self {
            id,
            org_id,
            normalized_text: normalize(&canonical_text),
            canonical_text,
            aliases: Vec::new(),
            entity_type,
            embedding: None,
            representative_mention: None,
            status: EntityStatus::Active,
            created_at: now,
            updated_at: now,
            version: 1,
            metadata: serde_json::Value::Null,
        }
    }

    /// Seeds a new entity from the mention that founds it.
    #[must_use]
    pub fn from_mention(mention: &Mention, embedding: Option<Vec<f32>>) -> Self {
        let mut entity = Self::new(mention.org_id, mention.raw_text.clone(), mention.mention_type.clone());
        entity.representative_mention = embedding.as_ref().map(|_| mention.id);
        entity.embedding = embedding;
        entity
    }

    /// Reconciles attributes after `mention` joined this entity.
    ///
    /// New surface forms become aliases; the representative embedding follows
    /// `policy`. Always bumps the version, since membership changed.
    pub fn absorb(
        &mut self,
        mention: &Mention,
        embedding: Option<&[f32]>,
        policy: EntityEmbeddingPolicy,
    ) {
        let normalized = mention.normalized_text();
        if normalized != self.normalized_text
            && !self.aliases.iter().any(|a| normalize(a) == normalized)
        {
            self.aliases.push(mention.raw_text.clone());
        }

        match policy {
            EntityEmbeddingPolicy::Canonical => {
                if self.embedding.is_none() {
                    if let Some(emb) = embedding {
                        self.embedding = Some(emb.to_vec());
                        self.representative_mention = Some(mention.id);
                    }
                }
            }
            EntityEmbeddingPolicy::MostRecent => {
                if let Some(emb) = embedding {
                    self.embedding = Some(emb.to_vec());
                    self.representative_mention = Some(mention.id);
                }
            }
        }

        self.touch();
    }

    /// Drops aliases that no longer match any of `remaining` mentions, after
    /// a split or unmerge took mentions away. Does not bump the version.
    pub fn retain_aliases_of(&mut self, remaining: &[Mention]) {
        let live: HashSet<String> = remaining.iter().map(Mention::normalized_text).collect();
        self.aliases.retain(|alias| live.contains(&normalize(alias)));
    }

    /// Marks this entity as folded into `target`.
    pub fn mark_merged_into(&mut self, target: EntityId) {
        self.status = EntityStatus::MergedInto(target);
        self.touch();
    }

    /// Returns a merged-away entity to service.
    pub fn reactivate(&mut self) {
        if self.status != EntityStatus::Active {
            self.status = EntityStatus::Active;
            self.touch();
        }
    }

    /// Records that membership changed without any attribute change.
    pub fn bump(&mut self) {
        self.touch();
    }

    /// Updates the `updated_at` timestamp and increments the version.
    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Returns true if the entity accepts new mentions.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }

    /// Returns true if this entity has an embedding.
    #[must_use]
    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mention::{Provenance, TextSpan};

    fn mention(org: OrgId, text: &str) -> Mention {
        Mention::builder()
            .org(org)
            .text(text)
            .mention_type(EntityType::Person)
            .confidence(0.9)
            .provenance(Provenance::new("run", "doc", TextSpan::new(0, 1).unwrap(), "r"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_entity_creation() {
        let org = OrgId::new();
        let entity = Entity::new(org, "Test Entity", EntityType::Concept);
        assert_eq!(entity.canonical_text, "Test Entity");
        assert_eq!(entity.normalized_text, "test entity");
        assert_eq!(entity.org_id, org);
        assert_eq!(entity.version, 1);
        assert!(entity.is_active());
        assert!(entity.aliases.is_empty());
    }

    #[test]
    fn test_from_mention_takes_embedding() {
        let org = OrgId::new();
        let m = mention(org, "Cristiano Ronaldo");
        let entity = Entity::from_mention(&m, Some(vec![1.0, 0.0]));
        assert_eq!(entity.representative_mention, Some(m.id));
        assert!(entity.has_embedding());
        assert_eq!(entity.entity_type, EntityType::Person);
    }

    #[test]
    fn test_absorb_adds_alias_once() {
        let org = OrgId::new();
        let mut entity = Entity::from_mention(&mention(org, "Cristiano Ronaldo"), None);
        entity.absorb(&mention(org, "C. Ronaldo"), None, EntityEmbeddingPolicy::Canonical);
        entity.absorb(&mention(org, "c ronaldo"), None, EntityEmbeddingPolicy::Canonical);
        entity.absorb(&mention(org, "CRISTIANO RONALDO"), None, EntityEmbeddingPolicy::Canonical);

        assert_eq!(entity.aliases, vec!["C. Ronaldo".to_string()]);
        assert_eq!(entity.version, 4);
    }

    #[test]
    fn test_retain_aliases_of_remaining_mentions() {
        let org = OrgId::new();
        let founder = mention(org, "Cristiano Ronaldo");
        let short = mention(org, "C. Ronaldo");
        let nick = mention(org, "CR7");
        let mut entity = Entity::from_mention(&founder, None);
        entity.absorb(&short, None, EntityEmbeddingPolicy::Canonical);
        entity.absorb(&nick, None, EntityEmbeddingPolicy::Canonical);
        let version = entity.version;

        // A second "c. ronaldo" surface form keeps the alias alive.
        let short_again = mention(org, "c. RONALDO");
        entity.retain_aliases_of(&[founder, short_again]);
        assert_eq!(entity.aliases, vec!["C. Ronaldo".to_string()]);
        assert_eq!(entity.version, version);

        entity.retain_aliases_of(&[]);
        assert!(entity.aliases.is_empty());
        assert_eq!(entity.canonical_text, "Cristiano Ronaldo");
    }

    #[test]
    fn test_absorb_embedding_policies() {
        let org = OrgId::new();
        let founder = mention(org, "Acme");
        let later = mention(org, "Acme Inc");

        let mut canonical = Entity::from_mention(&founder, Some(vec![1.0, 0.0]));
        canonical.absorb(&later, Some(&[0.0, 1.0]), EntityEmbeddingPolicy::Canonical);
        assert_eq!(canonical.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(canonical.representative_mention, Some(founder.id));

        let mut recent = Entity::from_mention(&founder, Some(vec![1.0, 0.0]));
        recent.absorb(&later, Some(&[0.0, 1.0]), EntityEmbeddingPolicy::MostRecent);
        assert_eq!(recent.embedding, Some(vec![0.0, 1.0]));
        assert_eq!(recent.representative_mention, Some(later.id));
    }

    #[test]
    fn test_merge_and_reactivate() {
        let mut entity = Entity::new(OrgId::new(), "A", EntityType::Organization);
        let target = EntityId::new();
        entity.mark_merged_into(target);
        assert_eq!(entity.status, EntityStatus::MergedInto(target));
        assert!(!entity.is_active());
        entity.reactivate();
        assert!(entity.is_active());
        assert_eq!(entity.version, 3);
    }

    #[test]
    fn test_entity_equality_is_by_id() {
        let id = EntityId::new();
        let org = OrgId::new();
        let a = Entity::with_id(id, org, "Test", EntityType::Concept);
        let mut b = Entity::with_id(id, org, "Different Name", EntityType::Person);
        b.version = 100;
        assert_eq!(a, b);
    }

    #[test]
    fn test_entity_type_serde_is_string() {
        let person = serde_json::to_value(EntityType::Person).unwrap();
        assert_eq!(person, serde_json::Value::String("person".to_string()));

        let parsed: EntityType = serde_json::from_str("\"Product\"").unwrap();
        assert_eq!(parsed, EntityType::Product);

        let iri: EntityType = serde_json::from_str("\"https://schema.org/Person\"").unwrap();
        assert_eq!(iri, EntityType::Iri("https://schema.org/Person".to_string()));
        assert_eq!(serde_json::to_string(&iri).unwrap(), "\"https://schema.org/Person\"");

        let custom: EntityType = serde_json::from_str("\"custom:fund\"").unwrap();
        assert_eq!(custom, EntityType::Custom("fund".to_string()));

        let unknown: Result<EntityType, _> = serde_json::from_str("\"organizaton\"");
        assert!(unknown.is_err());
    }

    #[test]
    fn test_entity_status_serde() {
        let target = EntityId::new();
        let json = serde_json::to_value(EntityStatus::MergedInto(target)).unwrap();
        assert_eq!(json["state"], "merged_into");
        let back: EntityStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, EntityStatus::MergedInto(target));
    }

    #[test]
    fn test_entity_serialization() {
        let entity = Entity::new(OrgId::new(), "Test", EntityType::Concept);
        let json = serde_json::to_string(&entity).unwrap();
        let deserialized: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(entity.id, deserialized.id);
        assert_eq!(entity.normalized_text, deserialized.normalized_text);
    }
}
