//! Record types for storing learner data.

use crate::{error::Result, Error, OwnerId, Payload, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of entity the engine stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Progress,
    SrsItem,
    Analytics,
    Challenge,
    Achievement,
}

impl EntityKind {
    /// Every kind, in storage order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Progress,
        EntityKind::SrsItem,
        EntityKind::Analytics,
        EntityKind::Challenge,
        EntityKind::Achievement,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Progress => "progress",
            EntityKind::SrsItem => "srs_item",
            EntityKind::Analytics => "analytics",
            EntityKind::Challenge => "challenge",
            EntityKind::Achievement => "achievement",
        }
    }

    /// Name of the embedded-store table holding this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::User => "records_user",
            EntityKind::Progress => "records_progress",
            EntityKind::SrsItem => "records_srs_item",
            EntityKind::Analytics => "records_analytics",
            EntityKind::Challenge => "records_challenge",
            EntityKind::Achievement => "records_achievement",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidRecord(format!("unknown entity kind: {s}")))
    }
}

/// The `(kind, id)` identity of a record.
///
/// Serializes as `"kind:id"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RecordKey {
    pub kind: EntityKind,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(kind: EntityKind, id: impl Into<RecordId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for RecordKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidRecord(format!("malformed record key: {s}")))?;
        if id.is_empty() {
            return Err(Error::InvalidRecord(format!("malformed record key: {s}")));
        }
        Ok(RecordKey::new(kind.parse()?, id))
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for RecordKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Entity kind
    pub kind: EntityKind,
    /// Identifier, unique within the kind
    pub id: RecordId,
    /// Learner that owns this record
    pub owner_id: OwnerId,
    /// Typed entity data
    pub payload: Payload,
    /// Last update (milliseconds since epoch); server-assigned once synced
    pub updated_at: Timestamp,
    /// Schema version the record was written under
    pub schema_version: Version,
}

impl Record {
    /// Create a record written under the current schema version.
    pub fn new(
        id: impl Into<RecordId>,
        owner_id: impl Into<OwnerId>,
        payload: Payload,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            kind: payload.kind(),
            id: id.into(),
            owner_id: owner_id.into(),
            payload,
            updated_at,
            schema_version: crate::CURRENT_SCHEMA_VERSION,
        }
    }

    /// The `(kind, id)` identity of this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind, self.id.clone())
    }

    /// Check the record envelope and its payload.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("record id must not be empty".into()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(Error::InvalidRecord(format!(
                "record {} has no owner",
                self.key()
            )));
        }
        if self.schema_version > crate::CURRENT_SCHEMA_VERSION {
            return Err(Error::InvalidRecord(format!(
                "record {} was written under schema {} (engine supports up to {})",
                self.key(),
                self.schema_version,
                crate::CURRENT_SCHEMA_VERSION
            )));
        }
        if self.payload.kind() != self.kind {
            return Err(Error::KindMismatch {
                record: self.kind,
                payload: self.payload.kind(),
            });
        }
        self.payload.validate()
    }

    /// Same entity, same owner, same payload - timestamps ignored.
    pub fn same_content(&self, other: &Record) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.owner_id == other.owner_id
            && self.payload == other.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LearningProgress, UserProfile};

    fn profile() -> Payload {
        Payload::User(UserProfile::new("Ana", "en", "es"))
    }

    #[test]
    fn create_record() {
        let record = Record::new("user-1", "learner-1", profile(), 1000);

        assert_eq!(record.kind, EntityKind::User);
        assert_eq!(record.id, "user-1");
        assert_eq!(record.owner_id, "learner-1");
        assert_eq!(record.updated_at, 1000);
        assert_eq!(record.schema_version, crate::CURRENT_SCHEMA_VERSION);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut record = Record::new("user-1", "learner-1", profile(), 1000);
        record.kind = EntityKind::Progress;

        assert!(matches!(
            record.validate(),
            Err(Error::KindMismatch {
                record: EntityKind::Progress,
                payload: EntityKind::User
            })
        ));
    }

    #[test]
    fn empty_owner_is_rejected() {
        let record = Record::new("user-1", " ", profile(), 1000);
        assert!(matches!(record.validate(), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let mut record = Record::new("user-1", "learner-1", profile(), 1000);
        record.schema_version = crate::CURRENT_SCHEMA_VERSION + 1;
        assert!(matches!(record.validate(), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn record_key_string_form() {
        let key = RecordKey::new(EntityKind::SrsItem, "card:42");
        assert_eq!(key.to_string(), "srs_item:card:42");

        let parsed: RecordKey = "srs_item:card:42".parse().unwrap();
        assert_eq!(parsed, key);

        assert!("nope".parse::<RecordKey>().is_err());
        assert!("planet:1".parse::<RecordKey>().is_err());
        assert!("user:".parse::<RecordKey>().is_err());
    }

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
            assert!(kind.table_name().starts_with("records_"));
        }
    }

    #[test]
    fn same_content_ignores_timestamps() {
        let a = Record::new("p-1", "learner-1", Payload::Progress(LearningProgress::new("fr")), 1);
        let mut b = a.clone();
        b.updated_at = 99;
        assert!(a.same_content(&b));

        b.owner_id = "learner-2".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn serialization_format() {
        let record = Record::new("user-1", "learner-1", profile(), 1000);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"ownerId\":\"learner-1\""));
        assert!(json.contains("\"updatedAt\":1000"));
        assert!(json.contains("\"kind\":\"user\""));

        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
