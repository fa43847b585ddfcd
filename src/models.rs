//! Document model for the search index.
//!
//! These types describe what actually lives in the index: a flat
//! [`Document`] keyed by a stable unique key, plus the typed views
//! ([`ActivityDoc`], [`ActiveRuleDoc`]) the rest of the system works
//! with. Conversion from a raw primary-store field map fails fast on
//! missing required fields; unknown extra fields are carried through
//! opaquely so re-indexing older and newer records is round-trip safe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

// Field names shared by the document model, the query translator, and the
// index backends.
pub const FIELD_KEY: &str = "key";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_LOGIN: &str = "login";
pub const FIELD_DETAILS: &str = "details";
pub const FIELD_PROFILE_KEY: &str = "profile_key";
pub const FIELD_RULE_KEY: &str = "rule_key";
pub const FIELD_SEVERITY: &str = "severity";
pub const FIELD_INHERITANCE: &str = "inheritance";
pub const FIELD_PARENT_KEY: &str = "parent_key";
pub const FIELD_PARAMS: &str = "params";

/// Detail key carrying the project scope of an activity.
pub const DETAIL_PROJECT_KEY: &str = "projectKey";

/// A single field value inside a document.
///
/// Untagged so the JSON payload stored by the SQLite backend stays plain:
/// nested maps serialize as objects, strings as strings. Timestamps
/// serialize as `{"$ts": millis}` so a string field whose value merely
/// looks like a date can never be re-typed on the way back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Ts(#[serde(with = "ts_repr")] DateTime<Utc>),
    Nested(BTreeMap<String, String>),
    Int(i64),
    Str(String),
}

mod ts_repr {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Tagged {
        #[serde(rename = "$ts")]
        millis: i64,
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        Tagged {
            millis: ts.timestamp_millis(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        DateTime::from_timestamp_millis(tagged.millis)
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ts(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Ts(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            FieldValue::Nested(map) => Some(map),
            _ => None,
        }
    }
}

/// Which entity a document mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Activity,
    ActiveRule,
}

impl DocKind {
    pub fn tag(&self) -> &'static str {
        match self {
            DocKind::Activity => "activity",
            DocKind::ActiveRule => "active_rule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activity" => Some(DocKind::Activity),
            "active_rule" => Some(DocKind::ActiveRule),
            _ => None,
        }
    }
}

/// Full current field state of one primary-store record.
///
/// The synchronizer always receives complete state, never a diff, so a
/// raw record is sufficient to rebuild its document from scratch.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn set_str(self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, FieldValue::Str(value.into()))
    }

    pub fn set_ts(self, name: &str, value: DateTime<Utc>) -> Self {
        self.set(name, FieldValue::Ts(value))
    }

    pub fn set_nested(self, name: &str, value: BTreeMap<String, String>) -> Self {
        self.set(name, FieldValue::Nested(value))
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }
}

/// A denormalized record in the search index.
///
/// The key is derived deterministically from the source entity's primary
/// key, so indexing the same entity twice replaces rather than duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub kind: DocKind,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Creation timestamp, the default sort key.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.field(FIELD_CREATED_AT).and_then(FieldValue::as_ts)
    }
}

// ============ Field extraction ============

fn require_str(fields: &BTreeMap<String, FieldValue>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(FieldValue::Str(s)) => Ok(s.clone()),
        Some(_) => Err(IndexError::malformed(format!(
            "field '{name}' has the wrong kind, expected string"
        ))),
        None => Err(IndexError::malformed(format!(
            "required field '{name}' is missing"
        ))),
    }
}

fn require_ts(fields: &BTreeMap<String, FieldValue>, name: &str) -> Result<DateTime<Utc>> {
    match fields.get(name) {
        Some(FieldValue::Ts(ts)) => Ok(*ts),
        Some(_) => Err(IndexError::malformed(format!(
            "field '{name}' has the wrong kind, expected timestamp"
        ))),
        None => Err(IndexError::malformed(format!(
            "required field '{name}' is missing"
        ))),
    }
}

fn optional_str(fields: &BTreeMap<String, FieldValue>, name: &str) -> Option<String> {
    fields.get(name).and_then(|v| v.as_str()).map(String::from)
}

fn optional_nested(
    fields: &BTreeMap<String, FieldValue>,
    name: &str,
) -> BTreeMap<String, String> {
    fields
        .get(name)
        .and_then(FieldValue::as_nested)
        .cloned()
        .unwrap_or_default()
}

fn extra_fields(
    fields: &BTreeMap<String, FieldValue>,
    known: &[&str],
) -> BTreeMap<String, FieldValue> {
    fields
        .iter()
        .filter(|(name, _)| !known.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

// ============ Activity ============

const ACTIVITY_KNOWN_FIELDS: &[&str] = &[
    FIELD_KEY,
    FIELD_TYPE,
    FIELD_CREATED_AT,
    FIELD_MESSAGE,
    FIELD_LOGIN,
    FIELD_DETAILS,
];

/// An indexed activity. Activities are append-only: created on insert,
/// never updated, pruned only by an external retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDoc {
    pub key: String,
    pub activity_type: String,
    pub created_at: DateTime<Utc>,
    pub message: Option<String>,
    pub login: Option<String>,
    /// Matched during filtering only, never returned verbatim by search.
    pub details: BTreeMap<String, String>,
    extra: BTreeMap<String, FieldValue>,
}

impl ActivityDoc {
    fn parse(fields: &BTreeMap<String, FieldValue>) -> Result<Self> {
        Ok(Self {
            key: require_str(fields, FIELD_KEY)?,
            activity_type: require_str(fields, FIELD_TYPE)?,
            created_at: require_ts(fields, FIELD_CREATED_AT)?,
            message: optional_str(fields, FIELD_MESSAGE),
            login: optional_str(fields, FIELD_LOGIN),
            details: optional_nested(fields, FIELD_DETAILS),
            extra: extra_fields(fields, ACTIVITY_KNOWN_FIELDS),
        })
    }

    pub fn from_record(record: &RawRecord) -> Result<Self> {
        Self::parse(record.fields())
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        if doc.kind != DocKind::Activity {
            return Err(IndexError::malformed(format!(
                "expected an activity document, got '{}'",
                doc.kind.tag()
            )));
        }
        Self::parse(&doc.fields)
    }

    pub fn to_document(&self) -> Document {
        let mut fields = self.extra.clone();
        fields.insert(FIELD_KEY.into(), FieldValue::Str(self.key.clone()));
        fields.insert(
            FIELD_TYPE.into(),
            FieldValue::Str(self.activity_type.clone()),
        );
        fields.insert(FIELD_CREATED_AT.into(), FieldValue::Ts(self.created_at));
        if let Some(ref message) = self.message {
            fields.insert(FIELD_MESSAGE.into(), FieldValue::Str(message.clone()));
        }
        if let Some(ref login) = self.login {
            fields.insert(FIELD_LOGIN.into(), FieldValue::Str(login.clone()));
        }
        if !self.details.is_empty() {
            fields.insert(
                FIELD_DETAILS.into(),
                FieldValue::Nested(self.details.clone()),
            );
        }
        Document {
            key: self.key.clone(),
            kind: DocKind::Activity,
            fields,
        }
    }
}

// ============ Active rule ============

/// Rule severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
    Blocker,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Critical => "CRITICAL",
            Severity::Blocker => "BLOCKER",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INFO" => Ok(Severity::Info),
            "MINOR" => Ok(Severity::Minor),
            "MAJOR" => Ok(Severity::Major),
            "CRITICAL" => Ok(Severity::Critical),
            "BLOCKER" => Ok(Severity::Blocker),
            other => Err(IndexError::malformed(format!("unknown severity '{other}'"))),
        }
    }
}

/// How a rule activation relates to the profile's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    None,
    Inherited,
    Overrides,
}

impl Inheritance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Inheritance::None => "NONE",
            Inheritance::Inherited => "INHERITED",
            Inheritance::Overrides => "OVERRIDES",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(Inheritance::None),
            "INHERITED" => Ok(Inheritance::Inherited),
            "OVERRIDES" => Ok(Inheritance::Overrides),
            other => Err(IndexError::malformed(format!(
                "unknown inheritance '{other}'"
            ))),
        }
    }
}

/// Composite document key for a rule activated on a profile.
pub fn active_rule_key(profile_key: &str, rule_key: &str) -> String {
    format!("{profile_key}|{rule_key}")
}

const ACTIVE_RULE_KNOWN_FIELDS: &[&str] = &[
    FIELD_KEY,
    FIELD_PROFILE_KEY,
    FIELD_RULE_KEY,
    FIELD_SEVERITY,
    FIELD_INHERITANCE,
    FIELD_PARENT_KEY,
    FIELD_PARAMS,
];

/// An indexed rule activation. Mutations replace the whole document so
/// nested params can never go stale; deactivation deletes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRuleDoc {
    pub key: String,
    pub profile_key: String,
    pub rule_key: String,
    pub severity: Severity,
    pub inheritance: Inheritance,
    /// Set when inheritance is not NONE.
    pub parent_key: Option<String>,
    pub params: BTreeMap<String, String>,
    extra: BTreeMap<String, FieldValue>,
}

impl ActiveRuleDoc {
    pub fn new(
        profile_key: impl Into<String>,
        rule_key: impl Into<String>,
        severity: Severity,
        inheritance: Inheritance,
    ) -> Self {
        let profile_key = profile_key.into();
        let rule_key = rule_key.into();
        Self {
            key: active_rule_key(&profile_key, &rule_key),
            profile_key,
            rule_key,
            severity,
            inheritance,
            parent_key: None,
            params: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    fn parse(fields: &BTreeMap<String, FieldValue>) -> Result<Self> {
        Ok(Self {
            key: require_str(fields, FIELD_KEY)?,
            profile_key: require_str(fields, FIELD_PROFILE_KEY)?,
            rule_key: require_str(fields, FIELD_RULE_KEY)?,
            severity: Severity::parse(&require_str(fields, FIELD_SEVERITY)?)?,
            inheritance: Inheritance::parse(&require_str(fields, FIELD_INHERITANCE)?)?,
            parent_key: optional_str(fields, FIELD_PARENT_KEY),
            params: optional_nested(fields, FIELD_PARAMS),
            extra: extra_fields(fields, ACTIVE_RULE_KNOWN_FIELDS),
        })
    }

    pub fn from_record(record: &RawRecord) -> Result<Self> {
        Self::parse(record.fields())
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        if doc.kind != DocKind::ActiveRule {
            return Err(IndexError::malformed(format!(
                "expected an active-rule document, got '{}'",
                doc.kind.tag()
            )));
        }
        Self::parse(&doc.fields)
    }

    pub fn to_document(&self) -> Document {
        let mut fields = self.extra.clone();
        fields.insert(FIELD_KEY.into(), FieldValue::Str(self.key.clone()));
        fields.insert(
            FIELD_PROFILE_KEY.into(),
            FieldValue::Str(self.profile_key.clone()),
        );
        fields.insert(
            FIELD_RULE_KEY.into(),
            FieldValue::Str(self.rule_key.clone()),
        );
        fields.insert(
            FIELD_SEVERITY.into(),
            FieldValue::Str(self.severity.as_str().into()),
        );
        fields.insert(
            FIELD_INHERITANCE.into(),
            FieldValue::Str(self.inheritance.as_str().into()),
        );
        if let Some(ref parent) = self.parent_key {
            fields.insert(FIELD_PARENT_KEY.into(), FieldValue::Str(parent.clone()));
        }
        if !self.params.is_empty() {
            fields.insert(FIELD_PARAMS.into(), FieldValue::Nested(self.params.clone()));
        }
        Document {
            key: self.key.clone(),
            kind: DocKind::ActiveRule,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn activity_record() -> RawRecord {
        let mut details = BTreeMap::new();
        details.insert("profileKey".to_string(), "P1".to_string());
        RawRecord::new()
            .set_str(FIELD_KEY, "a1")
            .set_str(FIELD_TYPE, "QPROFILE")
            .set_ts(FIELD_CREATED_AT, ts(1_000))
            .set_str(FIELD_LOGIN, "anna")
            .set_nested(FIELD_DETAILS, details)
    }

    #[test]
    fn activity_from_record() {
        let doc = ActivityDoc::from_record(&activity_record()).unwrap();
        assert_eq!(doc.key, "a1");
        assert_eq!(doc.activity_type, "QPROFILE");
        assert_eq!(doc.created_at, ts(1_000));
        assert_eq!(doc.login.as_deref(), Some("anna"));
        assert_eq!(doc.details.get("profileKey").unwrap(), "P1");
    }

    #[test]
    fn activity_missing_created_at_is_malformed() {
        let record = RawRecord::new()
            .set_str(FIELD_KEY, "a1")
            .set_str(FIELD_TYPE, "QPROFILE");
        let err = ActivityDoc::from_record(&record).unwrap_err();
        assert!(matches!(err, IndexError::MalformedRecord(_)));
        assert!(err.to_string().contains("created_at"));
    }

    #[test]
    fn activity_wrong_field_kind_is_malformed() {
        let record = activity_record().set_str(FIELD_CREATED_AT, "yesterday");
        let err = ActivityDoc::from_record(&record).unwrap_err();
        assert!(err.to_string().contains("expected timestamp"));
    }

    #[test]
    fn activity_round_trip_preserves_unknown_fields() {
        let record = activity_record().set_str("plugin_version", "4.2");
        let typed = ActivityDoc::from_record(&record).unwrap();
        let doc = typed.to_document();
        assert_eq!(
            doc.field("plugin_version").and_then(FieldValue::as_str),
            Some("4.2")
        );
        let back = ActivityDoc::from_document(&doc).unwrap();
        assert_eq!(back, typed);
    }

    #[test]
    fn active_rule_round_trip() {
        let mut rule =
            ActiveRuleDoc::new("P1", "squid:S001", Severity::Blocker, Inheritance::Inherited);
        rule.parent_key = Some("P0|squid:S001".to_string());
        rule.params.insert("max".to_string(), "10".to_string());

        let doc = rule.to_document();
        assert_eq!(doc.key, "P1|squid:S001");
        assert_eq!(doc.kind, DocKind::ActiveRule);

        let back = ActiveRuleDoc::from_document(&doc).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn active_rule_rejects_unknown_severity() {
        let record = RawRecord::new()
            .set_str(FIELD_KEY, "P1|r1")
            .set_str(FIELD_PROFILE_KEY, "P1")
            .set_str(FIELD_RULE_KEY, "r1")
            .set_str(FIELD_SEVERITY, "SEVERE")
            .set_str(FIELD_INHERITANCE, "NONE");
        let err = ActiveRuleDoc::from_record(&record).unwrap_err();
        assert!(err.to_string().contains("unknown severity"));
    }

    #[test]
    fn date_shaped_string_field_survives_payload_round_trip() {
        let record = activity_record().set_str(FIELD_MESSAGE, "2024-01-01T00:00:00Z");
        let typed = ActivityDoc::from_record(&record).unwrap();
        let doc = typed.to_document();

        // Same encode/decode path the SQLite backend uses for payloads.
        let payload = serde_json::to_string(&doc.fields).unwrap();
        let fields: BTreeMap<String, FieldValue> = serde_json::from_str(&payload).unwrap();
        let back = ActivityDoc::from_document(&Document {
            key: doc.key.clone(),
            kind: doc.kind,
            fields,
        })
        .unwrap();

        assert_eq!(back.message.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(back.created_at, typed.created_at);
    }

    #[test]
    fn field_value_json_round_trip() {
        let mut nested = BTreeMap::new();
        nested.insert("min".to_string(), "1".to_string());
        let values = vec![
            FieldValue::Str("hello".to_string()),
            FieldValue::Int(42),
            FieldValue::Ts(ts(1_000)),
            FieldValue::Nested(nested),
        ];
        for value in values {
            let json = serde_json::to_string(&value).unwrap();
            let back: FieldValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }
}
