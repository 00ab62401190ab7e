use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

pub use rust_decimal::Decimal;

pub const ENTITY_TABLE: &str = "entities";
pub const FIELD_CHANGE_DESCRIPTION: &str = "Change in personal information";

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

const ISO_DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const SLASH_DATE: &[FormatItem<'static>] = format_description!("[year]/[month]/[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transport channel a publishable delta travels on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    New,
    Changed,
}

impl Channel {
    pub const ALL: [Self; 2] = [Self::New, Self::Changed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Changed => "changed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "changed" => Some(Self::Changed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LanguageRow {
    #[serde(default)]
    pub languages_spoken_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NationalityRow {
    #[serde(default)]
    pub nationality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArrestWarrantRow {
    #[serde(default)]
    pub issuing_country_id: Option<String>,
    #[serde(default)]
    pub charge: Option<String>,
    #[serde(default)]
    pub charge_translation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PictureRow {
    pub picture_id: i64,
    #[serde(default)]
    pub picture_url: Option<String>,
    #[serde(default)]
    pub picture_base64: Option<String>,
}

/// A normalized record as reported by the remote registry.
///
/// Scalar fields keep the source representation where the stored type differs
/// (`date_of_birth` stays a string until classification coerces it). A `None`
/// collection means the source reported nothing, which compares as empty.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemoteRecord {
    pub entity_id: EntityId,
    #[serde(default)]
    pub forename: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sex_id: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub place_of_birth: Option<String>,
    #[serde(default)]
    pub country_of_birth_id: Option<String>,
    #[serde(default)]
    pub weight: Option<Decimal>,
    #[serde(default)]
    pub height: Option<Decimal>,
    #[serde(default)]
    pub distinguishing_marks: Option<String>,
    #[serde(default)]
    pub eyes_colors_id: Option<String>,
    #[serde(default)]
    pub hairs_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub languages_spoken_ids: Option<Vec<LanguageRow>>,
    #[serde(default)]
    pub nationalities: Option<Vec<NationalityRow>>,
    #[serde(default)]
    pub arrest_warrants: Option<Vec<ArrestWarrantRow>>,
    #[serde(default)]
    pub pictures: Option<Vec<PictureRow>>,
}

fn default_active() -> bool {
    true
}

impl RemoteRecord {
    #[must_use]
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            forename: None,
            name: None,
            sex_id: None,
            date_of_birth: None,
            place_of_birth: None,
            country_of_birth_id: None,
            weight: None,
            height: None,
            distinguishing_marks: None,
            eyes_colors_id: None,
            hairs_id: None,
            is_active: true,
            thumbnail: None,
            languages_spoken_ids: None,
            nationalities: None,
            arrest_warrants: None,
            pictures: None,
        }
    }

    /// # Errors
    /// Returns `SyncError::Validation` when the record has no usable `entity_id`.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.entity_id.0.trim().is_empty() {
            return Err(SyncError::Validation("entity_id MUST be provided".to_string()));
        }
        Ok(())
    }

    /// Coerce scalar fields to their stored types.
    ///
    /// # Errors
    /// Returns `SyncError::MalformedDelta` when `date_of_birth` is not a calendar date.
    pub fn entity_fields(&self) -> Result<EntityFields, SyncError> {
        let date_of_birth = self.date_of_birth.as_deref().map(parse_source_date).transpose()?;

        Ok(EntityFields {
            forename: self.forename.clone(),
            name: self.name.clone(),
            sex_id: self.sex_id.clone(),
            date_of_birth,
            place_of_birth: self.place_of_birth.clone(),
            country_of_birth_id: self.country_of_birth_id.clone(),
            weight: self.weight,
            height: self.height,
            distinguishing_marks: self.distinguishing_marks.clone(),
            eyes_colors_id: self.eyes_colors_id.clone(),
            hairs_id: self.hairs_id.clone(),
            is_active: self.is_active,
            thumbnail: self.thumbnail.clone(),
        })
    }

    #[must_use]
    pub fn rows_of(&self, kind: CollectionKind) -> Vec<CollectionRow> {
        match kind {
            CollectionKind::Languages => self
                .languages_spoken_ids
                .iter()
                .flatten()
                .cloned()
                .map(CollectionRow::Language)
                .collect(),
            CollectionKind::Nationalities => self
                .nationalities
                .iter()
                .flatten()
                .cloned()
                .map(CollectionRow::Nationality)
                .collect(),
            CollectionKind::ArrestWarrants => self
                .arrest_warrants
                .iter()
                .flatten()
                .cloned()
                .map(CollectionRow::ArrestWarrant)
                .collect(),
            CollectionKind::Pictures => {
                self.pictures.iter().flatten().cloned().map(CollectionRow::Picture).collect()
            }
        }
    }

    #[must_use]
    pub fn all_rows(&self) -> Vec<CollectionRow> {
        CollectionKind::ALL.into_iter().flat_map(|kind| self.rows_of(kind)).collect()
    }
}

/// Parse a source date in either `YYYY/MM/DD` or `YYYY-MM-DD` form.
///
/// # Errors
/// Returns `SyncError::MalformedDelta` for any other shape or an impossible date.
pub fn parse_source_date(raw: &str) -> Result<Date, SyncError> {
    let trimmed = raw.trim();
    let format = if trimmed.contains('/') { SLASH_DATE } else { ISO_DATE };
    Date::parse(trimmed, format)
        .map_err(|err| SyncError::MalformedDelta(format!("invalid date_of_birth {raw:?}: {err}")))
}

#[must_use]
pub fn format_date(date: Date) -> String {
    date.format(ISO_DATE).unwrap_or_else(|_| date.to_string())
}

/// Parse a decimal literal into its normalized form, so `1.80` and `1.8`
/// render identically.
///
/// # Errors
/// Returns `SyncError::MalformedDelta` when the text is not a decimal number.
pub fn parse_decimal(raw: &str) -> Result<Decimal, SyncError> {
    raw.trim()
        .parse::<Decimal>()
        .map(|value| value.normalize())
        .map_err(|err| SyncError::MalformedDelta(format!("invalid decimal value {raw:?}: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityFields {
    pub forename: Option<String>,
    pub name: Option<String>,
    pub sex_id: Option<String>,
    #[serde(with = "iso_date::option")]
    pub date_of_birth: Option<Date>,
    pub place_of_birth: Option<String>,
    pub country_of_birth_id: Option<String>,
    pub weight: Option<Decimal>,
    pub height: Option<Decimal>,
    pub distinguishing_marks: Option<String>,
    pub eyes_colors_id: Option<String>,
    pub hairs_id: Option<String>,
    pub is_active: bool,
    pub thumbnail: Option<String>,
}

impl EntityFields {
    /// Column snapshot used for `LogEntry.column_data`.
    #[must_use]
    pub fn snapshot(&self, entity_id: &EntityId) -> Value {
        let mut map = Map::new();
        map.insert("entity_id".to_string(), Value::String(entity_id.0.clone()));
        for field in EntityField::ALL {
            map.insert(field.as_str().to_string(), field.value_of(self).to_json());
        }
        Value::Object(map)
    }
}

/// Scalar columns of the entity table, in column order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityField {
    Forename,
    Name,
    SexId,
    DateOfBirth,
    PlaceOfBirth,
    CountryOfBirthId,
    Weight,
    Height,
    DistinguishingMarks,
    EyesColorsId,
    HairsId,
    IsActive,
    Thumbnail,
}

impl EntityField {
    pub const ALL: [Self; 13] = [
        Self::Forename,
        Self::Name,
        Self::SexId,
        Self::DateOfBirth,
        Self::PlaceOfBirth,
        Self::CountryOfBirthId,
        Self::Weight,
        Self::Height,
        Self::DistinguishingMarks,
        Self::EyesColorsId,
        Self::HairsId,
        Self::IsActive,
        Self::Thumbnail,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forename => "forename",
            Self::Name => "name",
            Self::SexId => "sex_id",
            Self::DateOfBirth => "date_of_birth",
            Self::PlaceOfBirth => "place_of_birth",
            Self::CountryOfBirthId => "country_of_birth_id",
            Self::Weight => "weight",
            Self::Height => "height",
            Self::DistinguishingMarks => "distinguishing_marks",
            Self::EyesColorsId => "eyes_colors_id",
            Self::HairsId => "hairs_id",
            Self::IsActive => "is_active",
            Self::Thumbnail => "thumbnail",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == value)
    }

    #[must_use]
    pub fn value_of(self, fields: &EntityFields) -> FieldValue {
        fn text(value: Option<&String>) -> FieldValue {
            value.map_or(FieldValue::Null, |v| FieldValue::Text(v.clone()))
        }

        match self {
            Self::Forename => text(fields.forename.as_ref()),
            Self::Name => text(fields.name.as_ref()),
            Self::SexId => text(fields.sex_id.as_ref()),
            Self::DateOfBirth => fields.date_of_birth.map_or(FieldValue::Null, FieldValue::Date),
            Self::PlaceOfBirth => text(fields.place_of_birth.as_ref()),
            Self::CountryOfBirthId => text(fields.country_of_birth_id.as_ref()),
            Self::Weight => fields.weight.map_or(FieldValue::Null, FieldValue::Decimal),
            Self::Height => fields.height.map_or(FieldValue::Null, FieldValue::Decimal),
            Self::DistinguishingMarks => text(fields.distinguishing_marks.as_ref()),
            Self::EyesColorsId => text(fields.eyes_colors_id.as_ref()),
            Self::HairsId => text(fields.hairs_id.as_ref()),
            Self::IsActive => FieldValue::Bool(fields.is_active),
            Self::Thumbnail => text(fields.thumbnail.as_ref()),
        }
    }
}

/// A typed scalar value of one entity column.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Date(#[serde(with = "iso_date")] Date),
    Decimal(Decimal),
    Bool(bool),
}

impl FieldValue {
    /// Text form written to `ChangeLogEntry.old_value`/`new_value`; `None` is SQL NULL.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(value) => Some(value.clone()),
            Self::Date(value) => Some(format_date(*value)),
            Self::Decimal(value) => Some(value.normalize().to_string()),
            Self::Bool(value) => Some(value.to_string()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            other => other.render().map_or(Value::Null, Value::String),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Languages,
    Nationalities,
    ArrestWarrants,
    Pictures,
}

impl CollectionKind {
    pub const ALL: [Self; 4] =
        [Self::Languages, Self::Nationalities, Self::ArrestWarrants, Self::Pictures];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Languages => "languages",
            Self::Nationalities => "nationalities",
            Self::ArrestWarrants => "arrest_warrants",
            Self::Pictures => "pictures",
        }
    }

    #[must_use]
    pub fn schema(self) -> &'static CollectionSchema {
        match self {
            Self::Languages => &LANGUAGES,
            Self::Nationalities => &NATIONALITIES,
            Self::ArrestWarrants => &ARREST_WARRANTS,
            Self::Pictures => &PICTURES,
        }
    }
}

/// How two rows of a collection are judged to be "the same row".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IdentityPolicy {
    /// Full-tuple equality over every attribute; a multiset diff.
    Structural,
    /// Equality of one source-supplied key; other attributes are ignored.
    NamedKey(&'static str),
}

/// Static description of one dependent collection table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CollectionSchema {
    pub kind: CollectionKind,
    pub table: &'static str,
    pub surrogate_key: &'static str,
    pub fields: &'static [&'static str],
    pub identity: IdentityPolicy,
}

pub const LANGUAGES: CollectionSchema = CollectionSchema {
    kind: CollectionKind::Languages,
    table: "entity_languages",
    surrogate_key: "language_id",
    fields: &["languages_spoken_id"],
    identity: IdentityPolicy::Structural,
};

pub const NATIONALITIES: CollectionSchema = CollectionSchema {
    kind: CollectionKind::Nationalities,
    table: "entity_nationalities",
    surrogate_key: "nationality_id",
    fields: &["nationality"],
    identity: IdentityPolicy::Structural,
};

pub const ARREST_WARRANTS: CollectionSchema = CollectionSchema {
    kind: CollectionKind::ArrestWarrants,
    table: "entity_arrest_warrants",
    surrogate_key: "arrest_warrant_id",
    fields: &["issuing_country_id", "charge", "charge_translation"],
    identity: IdentityPolicy::Structural,
};

pub const PICTURES: CollectionSchema = CollectionSchema {
    kind: CollectionKind::Pictures,
    table: "entity_pictures",
    surrogate_key: "row_id",
    fields: &["picture_id", "picture_url", "picture_base64"],
    identity: IdentityPolicy::NamedKey("picture_id"),
};

impl CollectionSchema {
    /// Columns compared when locating "the same row" for this collection.
    #[must_use]
    pub fn match_columns(&self) -> Vec<&'static str> {
        match self.identity {
            IdentityPolicy::Structural => self.fields.to_vec(),
            IdentityPolicy::NamedKey(field) => vec![field],
        }
    }

    #[must_use]
    pub fn identity_key(&self, row: &CollectionRow) -> Vec<ColumnValue> {
        self.match_columns()
            .into_iter()
            .map(|column| row.column(column).unwrap_or(ColumnValue::Null))
            .collect()
    }
}

/// One collection cell as stored in SQL.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Text(String),
}

impl ColumnValue {
    fn from_text(value: Option<&String>) -> Self {
        value.map_or(Self::Null, |v| Self::Text(v.clone()))
    }

    fn into_text(self, column: &str) -> Result<Option<String>, SyncError> {
        match self {
            Self::Null => Ok(None),
            Self::Text(value) => Ok(Some(value)),
            Self::Integer(_) => {
                Err(SyncError::MalformedDelta(format!("column {column} MUST be text")))
            }
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

fn next_text(
    values: &mut impl Iterator<Item = ColumnValue>,
    column: &str,
) -> Result<Option<String>, SyncError> {
    values.next().unwrap_or(ColumnValue::Null).into_text(column)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "collection", content = "row", rename_all = "snake_case")]
pub enum CollectionRow {
    Language(LanguageRow),
    Nationality(NationalityRow),
    ArrestWarrant(ArrestWarrantRow),
    Picture(PictureRow),
}

impl CollectionRow {
    #[must_use]
    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Language(_) => CollectionKind::Languages,
            Self::Nationality(_) => CollectionKind::Nationalities,
            Self::ArrestWarrant(_) => CollectionKind::ArrestWarrants,
            Self::Picture(_) => CollectionKind::Pictures,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &'static CollectionSchema {
        self.kind().schema()
    }

    /// Attribute values in `schema().fields` order.
    #[must_use]
    pub fn columns(&self) -> Vec<ColumnValue> {
        match self {
            Self::Language(row) => vec![ColumnValue::from_text(row.languages_spoken_id.as_ref())],
            Self::Nationality(row) => vec![ColumnValue::from_text(row.nationality.as_ref())],
            Self::ArrestWarrant(row) => vec![
                ColumnValue::from_text(row.issuing_country_id.as_ref()),
                ColumnValue::from_text(row.charge.as_ref()),
                ColumnValue::from_text(row.charge_translation.as_ref()),
            ],
            Self::Picture(row) => vec![
                ColumnValue::Integer(row.picture_id),
                ColumnValue::from_text(row.picture_url.as_ref()),
                ColumnValue::from_text(row.picture_base64.as_ref()),
            ],
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<ColumnValue> {
        let index = self.schema().fields.iter().position(|field| *field == name)?;
        self.columns().into_iter().nth(index)
    }

    /// Rebuild a row from values read back in `schema.fields` order.
    ///
    /// # Errors
    /// Returns `SyncError::MalformedDelta` when the arity or a column type does not match.
    pub fn from_columns(kind: CollectionKind, values: Vec<ColumnValue>) -> Result<Self, SyncError> {
        let schema = kind.schema();
        if values.len() != schema.fields.len() {
            return Err(SyncError::MalformedDelta(format!(
                "{} row MUST have {} columns, got {}",
                schema.table,
                schema.fields.len(),
                values.len()
            )));
        }

        let mut values = values.into_iter();

        match kind {
            CollectionKind::Languages => Ok(Self::Language(LanguageRow {
                languages_spoken_id: next_text(&mut values, "languages_spoken_id")?,
            })),
            CollectionKind::Nationalities => Ok(Self::Nationality(NationalityRow {
                nationality: next_text(&mut values, "nationality")?,
            })),
            CollectionKind::ArrestWarrants => Ok(Self::ArrestWarrant(ArrestWarrantRow {
                issuing_country_id: next_text(&mut values, "issuing_country_id")?,
                charge: next_text(&mut values, "charge")?,
                charge_translation: next_text(&mut values, "charge_translation")?,
            })),
            CollectionKind::Pictures => {
                let Some(ColumnValue::Integer(picture_id)) = values.next() else {
                    return Err(SyncError::MalformedDelta(
                        "picture_id MUST be an integer".to_string(),
                    ));
                };
                Ok(Self::Picture(PictureRow {
                    picture_id,
                    picture_url: next_text(&mut values, "picture_url")?,
                    picture_base64: next_text(&mut values, "picture_base64")?,
                }))
            }
        }
    }

    /// Column snapshot used for `LogEntry.column_data`.
    #[must_use]
    pub fn snapshot(&self, entity_id: &EntityId) -> Value {
        let mut map = Map::new();
        map.insert("entity_id".to_string(), Value::String(entity_id.0.clone()));
        for (field, value) in self.schema().fields.iter().zip(self.columns()) {
            map.insert((*field).to_string(), value.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOp {
    Add,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionDelta {
    pub op: CollectionOp,
    pub row: CollectionRow,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldDelta {
    pub field: EntityField,
    pub old: FieldValue,
    pub new: FieldValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangedDelta {
    pub entity_id: EntityId,
    pub fields: Vec<FieldDelta>,
    pub collections: Vec<CollectionDelta>,
}

impl ChangedDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.collections.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    Unseen(RemoteRecord),
    Unchanged { entity_id: EntityId },
    Changed { record: RemoteRecord, delta: ChangedDelta },
    Vanished { entity_id: EntityId },
}

impl Delta {
    #[must_use]
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Unseen(record) | Self::Changed { record, .. } => &record.entity_id,
            Self::Unchanged { entity_id } | Self::Vanished { entity_id } => entity_id,
        }
    }

    /// Channel and payload for deltas that travel over the transport.
    ///
    /// `Unchanged` is never published and `Vanished` is applied in-process,
    /// so both yield `None`.
    #[must_use]
    pub fn into_message(self) -> Option<(Channel, RemoteRecord)> {
        match self {
            Self::Unseen(record) => Some((Channel::New, record)),
            Self::Changed { record, .. } => Some((Channel::Changed, record)),
            Self::Unchanged { .. } | Self::Vanished { .. } => None,
        }
    }
}

/// Everything the store holds for one entity, as seen by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredEntity {
    pub entity_id: EntityId,
    pub fields: EntityFields,
    pub rows: Vec<CollectionRow>,
}

impl StoredEntity {
    /// The state a store reaches after applying `record` as unseen.
    ///
    /// # Errors
    /// Returns an error when the record fails validation or field coercion.
    pub fn from_record(record: &RemoteRecord) -> Result<Self, SyncError> {
        record.validate()?;
        Ok(Self {
            entity_id: record.entity_id.clone(),
            fields: record.entity_fields()?,
            rows: record.all_rows(),
        })
    }

    #[must_use]
    pub fn rows_of(&self, kind: CollectionKind) -> Vec<CollectionRow> {
        self.rows.iter().filter(|row| row.kind() == kind).cloned().collect()
    }
}

/// Compare a remote record against its stored state.
///
/// # Errors
/// Returns `SyncError::Validation` for a missing or mismatched `entity_id` and
/// `SyncError::MalformedDelta` when a field cannot be coerced.
pub fn classify(record: RemoteRecord, stored: Option<&StoredEntity>) -> Result<Delta, SyncError> {
    record.validate()?;
    let Some(stored) = stored else {
        record.entity_fields()?;
        return Ok(Delta::Unseen(record));
    };

    let delta = diff_entity(&record, stored)?;
    if delta.is_empty() {
        return Ok(Delta::Unchanged { entity_id: record.entity_id });
    }
    Ok(Delta::Changed { record, delta })
}

/// Field and collection deltas that turn `stored` into `record`.
///
/// # Errors
/// Same conditions as [`classify`].
pub fn diff_entity(record: &RemoteRecord, stored: &StoredEntity) -> Result<ChangedDelta, SyncError> {
    if record.entity_id != stored.entity_id {
        return Err(SyncError::Validation(format!(
            "record entity_id {} MUST match stored entity_id {}",
            record.entity_id, stored.entity_id
        )));
    }

    let incoming = record.entity_fields()?;
    let fields = diff_fields(&stored.fields, &incoming);
    let collections = CollectionKind::ALL
        .into_iter()
        .flat_map(|kind| {
            diff_collection(kind.schema(), &record.rows_of(kind), &stored.rows_of(kind))
        })
        .collect();

    Ok(ChangedDelta { entity_id: record.entity_id.clone(), fields, collections })
}

#[must_use]
pub fn diff_fields(stored: &EntityFields, incoming: &EntityFields) -> Vec<FieldDelta> {
    EntityField::ALL
        .into_iter()
        .filter_map(|field| {
            let new = field.value_of(incoming);
            // A null from the source never erases a stored value.
            if new == FieldValue::Null {
                return None;
            }
            let old = field.value_of(stored);
            (old != new).then_some(FieldDelta { field, old, new })
        })
        .collect()
}

/// Reconcile one collection under its schema's identity policy.
///
/// Structural collections get a multiset diff: each incoming row cancels one
/// equal stored row. Keyed collections compare key sets: the first incoming
/// row per unseen key is added, every stored row whose key disappeared is
/// deleted.
#[must_use]
pub fn diff_collection(
    schema: &CollectionSchema,
    incoming: &[CollectionRow],
    stored: &[CollectionRow],
) -> Vec<CollectionDelta> {
    let mut deltas = Vec::new();

    match schema.identity {
        IdentityPolicy::Structural => {
            let mut remaining = BTreeMap::<Vec<ColumnValue>, usize>::new();
            for row in stored {
                *remaining.entry(schema.identity_key(row)).or_default() += 1;
            }

            for row in incoming {
                match remaining.get_mut(&schema.identity_key(row)) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => deltas.push(CollectionDelta { op: CollectionOp::Add, row: row.clone() }),
                }
            }

            for row in stored {
                if let Some(count) = remaining.get_mut(&schema.identity_key(row)) {
                    if *count > 0 {
                        *count -= 1;
                        deltas.push(CollectionDelta { op: CollectionOp::Delete, row: row.clone() });
                    }
                }
            }
        }
        IdentityPolicy::NamedKey(_) => {
            let stored_keys =
                stored.iter().map(|row| schema.identity_key(row)).collect::<BTreeSet<_>>();
            let incoming_keys =
                incoming.iter().map(|row| schema.identity_key(row)).collect::<BTreeSet<_>>();

            let mut added = BTreeSet::new();
            for row in incoming {
                let key = schema.identity_key(row);
                if !stored_keys.contains(&key) && added.insert(key) {
                    deltas.push(CollectionDelta { op: CollectionOp::Add, row: row.clone() });
                }
            }

            for row in stored {
                if !incoming_keys.contains(&schema.identity_key(row)) {
                    deltas.push(CollectionDelta { op: CollectionOp::Delete, row: row.clone() });
                }
            }
        }
    }

    deltas
}

/// Stored active entities that the latest complete fetch did not report.
#[must_use]
pub fn vanished_ids(active_stored: &[EntityId], fetched: &BTreeSet<EntityId>) -> Vec<EntityId> {
    active_stored.iter().filter(|id| !fetched.contains(*id)).cloned().collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AuditAction {
    Added,
    Deleted,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "Added",
            Self::Deleted => "Deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Added" => Some(Self::Added),
            "Deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One scalar-field change on the entity table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeLogEntry {
    pub log_id: i64,
    pub entity_id: EntityId,
    pub table_name: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub change_date: OffsetDateTime,
}

/// One inserted or deleted row with its full column snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub log_id: i64,
    pub entity_id: EntityId,
    pub table_name: String,
    pub action: AuditAction,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub column_data: Value,
    pub description: Option<String>,
}
