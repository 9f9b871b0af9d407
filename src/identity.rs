//! Identities, roles and the entity records an identity can resolve to

use crate::state_machine::{EnteredField, FieldValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stable external key of one user (the messaging platform's user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub i64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Identity)
    }
}

/// Role derived for an identity. Never stored, recomputed on every resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Tutor,
    Student,
    Parent,
    Unknown,
}

impl From<EntityRole> for Role {
    fn from(role: EntityRole) -> Self {
        match role {
            EntityRole::Admin => Role::Admin,
            EntityRole::Tutor => Role::Tutor,
            EntityRole::Student => Role::Student,
            EntityRole::Parent => Role::Parent,
        }
    }
}

/// Roles backed by an entity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Admin,
    Tutor,
    Student,
    Parent,
}

impl EntityRole {
    /// Resolution order, highest priority first
    pub const PRIORITY: [EntityRole; 4] = [
        EntityRole::Admin,
        EntityRole::Tutor,
        EntityRole::Student,
        EntityRole::Parent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityRole::Admin => "admin",
            EntityRole::Tutor => "tutor",
            EntityRole::Student => "student",
            EntityRole::Parent => "parent",
        }
    }

    /// Fields an administrator types in when creating a record of this role.
    /// The storage primary key is never part of the list.
    pub fn entry_fields(self) -> &'static [&'static str] {
        match self {
            EntityRole::Admin => &["telegram_id", "name"],
            EntityRole::Tutor => &["telegram_id", "name", "is_admin"],
            EntityRole::Student => &["telegram_id", "first_name", "last_name"],
            EntityRole::Parent => &["telegram_id", "full_name"],
        }
    }
}

impl fmt::Display for EntityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for EntityRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" | "администратор" => Ok(EntityRole::Admin),
            "tutor" | "преподаватель" => Ok(EntityRole::Tutor),
            "student" | "ученик" => Ok(EntityRole::Student),
            "parent" | "родитель" => Ok(EntityRole::Parent),
            _ => Err(UnknownRole(s.trim().to_string())),
        }
    }
}

// ============================================================================
// Entity records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRecord {
    pub telegram_id: Identity,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorRecord {
    pub telegram_id: Identity,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub telegram_id: Identity,
    pub first_name: String,
    pub last_name: String,
    pub is_admin: bool,
    pub payed_lessons: i64,
    pub parent: Option<Identity>,
}

impl StudentRecord {
    pub fn full_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            _ => self.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub telegram_id: Identity,
    pub full_name: String,
}

/// A stored entity of any role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum EntityRecord {
    Admin(AdminRecord),
    Tutor(TutorRecord),
    Student(StudentRecord),
    Parent(ParentRecord),
}

/// Failure to build a record from typed field values
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldError {
    #[error("missing value for {field}")]
    Missing { field: String },
    #[error("{field} must be {expected}, got '{found}'")]
    WrongType {
        field: String,
        expected: String,
        found: String,
    },
}

impl EntityRecord {
    pub fn role(&self) -> EntityRole {
        match self {
            EntityRecord::Admin(_) => EntityRole::Admin,
            EntityRecord::Tutor(_) => EntityRole::Tutor,
            EntityRecord::Student(_) => EntityRole::Student,
            EntityRecord::Parent(_) => EntityRole::Parent,
        }
    }

    pub fn identity(&self) -> Identity {
        match self {
            EntityRecord::Admin(r) => r.telegram_id,
            EntityRecord::Tutor(r) => r.telegram_id,
            EntityRecord::Student(r) => r.telegram_id,
            EntityRecord::Parent(r) => r.telegram_id,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            EntityRecord::Admin(r) => r.name.clone(),
            EntityRecord::Tutor(r) => r.name.clone(),
            EntityRecord::Student(r) => r.full_name(),
            EntityRecord::Parent(r) => r.full_name.clone(),
        }
    }

    /// Explicit privilege flag of the record. Parents carry none.
    pub fn is_privileged(&self) -> bool {
        match self {
            EntityRecord::Admin(r) => r.is_admin,
            EntityRecord::Tutor(r) => r.is_admin,
            EntityRecord::Student(r) => r.is_admin,
            EntityRecord::Parent(_) => false,
        }
    }

    /// Record for a registered user, named as they typed it ("Surname Name")
    pub fn from_staged(role: EntityRole, identity: Identity, name: &str) -> Self {
        let name = name.trim();
        match role {
            EntityRole::Admin => EntityRecord::Admin(AdminRecord {
                telegram_id: identity,
                name: name.to_string(),
                is_admin: true,
            }),
            EntityRole::Tutor => EntityRecord::Tutor(TutorRecord {
                telegram_id: identity,
                name: name.to_string(),
                is_admin: false,
            }),
            EntityRole::Student => {
                let (last_name, first_name) = match name.split_once(char::is_whitespace) {
                    Some((last, first)) => (last.to_string(), first.trim().to_string()),
                    None => (name.to_string(), String::new()),
                };
                EntityRecord::Student(StudentRecord {
                    telegram_id: identity,
                    first_name,
                    last_name,
                    is_admin: false,
                    payed_lessons: 0,
                    parent: None,
                })
            }
            EntityRole::Parent => EntityRecord::Parent(ParentRecord {
                telegram_id: identity,
                full_name: name.to_string(),
            }),
        }
    }

    /// Build a record from values aligned with `role.entry_fields()`
    pub fn from_fields(role: EntityRole, values: &[EnteredField]) -> Result<Self, FieldError> {
        let fields = FieldReader {
            names: role.entry_fields(),
            values,
        };
        let telegram_id = Identity(fields.int("telegram_id")?);
        let record = match role {
            EntityRole::Admin => EntityRecord::Admin(AdminRecord {
                telegram_id,
                name: fields.text("name")?,
                is_admin: true,
            }),
            EntityRole::Tutor => EntityRecord::Tutor(TutorRecord {
                telegram_id,
                name: fields.text("name")?,
                is_admin: fields.bool("is_admin")?,
            }),
            EntityRole::Student => EntityRecord::Student(StudentRecord {
                telegram_id,
                first_name: fields.text("first_name")?,
                last_name: fields.text("last_name")?,
                is_admin: false,
                payed_lessons: 0,
                parent: None,
            }),
            EntityRole::Parent => EntityRecord::Parent(ParentRecord {
                telegram_id,
                full_name: fields.text("full_name")?,
            }),
        };
        Ok(record)
    }
}

struct FieldReader<'a> {
    names: &'static [&'static str],
    values: &'a [EnteredField],
}

impl FieldReader<'_> {
    fn get(&self, field: &str) -> Result<&EnteredField, FieldError> {
        self.names
            .iter()
            .position(|name| *name == field)
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| FieldError::Missing {
                field: field.to_string(),
            })
    }

    fn wrong_type(field: &str, expected: &str, found: &FieldValue) -> FieldError {
        FieldError::WrongType {
            field: field.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// "1" and "0" read as booleans first; an integer column takes them as numbers
    fn int(&self, field: &str) -> Result<i64, FieldError> {
        match &self.get(field)?.value {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Bool(v) => Ok(i64::from(*v)),
            other => Err(Self::wrong_type(field, "an integer", other)),
        }
    }

    fn bool(&self, field: &str) -> Result<bool, FieldError> {
        match &self.get(field)?.value {
            FieldValue::Bool(v) => Ok(*v),
            other => Err(Self::wrong_type(field, "yes/no", other)),
        }
    }

    fn text(&self, field: &str) -> Result<String, FieldError> {
        Ok(self.get(field)?.raw.clone())
    }
}
