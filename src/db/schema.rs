//! Database schema

use crate::identity::EntityRole;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS admins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    is_admin BOOLEAN NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS tutors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    is_admin BOOLEAN NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS parents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    full_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    is_admin BOOLEAN NOT NULL DEFAULT 0,
    payed_lessons INTEGER NOT NULL DEFAULT 0,
    parent_telegram_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_students_parent ON students(parent_telegram_id);

CREATE TABLE IF NOT EXISTS student_tutor (
    student_telegram_id INTEGER NOT NULL,
    tutor_telegram_id INTEGER NOT NULL,
    PRIMARY KEY (student_telegram_id, tutor_telegram_id)
);

CREATE INDEX IF NOT EXISTS idx_student_tutor_tutor ON student_tutor(tutor_telegram_id);

-- Registered identities waiting for a role, in arrival order
CREATE TABLE IF NOT EXISTS stack (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    fullname TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER NOT NULL,
    parent_name TEXT NOT NULL,
    student_id INTEGER NOT NULL,
    student_name TEXT NOT NULL,
    lessons INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_checked BOOLEAN NOT NULL DEFAULT 0,
    -- NULL until a reviewer decides
    is_approved BOOLEAN,
    approved_by_admin_id INTEGER,
    approved_by_admin_name TEXT,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_payments_open ON pending_payments(is_approved, id);
";

/// Table holding one role's records
pub fn table_for(role: EntityRole) -> &'static str {
    match role {
        EntityRole::Admin => "admins",
        EntityRole::Tutor => "tutors",
        EntityRole::Student => "students",
        EntityRole::Parent => "parents",
    }
}

/// Columns selected for a role, in the order the row mappers expect
pub fn columns_for(role: EntityRole) -> &'static str {
    match role {
        EntityRole::Admin | EntityRole::Tutor => "telegram_id, name, is_admin",
        EntityRole::Student => {
            "telegram_id, first_name, last_name, is_admin, payed_lessons, parent_telegram_id"
        }
        EntityRole::Parent => "telegram_id, full_name",
    }
}

pub const PAYMENT_COLUMNS: &str =
    "id, parent_id, parent_name, student_id, student_name, lessons, file_path, created_at, is_checked";
