//! Database module
//!
//! Persistence for entity records, the staging list and payments.

mod schema;

pub use schema::SCHEMA;
use schema::{columns_for, table_for, PAYMENT_COLUMNS};

use crate::approval::{Decision, NewPayment, PaymentId, PendingPayment, Resolution};
use crate::identity::{
    AdminRecord, EntityRecord, EntityRole, Identity, ParentRecord, StudentRecord, TutorRecord,
};
use crate::state_machine::StagedUser;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("{role} {identity} already exists")]
    EntityExists { role: EntityRole, identity: Identity },
    #[error("{role} {identity} not found")]
    EntityNotFound { role: EntityRole, identity: Identity },
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),
    #[error("Payment already settled: {0}")]
    PaymentSettled(PaymentId),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Entity Operations ====================

    pub fn find_entity(&self, role: EntityRole, identity: Identity) -> DbResult<Option<EntityRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} WHERE telegram_id = ?1",
            columns_for(role),
            table_for(role)
        );
        let record = conn
            .query_row(&sql, params![identity.0], |row| parse_entity_row(role, row))
            .optional()?;
        Ok(record)
    }

    pub fn insert_entity(&self, record: &EntityRecord) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let result = match record {
            EntityRecord::Admin(r) => conn.execute(
                "INSERT INTO admins (telegram_id, name, is_admin) VALUES (?1, ?2, ?3)",
                params![r.telegram_id.0, r.name, r.is_admin],
            ),
            EntityRecord::Tutor(r) => conn.execute(
                "INSERT INTO tutors (telegram_id, name, is_admin) VALUES (?1, ?2, ?3)",
                params![r.telegram_id.0, r.name, r.is_admin],
            ),
            EntityRecord::Student(r) => conn.execute(
                "INSERT INTO students (telegram_id, first_name, last_name, is_admin, payed_lessons, parent_telegram_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    r.telegram_id.0,
                    r.first_name,
                    r.last_name,
                    r.is_admin,
                    r.payed_lessons,
                    r.parent.map(|p| p.0)
                ],
            ),
            EntityRecord::Parent(r) => conn.execute(
                "INSERT INTO parents (telegram_id, full_name) VALUES (?1, ?2)",
                params![r.telegram_id.0, r.full_name],
            ),
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(DbError::EntityExists {
                role: record.role(),
                identity: record.identity(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false if there was no such record
    pub fn delete_entity(&self, role: EntityRole, identity: Identity) -> DbResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let sql = format!("DELETE FROM {} WHERE telegram_id = ?1", table_for(role));
        let deleted = tx.execute(&sql, params![identity.0])? > 0;
        if deleted {
            match role {
                EntityRole::Student => {
                    tx.execute(
                        "DELETE FROM student_tutor WHERE student_telegram_id = ?1",
                        params![identity.0],
                    )?;
                }
                EntityRole::Tutor => {
                    tx.execute(
                        "DELETE FROM student_tutor WHERE tutor_telegram_id = ?1",
                        params![identity.0],
                    )?;
                }
                EntityRole::Parent => {
                    tx.execute(
                        "UPDATE students SET parent_telegram_id = NULL WHERE parent_telegram_id = ?1",
                        params![identity.0],
                    )?;
                }
                EntityRole::Admin => {}
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    // ==================== Staging Operations ====================

    /// Idempotent. Returns false if the identity was already staged.
    pub fn stage_user(&self, identity: Identity, name: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO stack (telegram_id, fullname) VALUES (?1, ?2)",
            params![identity.0, name],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_staged(&self) -> DbResult<Vec<StagedUser>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT telegram_id, fullname FROM stack ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(StagedUser {
                identity: Identity(row.get(0)?),
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns true only for the call that actually removed the entry
    pub fn unstage_user(&self, identity: Identity) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM stack WHERE telegram_id = ?1", params![identity.0])?;
        Ok(removed > 0)
    }

    // ==================== Student Operations ====================

    pub fn students_of_parent(&self, parent: Identity) -> DbResult<Vec<StudentRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM students WHERE parent_telegram_id = ?1 ORDER BY telegram_id",
            columns_for(EntityRole::Student)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent.0], parse_student_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn students_of_tutor(&self, tutor: Identity) -> DbResult<Vec<StudentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.telegram_id, s.first_name, s.last_name, s.is_admin, s.payed_lessons, s.parent_telegram_id
             FROM students s
             JOIN student_tutor st ON st.student_telegram_id = s.telegram_id
             WHERE st.tutor_telegram_id = ?1
             ORDER BY s.telegram_id",
        )?;
        let rows = stmt.query_map(params![tutor.0], parse_student_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Take one lesson from each student. All or nothing.
    pub fn debit_lessons(&self, students: &[Identity]) -> DbResult<Vec<StudentRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut updated = Vec::with_capacity(students.len());
        {
            let sql = format!(
                "UPDATE students SET payed_lessons = payed_lessons - 1 WHERE telegram_id = ?1
                 RETURNING {}",
                columns_for(EntityRole::Student)
            );
            let mut stmt = tx.prepare(&sql)?;
            for &student in students {
                let record = stmt
                    .query_row(params![student.0], parse_student_row)
                    .optional()?
                    .ok_or(DbError::EntityNotFound {
                        role: EntityRole::Student,
                        identity: student,
                    })?;
                updated.push(record);
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn link_parent(&self, student: Identity, parent: Identity) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        require_entity(&tx, EntityRole::Parent, parent)?;
        let updated = tx.execute(
            "UPDATE students SET parent_telegram_id = ?2 WHERE telegram_id = ?1",
            params![student.0, parent.0],
        )?;
        if updated == 0 {
            return Err(DbError::EntityNotFound {
                role: EntityRole::Student,
                identity: student,
            });
        }
        tx.commit()?;
        Ok(())
    }

    pub fn link_tutor(&self, student: Identity, tutor: Identity) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        require_entity(&tx, EntityRole::Student, student)?;
        require_entity(&tx, EntityRole::Tutor, tutor)?;
        tx.execute(
            "INSERT OR IGNORE INTO student_tutor (student_telegram_id, tutor_telegram_id) VALUES (?1, ?2)",
            params![student.0, tutor.0],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Payment Operations ====================

    pub fn insert_payment(&self, payment: NewPayment) -> DbResult<PendingPayment> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO pending_payments (parent_id, parent_name, student_id, student_name, lessons, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                payment.parent.0,
                payment.parent_name,
                payment.student.0,
                payment.student_name,
                payment.lessons,
                payment.file_path,
                now.to_rfc3339()
            ],
        )?;
        let id = PaymentId(conn.last_insert_rowid());
        Ok(PendingPayment::from_new(id, payment, now))
    }

    pub fn mark_payment_checked(&self, id: PaymentId) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE pending_payments SET is_checked = 1 WHERE id = ?1",
            params![id.0],
        )?;
        if updated == 0 {
            return Err(DbError::PaymentNotFound(id));
        }
        Ok(())
    }

    /// Record a decision and, for an approval, credit the student, in one transaction.
    /// Only a payment without a decision can be settled.
    pub fn settle_payment(&self, payment: &PendingPayment, resolution: &Resolution) -> DbResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let approved = resolution.decision == Decision::Approve;
        let updated = tx.execute(
            "UPDATE pending_payments
             SET is_approved = ?2, approved_by_admin_id = ?3, approved_by_admin_name = ?4, resolved_at = ?5
             WHERE id = ?1 AND is_approved IS NULL",
            params![
                payment.id.0,
                approved,
                resolution.resolver.0,
                resolution.resolver_name,
                resolution.resolved_at.to_rfc3339()
            ],
        )?;
        if updated == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM pending_payments WHERE id = ?1)",
                params![payment.id.0],
                |row| row.get(0),
            )?;
            return Err(if exists {
                DbError::PaymentSettled(payment.id)
            } else {
                DbError::PaymentNotFound(payment.id)
            });
        }

        if approved {
            let credited = tx.execute(
                "UPDATE students SET payed_lessons = payed_lessons + ?2 WHERE telegram_id = ?1",
                params![payment.student.0, payment.lessons],
            )?;
            if credited == 0 {
                // Dropping the transaction rolls back the decision too
                return Err(DbError::EntityNotFound {
                    role: EntityRole::Student,
                    identity: payment.student,
                });
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Payments without a decision, oldest first
    pub fn unresolved_payments(&self) -> DbResult<Vec<PendingPayment>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM pending_payments WHERE is_approved IS NULL ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], parse_payment_row)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row??);
        }
        Ok(payments)
    }

    /// Stored decision for a payment, if any
    #[allow(dead_code)] // Used in tests
    pub fn payment_resolution(&self, id: PaymentId) -> DbResult<Option<Resolution>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT is_approved, approved_by_admin_id, approved_by_admin_name, resolved_at
                 FROM pending_payments WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, Option<bool>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(DbError::PaymentNotFound(id))?;

        let (Some(approved), Some(resolver), resolver_name, resolved_at) = row else {
            return Ok(None);
        };
        Ok(Some(Resolution {
            decision: if approved {
                Decision::Approve
            } else {
                Decision::Decline
            },
            resolver: Identity(resolver),
            resolver_name: resolver_name.unwrap_or_default(),
            resolved_at: resolved_at.as_deref().map_or_else(Utc::now, parse_datetime),
        }))
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn require_entity(conn: &Connection, role: EntityRole, identity: Identity) -> DbResult<()> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE telegram_id = ?1)",
        table_for(role)
    );
    let exists: bool = conn.query_row(&sql, params![identity.0], |row| row.get(0))?;
    if exists {
        Ok(())
    } else {
        Err(DbError::EntityNotFound { role, identity })
    }
}

fn parse_entity_row(role: EntityRole, row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(match role {
        EntityRole::Admin => EntityRecord::Admin(AdminRecord {
            telegram_id: Identity(row.get(0)?),
            name: row.get(1)?,
            is_admin: row.get(2)?,
        }),
        EntityRole::Tutor => EntityRecord::Tutor(TutorRecord {
            telegram_id: Identity(row.get(0)?),
            name: row.get(1)?,
            is_admin: row.get(2)?,
        }),
        EntityRole::Student => EntityRecord::Student(parse_student_row(row)?),
        EntityRole::Parent => EntityRecord::Parent(ParentRecord {
            telegram_id: Identity(row.get(0)?),
            full_name: row.get(1)?,
        }),
    })
}

fn parse_student_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        telegram_id: Identity(row.get(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        is_admin: row.get(3)?,
        payed_lessons: row.get(4)?,
        parent: row.get::<_, Option<i64>>(5)?.map(Identity),
    })
}

fn parse_payment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbResult<PendingPayment>> {
    let id = PaymentId(row.get(0)?);
    let lessons: i64 = row.get(5)?;
    let Ok(lessons) = u32::try_from(lessons) else {
        return Ok(Err(DbError::Corrupt(format!(
            "payment {id} has lesson count {lessons}"
        ))));
    };
    Ok(Ok(PendingPayment {
        id,
        parent: Identity(row.get(1)?),
        parent_name: row.get(2)?,
        student: Identity(row.get(3)?),
        student_name: row.get(4)?,
        lessons,
        file_path: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        checked: row.get(8)?,
    }))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
