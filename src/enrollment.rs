use crate::db;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Active" => Some(Self::Active),
            "Completed" => Some(Self::Completed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Cancelled rows keep their (student, section) slot but free the seat.
    pub fn occupies_seat(self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Rows written with an unrecognised status are treated as holding a seat.
    fn from_db(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Active)
    }
}

/// Whether a cancelled enrollment frees the (student, section) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReenrollmentPolicy {
    /// Any existing row, cancelled or not, blocks a second enrollment.
    #[default]
    Never,
    /// A cancelled row is reactivated, subject to the capacity check.
    AfterCancellation,
}

impl ReenrollmentPolicy {
    pub fn code(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::AfterCancellation => "afterCancellation",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "never" => Some(Self::Never),
            "afterCancellation" => Some(Self::AfterCancellation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrollmentError {
    #[error("student is already enrolled in this class section")]
    DuplicateEnrollment,
    #[error("class section is full ({occupied}/{capacity})")]
    SectionFull { capacity: i64, occupied: i64 },
    #[error("enrollment has a grade and cannot be cancelled")]
    GradeExists,
    #[error("student not found")]
    StudentNotFound,
    #[error("class section not found")]
    SectionNotFound,
    #[error("enrollment not found")]
    EnrollmentNotFound,
}

impl EnrollmentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateEnrollment => "duplicate_enrollment",
            Self::SectionFull { .. } => "section_full",
            Self::GradeExists => "grade_exists",
            Self::StudentNotFound | Self::SectionNotFound | Self::EnrollmentNotFound => {
                "not_found"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error(transparent)]
    Rejected(#[from] EnrollmentError),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl AdmitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(e) => e.code(),
            Self::Db(_) => "db_tx_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingEnrollment {
    pub id: String,
    pub status: EnrollmentStatus,
}

/// What the guard sees about a section at decision time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatSnapshot {
    pub capacity: i64,
    pub occupied: i64,
    pub existing: Option<ExistingEnrollment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Create,
    Reactivate { enrollment_id: String },
}

/// Uniqueness first, then capacity. Capacity is inclusive: the seat numbered
/// `capacity` is still granted.
pub fn check_admission(
    snapshot: &SeatSnapshot,
    policy: ReenrollmentPolicy,
) -> Result<Admission, EnrollmentError> {
    let admission = match &snapshot.existing {
        None => Admission::Create,
        Some(prev)
            if prev.status == EnrollmentStatus::Cancelled
                && policy == ReenrollmentPolicy::AfterCancellation =>
        {
            Admission::Reactivate {
                enrollment_id: prev.id.clone(),
            }
        }
        Some(_) => return Err(EnrollmentError::DuplicateEnrollment),
    };
    if snapshot.occupied >= snapshot.capacity {
        return Err(EnrollmentError::SectionFull {
            capacity: snapshot.capacity,
            occupied: snapshot.occupied,
        });
    }
    Ok(admission)
}

/// Rules for moving an existing enrollment between statuses.
pub fn check_status_change(
    current: EnrollmentStatus,
    next: EnrollmentStatus,
    has_grade: bool,
    capacity: i64,
    occupied: i64,
) -> Result<(), EnrollmentError> {
    if next == EnrollmentStatus::Cancelled && current != EnrollmentStatus::Cancelled && has_grade {
        return Err(EnrollmentError::GradeExists);
    }
    if !current.occupies_seat() && next.occupies_seat() && occupied >= capacity {
        return Err(EnrollmentError::SectionFull { capacity, occupied });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admitted {
    pub enrollment_id: String,
    pub status: EnrollmentStatus,
    pub reactivated: bool,
    pub capacity: i64,
    pub occupied: i64,
}

/// Runs the duplicate and capacity checks and the write as one unit.
///
/// `BEGIN IMMEDIATE` takes the database write lock before the reads, so a
/// second admission for the same section waits for this one to commit and
/// then sees the updated seat count.
pub fn admit(
    conn: &Connection,
    student_id: &str,
    section_id: &str,
    policy: ReenrollmentPolicy,
) -> Result<Admitted, AdmitError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let student: Option<i64> = tx
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    if student.is_none() {
        return Err(EnrollmentError::StudentNotFound.into());
    }
    let Some(capacity) = section_capacity(&tx, section_id)? else {
        return Err(EnrollmentError::SectionNotFound.into());
    };

    let existing = tx
        .query_row(
            "SELECT id, status FROM enrollments WHERE student_id = ? AND class_section_id = ?",
            (student_id, section_id),
            |r| {
                let id: String = r.get(0)?;
                let status: String = r.get(1)?;
                Ok(ExistingEnrollment {
                    id,
                    status: EnrollmentStatus::from_db(&status),
                })
            },
        )
        .optional()?;
    let snapshot = SeatSnapshot {
        capacity,
        occupied: occupied_seats(&tx, section_id)?,
        existing,
    };

    let decision = match check_admission(&snapshot, policy) {
        Ok(d) => d,
        Err(e) => {
            debug!(student_id, section_id, reason = e.code(), "enrollment rejected");
            return Err(e.into());
        }
    };

    let (enrollment_id, reactivated) = match decision {
        Admission::Create => {
            let id = Uuid::new_v4().to_string();
            let inserted = tx.execute(
                "INSERT INTO enrollments(id, student_id, class_section_id, status, enrolled_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    &id,
                    student_id,
                    section_id,
                    EnrollmentStatus::Active.as_str(),
                    db::now_stamp(),
                ),
            );
            match inserted {
                Ok(_) => {}
                Err(e) if db::is_unique_violation(&e) => {
                    return Err(EnrollmentError::DuplicateEnrollment.into())
                }
                Err(e) => return Err(e.into()),
            }
            (id, false)
        }
        Admission::Reactivate { enrollment_id } => {
            tx.execute(
                "UPDATE enrollments SET status = ?, enrolled_at = ? WHERE id = ?",
                (
                    EnrollmentStatus::Active.as_str(),
                    db::now_stamp(),
                    &enrollment_id,
                ),
            )?;
            (enrollment_id, true)
        }
    };

    tx.commit()?;
    info!(
        student_id,
        section_id,
        enrollment_id = %enrollment_id,
        reactivated,
        seat = snapshot.occupied + 1,
        capacity,
        "enrollment admitted"
    );

    Ok(Admitted {
        enrollment_id,
        status: EnrollmentStatus::Active,
        reactivated,
        capacity,
        occupied: snapshot.occupied + 1,
    })
}

/// Status update under the same write lock as admission, so a reactivation
/// cannot take a seat that a concurrent admission just filled.
pub fn change_status(
    conn: &Connection,
    enrollment_id: &str,
    next: EnrollmentStatus,
) -> Result<EnrollmentStatus, AdmitError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT class_section_id, status FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((section_id, current_raw)) = row else {
        return Err(EnrollmentError::EnrollmentNotFound.into());
    };
    let current = EnrollmentStatus::from_db(&current_raw);

    let has_grade: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM grades WHERE enrollment_id = ?",
            [enrollment_id],
            |r| r.get(0),
        )
        .optional()?;
    let capacity = section_capacity(&tx, &section_id)?.unwrap_or(0);
    let occupied = occupied_seats(&tx, &section_id)?;

    check_status_change(current, next, has_grade.is_some(), capacity, occupied)?;

    tx.execute(
        "UPDATE enrollments SET status = ? WHERE id = ?",
        (next.as_str(), enrollment_id),
    )?;
    tx.commit()?;
    info!(
        enrollment_id,
        from = current.as_str(),
        to = next.as_str(),
        "enrollment status changed"
    );
    Ok(current)
}

pub fn occupied_seats(conn: &Connection, section_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE class_section_id = ? AND status <> ?",
        (section_id, EnrollmentStatus::Cancelled.as_str()),
        |r| r.get(0),
    )
}

fn section_capacity(conn: &Connection, section_id: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT capacity FROM class_sections WHERE id = ?",
        [section_id],
        |r| r.get(0),
    )
    .optional()
}
