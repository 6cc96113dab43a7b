use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "registrar.sqlite3";

/// Concurrent sidecars on one workspace queue on the write lock for up to
/// this long before a statement fails with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        anyhow::bail!("workspace database refused WAL journal mode (got {})", mode);
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lecturers(
            id TEXT PRIMARY KEY,
            lecturer_code TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            gender TEXT,
            birth_date TEXT,
            phone TEXT,
            email TEXT,
            address TEXT,
            position TEXT,
            department_id TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lecturers_department ON lecturers(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS majors(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            department_id TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_majors_department ON majors(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_classes(
            id TEXT PRIMARY KEY,
            class_code TEXT NOT NULL UNIQUE,
            class_name TEXT NOT NULL,
            cohort INTEGER,
            major_id TEXT,
            lecturer_id TEXT,
            FOREIGN KEY(major_id) REFERENCES majors(id),
            FOREIGN KEY(lecturer_id) REFERENCES lecturers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_classes_major ON academic_classes(major_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_code TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            birth_date TEXT,
            email TEXT,
            cohort INTEGER,
            major_id TEXT,
            academic_class_id TEXT,
            status TEXT,
            updated_at TEXT,
            FOREIGN KEY(major_id) REFERENCES majors(id),
            FOREIGN KEY(academic_class_id) REFERENCES academic_classes(id)
        )",
        [],
    )?;
    ensure_students_status(&conn)?;
    ensure_column(&conn, "students", "academic_class_id", "TEXT REFERENCES academic_classes(id)")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_major ON students(major_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_academic_class ON students(academic_class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            course_code TEXT NOT NULL UNIQUE,
            course_name TEXT NOT NULL,
            credits REAL NOT NULL,
            department_id TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_department ON courses(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS major_courses(
            major_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester INTEGER,
            year INTEGER,
            is_required INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(major_id, course_id),
            FOREIGN KEY(major_id) REFERENCES majors(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_major_courses_course ON major_courses(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_sections(
            id TEXT PRIMARY KEY,
            section_code TEXT NOT NULL UNIQUE,
            course_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            start_date TEXT,
            end_date TEXT,
            lecturer_id TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(lecturer_id) REFERENCES lecturers(id)
        )",
        [],
    )?;
    ensure_column(&conn, "class_sections", "lecturer_id", "TEXT REFERENCES lecturers(id)")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_sections_course ON class_sections(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_section_id TEXT NOT NULL,
            status TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_section_id) REFERENCES class_sections(id),
            UNIQUE(student_id, class_section_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(class_section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL UNIQUE,
            attendance_score REAL,
            midterm_score REAL,
            assignment_score REAL,
            final_score REAL,
            total_score REAL,
            letter_grade TEXT,
            status TEXT,
            weight_policy TEXT NOT NULL DEFAULT 'standard',
            weights_json TEXT,
            updated_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    ensure_grades_weight_policy(&conn)?;
    ensure_grades_weights_json(&conn)?;

    Ok(conn)
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

fn ensure_students_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "status")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN status TEXT", [])?;
    Ok(())
}

fn ensure_grades_weight_policy(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "weight_policy")? {
        return Ok(());
    }
    // Rows written before policies were recorded were computed with the standard vector.
    conn.execute(
        "ALTER TABLE grades ADD COLUMN weight_policy TEXT NOT NULL DEFAULT 'standard'",
        [],
    )?;
    Ok(())
}

/// Adds a nullable column to a workspace created before it existed.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    Ok(())
}

/// Weight vector a `custom` grade was computed with; null for named policies.
fn ensure_grades_weights_json(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "weights_json")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN weights_json TEXT", [])?;
    Ok(())
}

/// Blocks until every WAL frame is in the main database file, so a plain
/// file copy sees all committed data.
pub fn checkpoint_wal(conn: &Connection) -> anyhow::Result<()> {
    let (busy, log_frames, checkpointed): (i64, i64, i64) = conn.query_row(
        "PRAGMA wal_checkpoint(FULL)",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    if busy != 0 || checkpointed < log_frames {
        anyhow::bail!(
            "wal checkpoint incomplete: {} of {} frames (busy={})",
            checkpointed,
            log_frames,
            busy
        );
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
