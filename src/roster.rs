use crate::grading::{round_off_1_decimal, PASS_MARKER};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;

/// Semester order within an academic year: `1`, `2`, then summer (`Hè`).
/// Labels outside that set sort after summer, by label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Semester {
    First,
    Second,
    Summer,
    Other(String),
}

impl Semester {
    pub fn parse(label: &str) -> Self {
        let t = label.trim();
        match t.to_lowercase().as_str() {
            "1" => Self::First,
            "2" => Self::Second,
            "hè" | "he" | "summer" => Self::Summer,
            _ => Self::Other(t.to_string()),
        }
    }
}

/// Leading start year of a label such as `2023-2024`.
pub fn academic_year_start(label: &str) -> Option<i64> {
    let head: String = label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    head.parse().ok()
}

fn cmp_academic_year(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.trim(), b.trim());
    match (academic_year_start(a), academic_year_start(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Standing {
    Excellent,
    Good,
    Average,
    Weak,
}

impl Standing {
    pub fn from_average(avg: f64) -> Self {
        if avg >= 8.0 {
            Self::Excellent
        } else if avg >= 7.0 {
            Self::Good
        } else if avg >= 5.0 {
            Self::Average
        } else {
            Self::Weak
        }
    }
}

/// One graded course on a student's record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRow {
    pub grade_id: String,
    pub course_code: String,
    pub course_name: String,
    pub credits: f64,
    pub academic_year: String,
    pub semester: String,
    pub total_score: Option<f64>,
    pub letter_grade: Option<String>,
    pub status: Option<String>,
}

impl TranscriptRow {
    fn gradable_score(&self) -> Option<f64> {
        self.total_score.filter(|v| v.is_finite())
    }

    fn passed(&self) -> bool {
        self.status.as_deref() == Some(PASS_MARKER)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WeightedSum {
    weighted: f64,
    credits: f64,
}

impl WeightedSum {
    fn add(&mut self, score: f64, credits: f64) {
        self.weighted += score * credits;
        self.credits += credits;
    }

    fn merge(&mut self, other: WeightedSum) {
        self.weighted += other.weighted;
        self.credits += other.credits;
    }

    fn average(self) -> f64 {
        if self.credits > 0.0 {
            self.weighted / self.credits
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterBucket {
    pub semester: String,
    pub academic_year: String,
    pub rows: Vec<TranscriptRow>,
    pub average: f64,
    pub average_rounded: f64,
    pub graded_credits: f64,
    pub credits_passed: f64,
    pub credits_failed: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSummary {
    pub academic_year: Option<String>,
    pub buckets: Vec<SemesterBucket>,
    pub average: f64,
    pub average_rounded: f64,
    pub total_credits: f64,
    pub credits_passed: f64,
    pub credits_failed: f64,
    pub standing: Standing,
}

/// Groups rows into semester buckets and computes credit-weighted averages.
///
/// Rows whose total score is missing or not a finite number are left out of
/// every average (numerator and denominator) but their credits still land
/// in the passed/failed tallies according to their status.
pub fn aggregate(rows: &[TranscriptRow], academic_year: Option<&str>) -> TranscriptSummary {
    let filter = academic_year.map(str::trim).filter(|s| !s.is_empty());

    let mut keyed: Vec<(Semester, &TranscriptRow)> = rows
        .iter()
        .filter(|r| filter.map(|y| r.academic_year.trim() == y).unwrap_or(true))
        .map(|r| (Semester::parse(&r.semester), r))
        .collect();
    keyed.sort_by(|(sa, a), (sb, b)| {
        cmp_academic_year(&a.academic_year, &b.academic_year).then_with(|| sa.cmp(sb))
    });

    let mut buckets: Vec<SemesterBucket> = Vec::new();
    let mut bucket_sums: Vec<WeightedSum> = Vec::new();
    let mut current_key: Option<(String, Semester)> = None;

    for (semester, row) in keyed {
        let key = (row.academic_year.trim().to_string(), semester);
        if current_key.as_ref() != Some(&key) {
            buckets.push(SemesterBucket {
                semester: row.semester.trim().to_string(),
                academic_year: key.0.clone(),
                rows: Vec::new(),
                average: 0.0,
                average_rounded: 0.0,
                graded_credits: 0.0,
                credits_passed: 0.0,
                credits_failed: 0.0,
            });
            bucket_sums.push(WeightedSum::default());
            current_key = Some(key);
        }
        let (Some(bucket), Some(sum)) = (buckets.last_mut(), bucket_sums.last_mut()) else {
            continue;
        };
        if let Some(score) = row.gradable_score() {
            sum.add(score, row.credits);
        }
        if row.passed() {
            bucket.credits_passed += row.credits;
        } else {
            bucket.credits_failed += row.credits;
        }
        bucket.rows.push(row.clone());
    }

    let mut overall = WeightedSum::default();
    let mut credits_passed = 0.0;
    let mut credits_failed = 0.0;
    for (bucket, sum) in buckets.iter_mut().zip(bucket_sums) {
        bucket.average = sum.average();
        bucket.average_rounded = round_off_1_decimal(bucket.average);
        bucket.graded_credits = sum.credits;
        credits_passed += bucket.credits_passed;
        credits_failed += bucket.credits_failed;
        overall.merge(sum);
    }

    let average = overall.average();
    TranscriptSummary {
        academic_year: filter.map(str::to_string),
        buckets,
        average,
        average_rounded: round_off_1_decimal(average),
        total_credits: overall.credits,
        credits_passed,
        credits_failed,
        standing: Standing::from_average(average),
    }
}

/// Academic years a student can have attended: cohort through the current
/// calendar year.
pub fn year_options(cohort: i64, current_year: i64) -> Vec<String> {
    (cohort..=current_year)
        .map(|y| format!("{}-{}", y, y + 1))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReportScope {
    Program,
    Year { number: i64 },
}

pub fn report_scope(academic_year: Option<&str>, cohort: Option<i64>) -> ReportScope {
    match (academic_year.and_then(academic_year_start), cohort) {
        (Some(start), Some(c)) => ReportScope::Year {
            number: start - c + 1,
        },
        _ => ReportScope::Program,
    }
}

/// Stored scores may come back as REAL, INTEGER or TEXT depending on who wrote them.
pub fn score_from_value(v: Value) -> Option<f64> {
    match v {
        Value::Real(f) => Some(f),
        Value::Integer(i) => Some(i as f64),
        Value::Text(s) => s.trim().parse::<f64>().ok(),
        Value::Null | Value::Blob(_) => None,
    }
}

pub fn load_student_rows(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<TranscriptRow>> {
    let mut stmt = conn.prepare(
        "SELECT g.id, c.course_code, c.course_name, c.credits,
                cs.academic_year, cs.semester,
                g.total_score, g.letter_grade, g.status
         FROM grades g
         JOIN enrollments e ON e.id = g.enrollment_id
         JOIN class_sections cs ON cs.id = e.class_section_id
         JOIN courses c ON c.id = cs.course_id
         WHERE e.student_id = ?
         ORDER BY c.course_code",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(TranscriptRow {
                grade_id: r.get(0)?,
                course_code: r.get(1)?,
                course_name: r.get(2)?,
                credits: r.get(3)?,
                academic_year: r.get(4)?,
                semester: r.get(5)?,
                total_score: score_from_value(r.get(6)?),
                letter_grade: r.get(7)?,
                status: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
