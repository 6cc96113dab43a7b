use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

/// Marker stored in `grades.status` for a passing grade.
pub const PASS_MARKER: &str = "Pass";
pub const FAIL_MARKER: &str = "Fail";

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Half-up rounding to one decimal: `floor(10*x + 0.5) / 10`.
///
/// The small bias keeps sums like `8.45` that land on `8.4499999999` from
/// rounding down.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5 + 1e-9).floor() / 10.0
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeInputError {
    #[error("{component} score {value} is outside 0..=10")]
    OutOfRange { component: &'static str, value: f64 },
    #[error("{component} weight must be a finite non-negative number (got {value})")]
    InvalidWeight { component: &'static str, value: f64 },
    #[error("weights must sum to 1 (got {sum})")]
    WeightSum { sum: f64 },
}

impl GradeInputError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "score_out_of_range",
            Self::InvalidWeight { .. } | Self::WeightSum { .. } => "bad_weights",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentWeights {
    pub attendance: f64,
    pub midterm: f64,
    pub assignment: f64,
    #[serde(rename = "final")]
    pub final_exam: f64,
}

impl ComponentWeights {
    pub fn validate(&self) -> Result<(), GradeInputError> {
        for (component, value) in self.named() {
            if !value.is_finite() || value < 0.0 {
                return Err(GradeInputError::InvalidWeight { component, value });
            }
        }
        let sum: f64 = self.named().iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(GradeInputError::WeightSum { sum });
        }
        Ok(())
    }

    fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("attendance", self.attendance),
            ("midterm", self.midterm),
            ("assignment", self.assignment),
            ("final", self.final_exam),
        ]
    }
}

/// Which weight vector turns the four components into a total.
///
/// Two vectors were in use side by side for the same grade rows; both are
/// kept as named policies so the workspace picks one explicitly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightPolicy {
    /// attendance 10%, midterm 30%, assignment 20%, final 40%.
    Standard,
    /// attendance 10%, midterm 20%, assignment 20%, final 50%.
    FinalHeavy,
    Custom(ComponentWeights),
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self::Standard
    }
}

impl WeightPolicy {
    pub fn weights(&self) -> ComponentWeights {
        match self {
            Self::Standard => ComponentWeights {
                attendance: 0.1,
                midterm: 0.3,
                assignment: 0.2,
                final_exam: 0.4,
            },
            Self::FinalHeavy => ComponentWeights {
                attendance: 0.1,
                midterm: 0.2,
                assignment: 0.2,
                final_exam: 0.5,
            },
            Self::Custom(w) => *w,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::FinalHeavy => "finalHeavy",
            Self::Custom(_) => "custom",
        }
    }

    /// `custom` needs the weight vector alongside; the named presets ignore it.
    pub fn parse(code: &str, custom: Option<ComponentWeights>) -> Option<Self> {
        match code {
            "standard" => Some(Self::Standard),
            "finalHeavy" => Some(Self::FinalHeavy),
            "custom" => custom.map(Self::Custom),
            _ => None,
        }
    }
}

/// Raw component scores. `None` contributes zero to the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScores {
    pub attendance: Option<f64>,
    pub midterm: Option<f64>,
    pub assignment: Option<f64>,
    #[serde(rename = "final")]
    pub final_exam: Option<f64>,
}

impl ComponentScores {
    fn named(&self) -> [(&'static str, Option<f64>); 4] {
        [
            ("attendance", self.attendance),
            ("midterm", self.midterm),
            ("assignment", self.assignment),
            ("final", self.final_exam),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreValidation {
    /// Out-of-range scores are accepted and flow into the total.
    #[default]
    Lenient,
    /// Scores outside `[0, 10]` are rejected before computing.
    Strict,
}

impl ScoreValidation {
    pub fn code(self) -> &'static str {
        match self {
            Self::Lenient => "lenient",
            Self::Strict => "strict",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "lenient" => Some(Self::Lenient),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn check(self, scores: &ComponentScores) -> Result<(), GradeInputError> {
        if self == Self::Lenient {
            return Ok(());
        }
        for (component, value) in scores.named() {
            let Some(value) = value else {
                continue;
            };
            if !(SCORE_MIN..=SCORE_MAX).contains(&value) {
                return Err(GradeInputError::OutOfRange { component, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    F,
}

impl LetterGrade {
    /// Thresholds are closed below: exactly 7.0 is a B.
    pub fn from_total(total: f64) -> Self {
        if total >= 8.5 {
            Self::A
        } else if total >= 7.0 {
            Self::B
        } else if total >= 5.5 {
            Self::C
        } else if total >= 4.0 {
            Self::D
        } else {
            Self::F
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }

    pub fn is_passing(self) -> bool {
        matches!(self, Self::A | Self::B | Self::C)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GradeStatus {
    Pass,
    Fail,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => PASS_MARKER,
            Self::Fail => FAIL_MARKER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOutcome {
    pub total_score: f64,
    pub letter_grade: LetterGrade,
    pub status: GradeStatus,
}

pub fn compute_grade(scores: &ComponentScores, weights: &ComponentWeights) -> GradeOutcome {
    let raw = scores.attendance.unwrap_or(0.0) * weights.attendance
        + scores.midterm.unwrap_or(0.0) * weights.midterm
        + scores.assignment.unwrap_or(0.0) * weights.assignment
        + scores.final_exam.unwrap_or(0.0) * weights.final_exam;
    let total_score = round_off_1_decimal(raw);
    let letter_grade = LetterGrade::from_total(total_score);
    let status = if letter_grade.is_passing() {
        GradeStatus::Pass
    } else {
        GradeStatus::Fail
    };
    GradeOutcome {
        total_score,
        letter_grade,
        status,
    }
}
