use serde::{Deserialize, Serialize};

/// Multiplier applied to the assessment mean to project the final score.
pub const PREDICTION_UPLIFT: f64 = 1.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// The scores a prediction is computed from. Each is on a 0-100 scale and
/// any of them may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AssessmentScores {
    pub internal: Option<f64>,
    pub series_1: Option<f64>,
    pub series_2: Option<f64>,
    pub assignment: Option<f64>,
}

impl AssessmentScores {
    fn provided(&self) -> impl Iterator<Item = f64> {
        [self.internal, self.series_1, self.series_2, self.assignment]
            .into_iter()
            .flatten()
    }
}

pub fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut n: usize = 0;
    let mut sum = 0.0;
    for v in values {
        n += 1;
        sum += v;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// `round(mean(provided) * 1.05)` clamped to `[0, 100]`.
pub fn predicted_score(scores: &AssessmentScores) -> Option<i64> {
    let avg = mean(scores.provided())?;
    let projected = (avg * PREDICTION_UPLIFT).round();
    Some(projected.clamp(0.0, 100.0) as i64)
}

/// Internal mark and attendance thresholds. A missing input never raises
/// the level on its own.
pub fn risk_level(internal: Option<f64>, attendance_pct: Option<f64>) -> RiskLevel {
    let below = |v: Option<f64>, limit: f64| v.map(|x| x < limit).unwrap_or(false);
    if below(internal, 70.0) || below(attendance_pct, 85.0) {
        RiskLevel::High
    } else if below(internal, 80.0) || below(attendance_pct, 90.0) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
    pub total: i64,
}

impl AttendanceCounts {
    pub fn merge(&mut self, other: &AttendanceCounts) {
        self.present += other.present;
        self.absent += other.absent;
        self.late += other.late;
        self.excused += other.excused;
        self.total += other.total;
    }

    pub fn percentage(&self) -> Option<i64> {
        attendance_percentage(self.present, self.total)
    }

    /// Unrounded `present / total * 100`. Risk thresholds compare against
    /// this, not the displayed percentage.
    pub fn ratio_pct(&self) -> Option<f64> {
        if self.total <= 0 {
            return None;
        }
        Some(self.present as f64 / self.total as f64 * 100.0)
    }
}

/// Only `present` counts towards attendance; `late` and `excused` do not.
pub fn attendance_percentage(present: i64, total: i64) -> Option<i64> {
    if total <= 0 {
        return None;
    }
    Some(((present as f64 / total as f64) * 100.0).round() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradePoint {
    pub grade: &'static str,
    pub point: f64,
}

const GRADE_BANDS: &[(f64, &str, f64)] = &[
    (90.0, "O", 10.0),
    (80.0, "A+", 9.0),
    (70.0, "A", 8.0),
    (60.0, "B+", 7.0),
    (50.0, "B", 6.0),
    (45.0, "C", 5.0),
    (40.0, "P", 4.0),
];

pub fn calculate_grade_point(score: f64) -> GradePoint {
    for &(floor, grade, point) in GRADE_BANDS {
        if score >= floor {
            return GradePoint { grade, point };
        }
    }
    GradePoint {
        grade: "F",
        point: 0.0,
    }
}

/// Final score used for grading: the external exam when it has been
/// entered, otherwise the prediction.
pub fn grading_basis(external: Option<f64>, predicted: Option<i64>) -> Option<f64> {
    external.or(predicted.map(|p| p as f64))
}

/// Credit-weighted mean grade point, rounded to 2 decimals.
pub fn sgpa<I>(results: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut credits_sum = 0.0;
    let mut weighted = 0.0;
    for (credits, point) in results {
        if credits <= 0.0 {
            continue;
        }
        credits_sum += credits;
        weighted += credits * point;
    }
    if credits_sum <= 0.0 {
        return None;
    }
    Some((weighted / credits_sum * 100.0).round() / 100.0)
}

pub fn validate_score(name: &str, v: Option<f64>) -> Result<Option<f64>, String> {
    match v {
        Some(x) if !x.is_finite() || !(0.0..=100.0).contains(&x) => {
            Err(format!("{} must be between 0 and 100", name))
        }
        other => Ok(other),
    }
}
