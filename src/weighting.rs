use serde::Serialize;

/// Where an assessment's weight comes from. An explicit per-assessment weight always
/// wins over the category default.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum AssessmentWeight {
    Override { weight: f64 },
    Inherited { category_id: String, weight: f64 },
}

impl AssessmentWeight {
    pub fn resolve(override_weight: Option<f64>, category_id: &str, category_weight: f64) -> Self {
        match override_weight {
            Some(weight) => AssessmentWeight::Override { weight },
            None => AssessmentWeight::Inherited {
                category_id: category_id.to_string(),
                weight: category_weight,
            },
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            AssessmentWeight::Override { weight } => *weight,
            AssessmentWeight::Inherited { weight, .. } => *weight,
        }
    }
}

/// Aggregation bucket for a regular (non extra-credit) assessment. Inheriting
/// assessments share their category's bucket; an override stands alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightGroup {
    Category(String),
    Standalone(String),
}

impl WeightGroup {
    pub fn for_assessment(assessment_id: &str, weight: &AssessmentWeight) -> Self {
        match weight {
            AssessmentWeight::Override { .. } => WeightGroup::Standalone(assessment_id.to_string()),
            AssessmentWeight::Inherited { category_id, .. } => {
                WeightGroup::Category(category_id.clone())
            }
        }
    }
}

/// Late penalties are percentage points of the raw score; the result never goes below 0.
pub fn adjusted_score(score: f64, is_late: bool, late_penalty: Option<f64>) -> f64 {
    let adjusted = match late_penalty {
        Some(p) if is_late => score - score * (p / 100.0),
        _ => score,
    };
    adjusted.max(0.0)
}
