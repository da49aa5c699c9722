use crate::calc::CalcError;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleEntry {
    pub letter: String,
    pub min_percentage: f64,
    pub gpa_points: f64,
}

/// A percentage -> letter -> GPA points table. Entries are kept sorted by
/// `min_percentage`, highest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScale {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub entries: Vec<ScaleEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub letter: String,
    pub gpa_points: f64,
}

impl GradingScale {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        is_default: bool,
        mut entries: Vec<ScaleEntry>,
    ) -> Self {
        sort_entries(&mut entries);
        Self {
            id: id.into(),
            name: name.into(),
            is_default,
            entries,
        }
    }

    /// First entry (highest threshold first) whose `min_percentage <= percentage`.
    /// Percentages below every threshold fall to the lowest entry. `None` only for an
    /// empty scale.
    pub fn letter_for(&self, percentage: f64) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.min_percentage <= percentage)
            .or_else(|| self.entries.last())
            .map(|e| e.letter.as_str())
    }

    pub fn lookup_points(&self, letter: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.letter == letter)
            .map(|e| e.gpa_points)
    }

    /// Unmapped letters resolve to 0.0; the lookup is logged so a misconfigured
    /// scale does not go unnoticed.
    pub fn points_for(&self, letter: &str) -> f64 {
        match self.lookup_points(letter) {
            Some(p) => p,
            None => {
                tracing::warn!(
                    scale_id = %self.id,
                    scale = %self.name,
                    letter,
                    "letter not mapped by grading scale; using 0.0 grade points"
                );
                0.0
            }
        }
    }

    pub fn resolve(&self, percentage: f64) -> Option<Resolution> {
        let letter = self.letter_for(percentage)?.to_string();
        let gpa_points = self.points_for(&letter);
        Some(Resolution { letter, gpa_points })
    }
}

fn sort_entries(entries: &mut [ScaleEntry]) {
    entries.sort_by(|a, b| {
        b.min_percentage
            .partial_cmp(&a.min_percentage)
            .unwrap_or(Ordering::Equal)
    });
}

pub fn validate_entries(entries: &[ScaleEntry]) -> Result<(), CalcError> {
    if entries.is_empty() {
        return Err(CalcError::new(
            "invalid_scale",
            "grading scale needs at least one entry",
        ));
    }
    let mut letters: HashSet<&str> = HashSet::new();
    let mut thresholds: Vec<f64> = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        let letter = e.letter.trim();
        if letter.is_empty() {
            return Err(CalcError::new("invalid_scale", "letter must not be blank")
                .with_details(json!({ "index": i })));
        }
        if !letters.insert(letter) {
            return Err(CalcError::new("invalid_scale", "duplicate letter")
                .with_details(json!({ "index": i, "letter": letter })));
        }
        if !e.min_percentage.is_finite() {
            return Err(CalcError::new("invalid_scale", "minPercentage must be finite")
                .with_details(json!({ "index": i })));
        }
        if thresholds.iter().any(|t| *t == e.min_percentage) {
            return Err(CalcError::new("invalid_scale", "duplicate minPercentage")
                .with_details(json!({ "index": i, "minPercentage": e.min_percentage })));
        }
        thresholds.push(e.min_percentage);
        if !e.gpa_points.is_finite() || e.gpa_points < 0.0 {
            return Err(CalcError::new("invalid_scale", "gpaPoints must be >= 0")
                .with_details(json!({ "index": i, "gpaPoints": e.gpa_points })));
        }
    }
    Ok(())
}

fn load_entries(conn: &Connection, scale_id: &str) -> Result<Vec<ScaleEntry>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT letter, min_percentage, gpa_points
             FROM grading_scale_entries
             WHERE scale_id = ?",
        )
        .map_err(CalcError::query)?;
    stmt.query_map([scale_id], |r| {
        Ok(ScaleEntry {
            letter: r.get(0)?,
            min_percentage: r.get(1)?,
            gpa_points: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

pub fn load_scale(conn: &Connection, scale_id: &str) -> Result<Option<GradingScale>, CalcError> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, name, is_default FROM grading_scales WHERE id = ?",
            [scale_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(CalcError::query)?;
    let Some((id, name, is_default)) = row else {
        return Ok(None);
    };
    let entries = load_entries(conn, &id)?;
    Ok(Some(GradingScale::new(id, name, is_default != 0, entries)))
}

/// The scale currently flagged default, if any. Callers pass the result into the
/// aggregator explicitly.
pub fn load_default_scale(conn: &Connection) -> Result<Option<GradingScale>, CalcError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM grading_scales WHERE is_default = 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::query)?;
    match id {
        Some(id) => load_scale(conn, &id),
        None => Ok(None),
    }
}

pub fn list_scales(conn: &Connection) -> Result<Vec<GradingScale>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id FROM grading_scales ORDER BY name")
        .map_err(CalcError::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::query)?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(s) = load_scale(conn, &id)? {
            out.push(s);
        }
    }
    Ok(out)
}

pub fn count_default_scales(conn: &Connection) -> Result<i64, CalcError> {
    conn.query_row(
        "SELECT COUNT(*) FROM grading_scales WHERE is_default = 1",
        [],
        |r| r.get(0),
    )
    .map_err(CalcError::query)
}

/// Inserts a scale and its entries. The first scale in a workspace becomes the default.
pub fn create_scale(
    conn: &Connection,
    name: &str,
    entries: Vec<ScaleEntry>,
    make_default: bool,
) -> Result<GradingScale, CalcError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CalcError::new("bad_params", "scale name must not be blank"));
    }
    validate_entries(&entries)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    let existing: i64 = tx
        .query_row("SELECT COUNT(*) FROM grading_scales", [], |r| r.get(0))
        .map_err(CalcError::query)?;
    let scale_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO grading_scales(id, name, is_default, created_at) VALUES(?, ?, 0, ?)",
        (&scale_id, name, chrono::Utc::now().to_rfc3339()),
    )
    .map_err(|e| {
        CalcError::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "grading_scales" }))
    })?;
    for e in &entries {
        tx.execute(
            "INSERT INTO grading_scale_entries(id, scale_id, letter, min_percentage, gpa_points)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &scale_id,
                e.letter.trim(),
                e.min_percentage,
                e.gpa_points,
            ),
        )
        .map_err(|e| {
            CalcError::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "grading_scale_entries" }))
        })?;
    }
    if make_default || existing == 0 {
        swap_default(&tx, &scale_id)?;
    }
    tx.commit()
        .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;

    tracing::info!(scale_id = %scale_id, name, entries = entries.len(), "grading scale created");
    load_scale(conn, &scale_id)?
        .ok_or_else(|| CalcError::new("not_found", "grading scale not found"))
}

fn swap_default(conn: &Connection, scale_id: &str) -> Result<(), CalcError> {
    conn.execute(
        "UPDATE grading_scales SET is_default = 0 WHERE is_default = 1",
        [],
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    let changed = conn
        .execute(
            "UPDATE grading_scales SET is_default = 1 WHERE id = ?",
            [scale_id],
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(CalcError::new("not_found", "grading scale not found")
            .with_details(json!({ "scaleId": scale_id })));
    }
    Ok(())
}

/// Clears every default flag and sets it on `scale_id` inside one transaction, so
/// other readers see either the old default or the new one. Cached enrollment grades
/// are left as they are; recomputing them is a separate administrative action.
pub fn set_default(conn: &Connection, scale_id: &str) -> Result<(), CalcError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = swap_default(&tx, scale_id) {
        let _ = tx.rollback();
        return Err(e);
    }
    tx.commit()
        .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;
    tracing::info!(scale_id, "default grading scale changed; cached enrollment grades not recomputed");
    Ok(())
}
