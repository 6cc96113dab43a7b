use crate::db;
use crate::enrollment::ReenrollmentPolicy;
use crate::grading::{ComponentWeights, ScoreValidation, WeightPolicy};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsSection {
    Grading,
    Enrollment,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 2] = [Self::Grading, Self::Enrollment];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "enrollment" => Some(Self::Enrollment),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Enrollment => "enrollment",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "settings.grading",
            Self::Enrollment => "settings.enrollment",
        }
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::Grading => json!({
            "weightPolicy": WeightPolicy::default().code(),
            "customWeights": null,
            "scoreValidation": ScoreValidation::default().code()
        }),
        SettingsSection::Enrollment => json!({
            "reenrollment": ReenrollmentPolicy::default().code()
        }),
    }
}

/// Stored section merged over defaults, so fields added later pick up their default.
pub fn load_section(conn: &Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut out = default_section(section);
    if let Some(Value::Object(stored)) = db::settings_get_json(conn, section.key())? {
        if let Some(obj) = out.as_object_mut() {
            for (k, v) in stored {
                obj.insert(k, v);
            }
        }
    }
    Ok(out)
}

pub fn save_section(conn: &Connection, section: SettingsSection, value: &Value) -> anyhow::Result<()> {
    db::settings_set_json(conn, section.key(), value)
}

fn parse_custom_weights(v: &Value) -> Result<ComponentWeights, String> {
    let w: ComponentWeights = serde_json::from_value(v.clone()).map_err(|_| {
        "customWeights must be an object with numeric attendance, midterm, assignment, final"
            .to_string()
    })?;
    w.validate().map_err(|e| e.to_string())?;
    Ok(w)
}

/// Applies a validated patch in place. A `custom` weight policy must end up
/// with a weight vector, either already stored or in the same patch.
pub fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SettingsSection::Grading => match k.as_str() {
                "weightPolicy" => {
                    let s = v.as_str().ok_or("weightPolicy must be string")?;
                    if !matches!(s, "standard" | "finalHeavy" | "custom") {
                        return Err(
                            "weightPolicy must be one of: standard, finalHeavy, custom".into()
                        );
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                "customWeights" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        let w = parse_custom_weights(v)?;
                        obj.insert(k.clone(), json!(w));
                    }
                }
                "scoreValidation" => {
                    let s = v.as_str().ok_or("scoreValidation must be string")?;
                    if ScoreValidation::parse(s).is_none() {
                        return Err("scoreValidation must be one of: lenient, strict".into());
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SettingsSection::Enrollment => match k.as_str() {
                "reenrollment" => {
                    let s = v.as_str().ok_or("reenrollment must be string")?;
                    if ReenrollmentPolicy::parse(s).is_none() {
                        return Err(
                            "reenrollment must be one of: never, afterCancellation".into()
                        );
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                _ => return Err(format!("unknown enrollment field: {}", k)),
            },
        }
    }

    if section == SettingsSection::Grading
        && obj.get("weightPolicy").and_then(|v| v.as_str()) == Some("custom")
        && obj.get("customWeights").map(|v| v.is_null()).unwrap_or(true)
    {
        return Err("weightPolicy custom requires customWeights".into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradingSettings {
    pub weight_policy: WeightPolicy,
    pub score_validation: ScoreValidation,
}

impl GradingSettings {
    /// Unknown or incomplete stored values fall back to the defaults.
    pub fn from_value(v: &Value) -> Self {
        let custom = v
            .get("customWeights")
            .filter(|w| !w.is_null())
            .and_then(|w| parse_custom_weights(w).ok());
        let weight_policy = v
            .get("weightPolicy")
            .and_then(|p| p.as_str())
            .and_then(|p| WeightPolicy::parse(p, custom))
            .unwrap_or_default();
        let score_validation = v
            .get("scoreValidation")
            .and_then(|s| s.as_str())
            .and_then(ScoreValidation::parse)
            .unwrap_or_default();
        Self {
            weight_policy,
            score_validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnrollmentSettings {
    pub reenrollment: ReenrollmentPolicy,
}

impl EnrollmentSettings {
    pub fn from_value(v: &Value) -> Self {
        let reenrollment = v
            .get("reenrollment")
            .and_then(|s| s.as_str())
            .and_then(ReenrollmentPolicy::parse)
            .unwrap_or_default();
        Self { reenrollment }
    }
}

pub fn load_grading(conn: &Connection) -> anyhow::Result<GradingSettings> {
    Ok(GradingSettings::from_value(&load_section(
        conn,
        SettingsSection::Grading,
    )?))
}

pub fn load_enrollment(conn: &Connection) -> anyhow::Result<EnrollmentSettings> {
    Ok(EnrollmentSettings::from_value(&load_section(
        conn,
        SettingsSection::Enrollment,
    )?))
}
