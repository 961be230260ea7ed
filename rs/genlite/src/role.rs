//! Role-bounded configuration resolver.
//!
//! Clamps user-supplied generation parameters to per-role min/default/max
//! envelopes. The envelopes are static data, built once at startup and
//! never mutated afterwards, so `RoleConfig` requires no lock.

use std::collections::HashMap;

/// Coarse authorization class derived from an opaque identity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anon,
    Normal,
    Pro,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::Normal => "normal",
            Role::Pro => "pro",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every numeric field a role envelope can bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ClipWidth,
    ClipHeight,
    NumFrames,
    NumInferenceSteps,
    ClipFramerate,
    ClipDurationSeconds,
    ClipPlaybackSpeed,
}

/// Orientation requested by the client for a generated clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Orientation {
    Landscape,
    Portrait,
}

/// The `(min, default, max)` triple bounding one field for one role.
/// Missing bounds mean unbounded on that side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Envelope {
    pub default: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Envelope {
    const fn fixed(value: f64) -> Self {
        Envelope { default: value, min: None, max: None }
    }

    const fn bounded(min: f64, default: f64, max: f64) -> Self {
        Envelope { default, min: Some(min), max: Some(max) }
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(min) = self.min {
            if v < min {
                v = min;
            }
        }
        if let Some(max) = self.max {
            if v > max {
                v = max;
            }
        }
        v
    }
}

/// A full set of field envelopes plus the scalar rendering-time cap, for one role.
#[derive(Debug, Clone)]
pub struct RoleEnvelope {
    fields: HashMap<Field, Envelope>,
    pub max_rendering_time_per_client_per_video_seconds: u32,
}

impl RoleEnvelope {
    fn new(fields: &[(Field, Envelope)], max_rendering_time_per_client_per_video_seconds: u32) -> Self {
        RoleEnvelope {
            fields: fields.iter().copied().collect(),
            max_rendering_time_per_client_per_video_seconds,
        }
    }
}

/// The static, process-lifetime map from role to envelope. Built once at
/// startup, read without a lock thereafter.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    envelopes: HashMap<Role, RoleEnvelope>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        use Field::*;

        let mut envelopes = HashMap::new();

        envelopes.insert(
            Role::Anon,
            RoleEnvelope::new(
                &[
                    (ClipWidth, Envelope::fixed(544.0)),
                    (ClipHeight, Envelope::fixed(320.0)),
                    (NumFrames, Envelope::bounded(9.0, 65.0, 65.0)),
                    (NumInferenceSteps, Envelope::bounded(2.0, 3.0, 3.0)),
                    (ClipFramerate, Envelope::bounded(8.0, 16.0, 16.0)),
                    (ClipDurationSeconds, Envelope::bounded(1.0, 2.0, 2.0)),
                    (ClipPlaybackSpeed, Envelope::fixed(0.7)),
                ],
                120,
            ),
        );

        envelopes.insert(
            Role::Normal,
            RoleEnvelope::new(
                &[
                    (ClipWidth, Envelope::bounded(544.0, 1152.0, 1152.0)),
                    (ClipHeight, Envelope::bounded(320.0, 640.0, 640.0)),
                    (NumFrames, Envelope::bounded(9.0, 81.0, 81.0)),
                    (NumInferenceSteps, Envelope::bounded(2.0, 4.0, 4.0)),
                    (ClipFramerate, Envelope::bounded(8.0, 25.0, 25.0)),
                    (ClipDurationSeconds, Envelope::bounded(1.0, 3.0, 3.0)),
                    (ClipPlaybackSpeed, Envelope::fixed(0.7)),
                ],
                900,
            ),
        );

        envelopes.insert(
            Role::Pro,
            RoleEnvelope::new(
                &[
                    (ClipWidth, Envelope::bounded(544.0, 1152.0, 1152.0)),
                    (ClipHeight, Envelope::bounded(320.0, 640.0, 640.0)),
                    (NumFrames, Envelope::bounded(9.0, 81.0, 81.0)),
                    (NumInferenceSteps, Envelope::bounded(2.0, 4.0, 4.0)),
                    (ClipFramerate, Envelope::bounded(8.0, 25.0, 25.0)),
                    (ClipDurationSeconds, Envelope::bounded(1.0, 3.0, 3.0)),
                    (ClipPlaybackSpeed, Envelope::fixed(0.7)),
                ],
                1200,
            ),
        );

        envelopes.insert(
            Role::Admin,
            RoleEnvelope::new(
                &[
                    (ClipWidth, Envelope::bounded(544.0, 1152.0, 1152.0)),
                    (ClipHeight, Envelope::bounded(320.0, 640.0, 640.0)),
                    (NumFrames, Envelope::bounded(9.0, 81.0, 129.0)),
                    (NumInferenceSteps, Envelope::bounded(2.0, 4.0, 4.0)),
                    (ClipFramerate, Envelope::bounded(8.0, 30.0, 60.0)),
                    (ClipDurationSeconds, Envelope::bounded(1.0, 2.0, 4.0)),
                    (ClipPlaybackSpeed, Envelope::bounded(0.7, 0.7, 1.0)),
                ],
                3600,
            ),
        );

        RoleConfig { envelopes }
    }
}

impl RoleConfig {
    pub fn envelope(&self, role: Role) -> &RoleEnvelope {
        self.envelopes.get(&role).expect("every role has an envelope")
    }

    /// Resolve a single field for a role, optionally clamping a user override.
    pub fn resolve(&self, role: Role, field: Field, user_override: Option<f64>) -> f64 {
        let envelope = self.envelope(role);
        let Some(bound) = envelope.fields.get(&field) else {
            return 0.0;
        };

        match user_override {
            Some(value) => {
                if bound.min.is_none() && bound.max.is_none() {
                    bound.default
                } else {
                    bound.clamp(value)
                }
            }
            None => bound.default,
        }
    }

    /// Swap width/height after clamping so landscape is wide and portrait is tall.
    pub fn orientation_adjust(width: f64, height: f64, orientation: Orientation) -> (f64, f64) {
        match orientation {
            Orientation::Landscape if height > width => (height, width),
            Orientation::Portrait if width > height => (height, width),
            _ => (width, height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_field_ignores_override() {
        let config = RoleConfig::default();
        // clip_width for anon has no min/max (fixed), so an override is ignored.
        let v = config.resolve(Role::Anon, Field::ClipWidth, Some(99_999.0));
        assert_eq!(v, 544.0);
    }

    #[test]
    fn clamps_to_role_envelope() {
        let config = RoleConfig::default();
        let width = config.resolve(Role::Normal, Field::ClipWidth, Some(99_999.0));
        let height = config.resolve(Role::Normal, Field::ClipHeight, Some(99_999.0));
        // normal role clamps 99999x99999 down to 1152x640.
        assert_eq!(width, 1152.0);
        assert_eq!(height, 640.0);
    }

    #[test]
    fn clamps_low_values_to_min() {
        let config = RoleConfig::default();
        let steps = config.resolve(Role::Admin, Field::NumInferenceSteps, Some(0.0));
        assert_eq!(steps, 2.0);
    }

    #[test]
    fn default_used_when_no_override() {
        let config = RoleConfig::default();
        let v = config.resolve(Role::Pro, Field::NumFrames, None);
        assert_eq!(v, 81.0);
    }

    #[test]
    fn orientation_swaps_after_clamp() {
        let (w, h) = RoleConfig::orientation_adjust(640.0, 1152.0, Orientation::Landscape);
        assert_eq!((w, h), (1152.0, 640.0));

        let (w, h) = RoleConfig::orientation_adjust(1152.0, 640.0, Orientation::Portrait);
        assert_eq!((w, h), (640.0, 1152.0));

        let (w, h) = RoleConfig::orientation_adjust(1152.0, 640.0, Orientation::Landscape);
        assert_eq!((w, h), (1152.0, 640.0));
    }

    #[test]
    fn admin_allows_wider_bounds_than_other_roles() {
        let config = RoleConfig::default();
        let frames = config.resolve(Role::Admin, Field::NumFrames, Some(129.0));
        assert_eq!(frames, 129.0);
        let frames_normal = config.resolve(Role::Normal, Field::NumFrames, Some(129.0));
        assert_eq!(frames_normal, 81.0);
    }
}
