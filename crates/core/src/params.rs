//! Generation parameters: defaults, bounds, named presets and validation.
//!
//! A request arrives as a [`GenerationRequest`] where every field is optional.
//! [`GenerationRequest::resolve`] turns it into an immutable
//! [`GenerationParams`] snapshot using one precedence rule:
//! built-in defaults, then the preset bundle, then fields the caller supplied.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_VIDEO_LENGTH: u32 = 61;
pub const DEFAULT_FPS: u32 = 15;
pub const DEFAULT_INFERENCE_STEPS: u32 = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 1.0;
pub const DEFAULT_FLOW_SHIFT: f64 = 7.0;
pub const DEFAULT_EMBEDDED_GUIDANCE_SCALE: f64 = 6.0;

pub const RESOLUTION_RANGE: RangeInclusive<u32> = 256..=1280;
pub const VIDEO_LENGTH_RANGE: RangeInclusive<u32> = 13..=129;
pub const FPS_RANGE: RangeInclusive<u32> = 8..=30;
pub const INFERENCE_STEPS_RANGE: RangeInclusive<u32> = 10..=50;
pub const GUIDANCE_SCALE_RANGE: RangeInclusive<f64> = 1.0..=20.0;
pub const FLOW_SHIFT_RANGE: RangeInclusive<f64> = 0.0..=10.0;
pub const EMBEDDED_GUIDANCE_SCALE_RANGE: RangeInclusive<f64> = 1.0..=20.0;

/// Rough CPU cost of a single denoising step.
pub const ESTIMATED_SECONDS_PER_STEP: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("prompt must not be empty")]
    MissingPrompt,
    #[error("unknown preset '{0}' (expected one of: portrait_60s, portrait_30s, landscape_60s, landscape_30s)")]
    UnknownPreset(String),
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preset {
    #[serde(rename = "portrait_60s")]
    Portrait60s,
    #[serde(rename = "portrait_30s")]
    Portrait30s,
    #[serde(rename = "landscape_60s")]
    Landscape60s,
    #[serde(rename = "landscape_30s")]
    Landscape30s,
}

/// The fixed values a preset imposes on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresetBundle {
    pub width: u32,
    pub height: u32,
    pub video_length: u32,
    pub fps: u32,
    pub num_inference_steps: u32,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Portrait60s,
        Preset::Portrait30s,
        Preset::Landscape60s,
        Preset::Landscape30s,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Portrait60s => "portrait_60s",
            Preset::Portrait30s => "portrait_30s",
            Preset::Landscape60s => "landscape_60s",
            Preset::Landscape30s => "landscape_30s",
        }
    }

    pub fn bundle(self) -> PresetBundle {
        match self {
            Preset::Portrait60s => PresetBundle {
                width: 544,
                height: 960,
                video_length: 129,
                fps: 24,
                num_inference_steps: 30,
            },
            Preset::Portrait30s => PresetBundle {
                width: 544,
                height: 960,
                video_length: 65,
                fps: 24,
                num_inference_steps: 30,
            },
            Preset::Landscape60s => PresetBundle {
                width: 960,
                height: 544,
                video_length: 129,
                fps: 24,
                num_inference_steps: 30,
            },
            Preset::Landscape30s => PresetBundle {
                width: 960,
                height: 544,
                video_length: 65,
                fps: 24,
                num_inference_steps: 30,
            },
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Preset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == normalized)
            .ok_or_else(|| ParamError::UnknownPreset(s.to_string()))
    }
}

/// A generation request as submitted. Absent fields fall back to the preset
/// bundle (if any) and then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_shift: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_guidance_scale: Option<f64>,
}

/// Fully resolved, validated parameters. Never mutated once a job holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub video_length: u32,
    pub fps: u32,
    pub seed: Option<i64>,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub flow_shift: f64,
    pub embedded_guidance_scale: f64,
    pub preset: Option<Preset>,
}

impl GenerationRequest {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// Field-wise merge where every field set in `overrides` wins over `self`.
    pub fn merge_overrides(self, overrides: GenerationRequest) -> GenerationRequest {
        GenerationRequest {
            prompt: overrides.prompt.or(self.prompt),
            preset: overrides.preset.or(self.preset),
            width: overrides.width.or(self.width),
            height: overrides.height.or(self.height),
            video_length: overrides.video_length.or(self.video_length),
            fps: overrides.fps.or(self.fps),
            seed: overrides.seed.or(self.seed),
            num_inference_steps: overrides.num_inference_steps.or(self.num_inference_steps),
            guidance_scale: overrides.guidance_scale.or(self.guidance_scale),
            flow_shift: overrides.flow_shift.or(self.flow_shift),
            embedded_guidance_scale: overrides
                .embedded_guidance_scale
                .or(self.embedded_guidance_scale),
        }
    }

    pub fn resolve(&self) -> Result<GenerationParams, ParamError> {
        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .ok_or(ParamError::MissingPrompt)?
            .to_string();

        let preset = self
            .preset
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .map(Preset::from_str)
            .transpose()?;

        let base = preset.map(Preset::bundle).unwrap_or(PresetBundle {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            video_length: DEFAULT_VIDEO_LENGTH,
            fps: DEFAULT_FPS,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
        });

        let params = GenerationParams {
            prompt,
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            video_length: self.video_length.unwrap_or(base.video_length),
            fps: self.fps.unwrap_or(base.fps),
            seed: self.seed,
            num_inference_steps: self.num_inference_steps.unwrap_or(base.num_inference_steps),
            guidance_scale: self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
            flow_shift: self.flow_shift.unwrap_or(DEFAULT_FLOW_SHIFT),
            embedded_guidance_scale: self
                .embedded_guidance_scale
                .unwrap_or(DEFAULT_EMBEDDED_GUIDANCE_SCALE),
            preset,
        };

        params.validate()?;
        Ok(params)
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        check_range("width", self.width, &RESOLUTION_RANGE)?;
        check_range("height", self.height, &RESOLUTION_RANGE)?;
        check_range("video_length", self.video_length, &VIDEO_LENGTH_RANGE)?;
        check_range("fps", self.fps, &FPS_RANGE)?;
        check_range(
            "num_inference_steps",
            self.num_inference_steps,
            &INFERENCE_STEPS_RANGE,
        )?;
        check_range("guidance_scale", self.guidance_scale, &GUIDANCE_SCALE_RANGE)?;
        check_range("flow_shift", self.flow_shift, &FLOW_SHIFT_RANGE)?;
        check_range(
            "embedded_guidance_scale",
            self.embedded_guidance_scale,
            &EMBEDDED_GUIDANCE_SCALE_RANGE,
        )?;
        Ok(())
    }

    pub fn estimated_seconds(&self) -> u32 {
        self.num_inference_steps
            .saturating_mul(ESTIMATED_SECONDS_PER_STEP)
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    range: &RangeInclusive<T>,
) -> Result<(), ParamError>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ParamError::OutOfRange {
            field,
            value: value.to_string(),
            min: range.start().to_string(),
            max: range.end().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_else_is_given() {
        let params = GenerationRequest::with_prompt("a cat walks on the grass")
            .resolve()
            .expect("defaults are valid");

        assert_eq!(params.width, 640);
        assert_eq!(params.height, 480);
        assert_eq!(params.video_length, 61);
        assert_eq!(params.fps, 15);
        assert_eq!(params.num_inference_steps, 30);
        assert_eq!(params.guidance_scale, 1.0);
        assert_eq!(params.flow_shift, 7.0);
        assert_eq!(params.embedded_guidance_scale, 6.0);
        assert_eq!(params.seed, None);
        assert_eq!(params.preset, None);
    }

    #[test]
    fn portrait_60s_overrides_default_resolution_and_timing() {
        let request = GenerationRequest {
            preset: Some("portrait_60s".to_string()),
            ..GenerationRequest::with_prompt("ferret tea party")
        };
        let params = request.resolve().expect("preset is valid");

        assert_eq!(params.width, 544);
        assert_eq!(params.height, 960);
        assert_eq!(params.fps, 24);
        assert_eq!(params.video_length, 129);
        assert_eq!(params.preset, Some(Preset::Portrait60s));
    }

    #[test]
    fn landscape_30s_yields_wide_short_clip() {
        let request = GenerationRequest {
            preset: Some("landscape_30s".to_string()),
            ..GenerationRequest::with_prompt("mountain timelapse")
        };
        let params = request.resolve().expect("preset is valid");

        assert_eq!(params.width, 960);
        assert_eq!(params.height, 544);
        assert_eq!(params.video_length, 65);
    }

    #[test]
    fn explicit_fields_win_over_preset_bundle() {
        let request = GenerationRequest {
            preset: Some("portrait_60s".to_string()),
            num_inference_steps: Some(40),
            width: Some(640),
            seed: Some(42),
            ..GenerationRequest::with_prompt("cottagecore ferret")
        };
        let params = request.resolve().expect("valid request");

        assert_eq!(params.width, 640);
        assert_eq!(params.height, 960);
        assert_eq!(params.num_inference_steps, 40);
        assert_eq!(params.seed, Some(42));
    }

    #[test]
    fn preset_names_are_case_insensitive_and_unknown_names_rejected() {
        assert_eq!(
            "Landscape_60S".parse::<Preset>().expect("known preset"),
            Preset::Landscape60s
        );

        let request = GenerationRequest {
            preset: Some("square_10s".to_string()),
            ..GenerationRequest::with_prompt("x")
        };
        assert_eq!(
            request.resolve(),
            Err(ParamError::UnknownPreset("square_10s".to_string()))
        );
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let request = GenerationRequest::with_prompt("   ");
        assert_eq!(request.resolve(), Err(ParamError::MissingPrompt));
        assert_eq!(
            GenerationRequest::default().resolve(),
            Err(ParamError::MissingPrompt)
        );
    }

    #[test]
    fn out_of_range_frame_and_step_counts_are_rejected() {
        let too_long = GenerationRequest {
            video_length: Some(130),
            ..GenerationRequest::with_prompt("x")
        };
        let err = too_long.resolve().expect_err("130 frames is out of range");
        assert!(matches!(
            err,
            ParamError::OutOfRange {
                field: "video_length",
                ..
            }
        ));

        let too_few_steps = GenerationRequest {
            num_inference_steps: Some(9),
            ..GenerationRequest::with_prompt("x")
        };
        let err = too_few_steps.resolve().expect_err("9 steps is out of range");
        assert_eq!(
            err.to_string(),
            "num_inference_steps must be between 10 and 50, got 9"
        );
    }

    #[test]
    fn float_bounds_reject_nan_and_overflow() {
        let nan = GenerationRequest {
            guidance_scale: Some(f64::NAN),
            ..GenerationRequest::with_prompt("x")
        };
        assert!(nan.resolve().is_err());

        let shift = GenerationRequest {
            flow_shift: Some(10.5),
            ..GenerationRequest::with_prompt("x")
        };
        assert!(shift.resolve().is_err());
    }

    #[test]
    fn merge_overrides_prefers_set_fields() {
        let base = GenerationRequest {
            preset: Some("portrait_60s".to_string()),
            width: Some(544),
            ..GenerationRequest::with_prompt("base")
        };
        let overrides = GenerationRequest {
            width: Some(640),
            height: Some(480),
            ..Default::default()
        };

        let merged = base.merge_overrides(overrides);
        assert_eq!(merged.prompt.as_deref(), Some("base"));
        assert_eq!(merged.preset.as_deref(), Some("portrait_60s"));
        assert_eq!(merged.width, Some(640));
        assert_eq!(merged.height, Some(480));
        assert_eq!(merged.fps, None);
    }

    #[test]
    fn estimate_scales_with_step_count() {
        let params = GenerationRequest {
            num_inference_steps: Some(10),
            ..GenerationRequest::with_prompt("x")
        }
        .resolve()
        .expect("valid");
        assert_eq!(params.estimated_seconds(), 200);
    }

    #[test]
    fn request_serialization_omits_unset_fields() {
        let request = GenerationRequest {
            preset: Some("portrait_30s".to_string()),
            ..GenerationRequest::with_prompt("x")
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"prompt": "x", "preset": "portrait_30s"})
        );
    }
}
