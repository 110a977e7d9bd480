// src/selection/sanity.rs
//
// Geometric plausibility check on a plate crop before it costs an OCR call.
//
// Rules, in order:
//   1. too_small      crop below min width/height
//   2. too_elongated  aspect above max_aspect (bumper strips, fence rails)
//   3. adaptive       high confidence + large enough box: relaxed aspect floor
//   4. base           otherwise the regular aspect floor
//
// The adaptive floor recovers plates shot from a steep downward angle,
// which foreshortens their height.

use crate::types::SanityConfig;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SanityRule {
    Disabled,
    TooSmall,
    TooElongated,
    Base,
    Adaptive,
}

impl SanityRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::TooSmall => "too_small",
            Self::TooElongated => "too_elongated",
            Self::Base => "base",
            Self::Adaptive => "adaptive_high_conf",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SanityInput {
    pub crop_w: u32,
    pub crop_h: u32,
    pub confidence: f32,
    /// Detection box area over frame area
    pub area_ratio: f32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SanityVerdict {
    pub passed: bool,
    /// Rule that decided the outcome
    pub rule: SanityRule,
    pub aspect: f32,
    /// Aspect floor that was applied (0 when no aspect rule ran)
    pub threshold: f32,
    pub area_ratio: f32,
    pub confidence: f32,
}

pub struct SanityFilter {
    cfg: SanityConfig,
}

impl SanityFilter {
    pub fn new(cfg: SanityConfig) -> Self {
        Self { cfg }
    }

    pub fn check(&self, input: &SanityInput) -> SanityVerdict {
        let aspect = if input.crop_h > 0 {
            input.crop_w as f32 / input.crop_h as f32
        } else {
            0.0
        };
        let verdict = |passed: bool, rule: SanityRule, threshold: f32| SanityVerdict {
            passed,
            rule,
            aspect,
            threshold,
            area_ratio: input.area_ratio,
            confidence: input.confidence,
        };

        if !self.cfg.enable {
            return verdict(true, SanityRule::Disabled, 0.0);
        }
        if input.crop_w < self.cfg.min_width || input.crop_h < self.cfg.min_height {
            return verdict(false, SanityRule::TooSmall, 0.0);
        }
        if aspect > self.cfg.max_aspect {
            return verdict(false, SanityRule::TooElongated, self.cfg.max_aspect);
        }

        let adaptive = input.confidence >= self.cfg.adaptive_conf_min
            && input.area_ratio >= self.cfg.adaptive_area_min;
        if adaptive {
            let thr = self.cfg.aspect_min_adaptive;
            verdict(aspect >= thr, SanityRule::Adaptive, thr)
        } else {
            let thr = self.cfg.aspect_min;
            verdict(aspect >= thr, SanityRule::Base, thr)
        }
    }
}
