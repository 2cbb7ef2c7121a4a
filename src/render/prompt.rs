use std::fmt;

use serde::{Deserialize, Serialize};

pub const TOPIC_MIN_CHARS: usize = 3;
pub const TOPIC_MAX_CHARS: usize = 300;
pub const DURATION_MIN_SECS: u32 = 15;
pub const DURATION_MAX_SECS: u32 = 180;
pub const INSTRUCTIONS_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StylePreset {
    Minimal,
    Colorful,
    GeometricHeavy,
}

impl StylePreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Colorful => "colorful",
            Self::GeometricHeavy => "geometric-heavy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LevelPreset {
    School,
    Undergraduate,
    Advanced,
}

impl LevelPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Undergraduate => "undergraduate",
            Self::Advanced => "advanced",
        }
    }
}

impl fmt::Display for StylePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LevelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to generate a scene from a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateRequest {
    pub topic: String,
    pub duration_seconds: u32,
    pub style: StylePreset,
    pub level: LevelPreset,
    #[serde(default)]
    pub additional_instructions: String,
}

impl GenerateRequest {
    /// Field constraint violations, empty when the request is acceptable.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let topic_len = self.topic.chars().count();
        if !(TOPIC_MIN_CHARS..=TOPIC_MAX_CHARS).contains(&topic_len) {
            problems.push(format!(
                "topic must be between {TOPIC_MIN_CHARS} and {TOPIC_MAX_CHARS} characters"
            ));
        }
        if !(DURATION_MIN_SECS..=DURATION_MAX_SECS).contains(&self.duration_seconds) {
            problems.push(format!(
                "duration_seconds must be between {DURATION_MIN_SECS} and {DURATION_MAX_SECS}"
            ));
        }
        if self.additional_instructions.chars().count() > INSTRUCTIONS_MAX_CHARS {
            problems.push(format!(
                "additional_instructions must be at most {INSTRUCTIONS_MAX_CHARS} characters"
            ));
        }
        problems
    }
}

const SCENE_RULES: &str = "\
- Keep `GeneratedScene(Scene)` and its `construct(self)` method.
- Import only with `from manim import *`.
- No unsafe imports and no system, file or network access.
- Respond with code only.";

pub fn generation_prompt(request: &GenerateRequest) -> String {
    let instructions = if request.additional_instructions.trim().is_empty() {
        "None"
    } else {
        request.additional_instructions.trim()
    };
    format!(
        "You write Manim Community Edition scripts for short educational animations.

Requirements:
- Respond with Python code only.
- The first line must be: from manim import *
- Define exactly one class, GeneratedScene, inheriting from Scene.
- GeneratedScene must define construct(self).
- No unsafe imports and no system, file or network access.
- Never call Scene helpers that do not exist (such as `play_and_wait` or `_set_background`).
- Call only public Scene APIs such as play, wait, add, remove, clear, next_section and add_sound.
- Any helper method you call on self must be defined inside GeneratedScene.
- Target an animation length of about {duration} seconds.
- Audience level: {level}
- Visual style: {style}
- Prefer simple constructs that render reliably.

Topic:
{topic}

Additional instructions:
{instructions}

Respond with valid Python code only.",
        duration = request.duration_seconds,
        level = request.level,
        style = request.style,
        topic = request.topic,
    )
}

/// Prompt asking the model to repair `code` given a diagnostic.
pub fn repair_prompt(code: &str, diagnostic: &str) -> String {
    format!(
        "Repair this Manim script so that it validates and renders.
Rules:
{SCENE_RULES}

Error:
{diagnostic}

Code:
{code}"
    )
}

/// Prompt asking the model to revise `code` following an instruction.
pub fn revise_prompt(code: &str, instruction: &str) -> String {
    format!(
        "Revise this Manim script according to the instruction.
Rules:
{SCENE_RULES}

Instruction:
{instruction}

Code:
{code}"
    )
}

/// Scene used when no model output is available. Double quotes in the
/// topic become single quotes so the title literal stays valid.
pub fn placeholder_scene(topic: &str) -> String {
    let title = topic
        .replace('\\', "\\\\")
        .replace('"', "'")
        .replace(['\n', '\r'], " ");
    format!(
        "from manim import *


class GeneratedScene(Scene):
    def construct(self):
        title = Text(\"{title}\", font_size=48)
        self.play(Write(title))
        self.wait(1)
"
    )
}
