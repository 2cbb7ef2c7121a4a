//! Static policy checks for generated scene scripts.
//!
//! The validator parses the script with a real Python parser and walks the
//! syntax tree once, collecting every violation it finds. It never executes
//! anything and never fails: malformed input becomes a violation.

mod nesting;
mod walk;

use std::collections::HashSet;

use rustpython_parser::Parse;
use rustpython_parser::ast::{self, Expr, Stmt};
use serde::Serialize;

use walk::{Visitor, walk_body};

/// Upper bound on accepted source size, in bytes.
pub const MAX_SOURCE_BYTES: usize = 100_000;

/// Root module names that may not be imported.
pub const FORBIDDEN_IMPORTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "pathlib",
    "shutil",
    "requests",
    "httpx",
    "urllib",
];

/// Call names rejected whether invoked bare or through an attribute.
pub const FORBIDDEN_CALLS: &[&str] = &["eval", "exec", "open", "__import__", "compile", "input"];

/// Methods provided by `manim.Scene` that generated code may call on `self`.
pub const SCENE_METHODS: &[&str] = &[
    "add",
    "add_foreground_mobject",
    "add_foreground_mobjects",
    "add_sound",
    "add_subcaption",
    "add_updater",
    "bring_to_back",
    "bring_to_front",
    "clear",
    "construct",
    "embed",
    "get_attrs",
    "get_mobject_family_members",
    "get_top_level_mobjects",
    "interactive_embed",
    "next_section",
    "pause",
    "play",
    "remove",
    "remove_foreground_mobject",
    "remove_foreground_mobjects",
    "remove_updater",
    "render",
    "replace",
    "setup",
    "tear_down",
    "update_mobjects",
    "wait",
    "wait_until",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Build a result from raw violations, dropping exact duplicates while
    /// keeping first-seen order.
    fn from_errors(errors: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let errors: Vec<String> = errors
            .into_iter()
            .filter(|e| seen.insert(e.clone()))
            .collect();
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }

    /// Violations as a single diagnostic line, the form fed to the repair step.
    pub fn joined(&self) -> String {
        self.errors.join("; ")
    }
}

/// Names that make a script loadable by the renderer.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub module: &'static str,
    pub class: &'static str,
    pub base: &'static str,
    pub method: &'static str,
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self {
            module: "manim",
            class: "GeneratedScene",
            base: "Scene",
            method: "construct",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeValidator {
    entry: EntryPoint,
}

impl CodeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, source: &str) -> ValidationResult {
        if source.len() > MAX_SOURCE_BYTES {
            return ValidationResult::from_errors(vec![format!(
                "Code exceeds max size {}KB",
                MAX_SOURCE_BYTES / 1000
            )]);
        }

        if let Some(violation) = nesting::check_nesting(source) {
            return ValidationResult::from_errors(vec![format!(
                "Syntax error: {} at line {}",
                violation.message, violation.line
            )]);
        }

        let lines = LineIndex::new(source);
        let suite = match ast::Suite::parse(source, "<scene>") {
            Ok(suite) => suite,
            Err(err) => {
                let line = lines.line_of(u32::from(err.offset) as usize);
                return ValidationResult::from_errors(vec![format!(
                    "Syntax error: {} at line {}",
                    err.error, line
                )]);
            }
        };

        let mut safety = SafetyVisitor::new(self.entry.module);
        walk_body(&mut safety, &suite);

        let mut errors = safety.errors;
        if !safety.saw_required_import {
            errors.push(format!(
                "Missing required import: from {} import *",
                self.entry.module
            ));
        }
        errors.extend(self.check_entry_point(&suite, &lines));

        ValidationResult::from_errors(errors)
    }

    fn check_entry_point(&self, suite: &[Stmt], lines: &LineIndex) -> Vec<String> {
        let EntryPoint {
            class,
            base,
            method,
            ..
        } = &self.entry;
        let classes = ModuleClasses::collect(suite);
        let candidates = classes.named(class);

        let mut errors = Vec::new();
        let Some(entry) = candidates.first().copied() else {
            errors.push(format!("Missing required class: {class}({base})"));
            errors.push(format!("Missing required method: {method}(self)"));
            return errors;
        };
        if candidates.len() > 1 {
            errors.push(format!(
                "Duplicate required class: {class} is defined {} times",
                candidates.len()
            ));
        }

        if !classes.inherits_from(entry, base, &mut HashSet::new()) {
            errors.push(format!("Required class {class} must inherit from {base}"));
        }

        let mut defined = HashSet::new();
        classes.collect_methods(entry, &mut defined, &mut HashSet::new());
        if !defined.contains(*method) {
            errors.push(format!("Missing required method: {method}(self)"));
        }

        let mut calls = SelfCallVisitor::default();
        walk_body(&mut calls, &entry.body);
        for (name, offset) in calls.calls {
            if defined.contains(name) || SCENE_METHODS.contains(&name) {
                continue;
            }
            let line = lines.line_of(offset);
            if name.starts_with('_') {
                errors.push(format!(
                    "Undefined helper method at line {line}: self.{name}() must be defined in {class} before it is called"
                ));
            } else {
                errors.push(format!(
                    "Unknown Scene method at line {line}: self.{name}() is not a Manim Scene API; \
                     use a supported Scene method or define {name}() in {class}"
                ));
            }
        }

        errors
    }
}

// ── Safety checks ────────────────────────────────────────────────────

struct SafetyVisitor<'m> {
    required_module: &'m str,
    saw_required_import: bool,
    errors: Vec<String>,
}

impl<'m> SafetyVisitor<'m> {
    fn new(required_module: &'m str) -> Self {
        Self {
            required_module,
            saw_required_import: false,
            errors: Vec::new(),
        }
    }
}

fn is_forbidden_module(dotted: &str) -> bool {
    let root = dotted.split('.').next().unwrap_or(dotted);
    FORBIDDEN_IMPORTS.contains(&root)
}

/// Name a call resolves to syntactically: `f(...)` and `x.f(...)` both yield `f`.
fn call_name(func: &Expr) -> Option<&str> {
    match func {
        Expr::Name(name) => Some(name.id.as_str()),
        Expr::Attribute(attr) => Some(attr.attr.as_str()),
        _ => None,
    }
}

impl<'a> Visitor<'a> for SafetyVisitor<'_> {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Import(import) => {
                for alias in &import.names {
                    let name = alias.name.as_str();
                    if is_forbidden_module(name) {
                        self.errors.push(format!("Forbidden import: {name}"));
                    }
                }
            }
            Stmt::ImportFrom(import) => {
                // Relative imports (`from . import x`) carry no module name.
                let Some(module) = &import.module else {
                    return;
                };
                let module = module.as_str();
                if module == self.required_module {
                    self.saw_required_import = true;
                } else if is_forbidden_module(module) {
                    self.errors.push(format!("Forbidden import from: {module}"));
                }
            }
            _ => {}
        }
    }

    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Call(call) = expr
            && let Some(name) = call_name(&call.func)
            && FORBIDDEN_CALLS.contains(&name)
        {
            self.errors.push(format!("Forbidden call: {name}"));
        }
    }
}

// ── Entry-point structure ────────────────────────────────────────────

/// Classes defined at module level, in source order.
struct ModuleClasses<'a> {
    classes: Vec<&'a ast::StmtClassDef>,
}

impl<'a> ModuleClasses<'a> {
    fn collect(suite: &'a [Stmt]) -> Self {
        let classes = suite
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::ClassDef(class) => Some(class),
                _ => None,
            })
            .collect();
        Self { classes }
    }

    fn named(&self, name: &str) -> Vec<&'a ast::StmtClassDef> {
        self.classes
            .iter()
            .copied()
            .filter(|c| c.name.as_str() == name)
            .collect()
    }

    /// Local ancestor referenced by a base expression. The first definition
    /// wins when a name is bound more than once.
    fn local_base(&self, base: &Expr) -> Option<&'a ast::StmtClassDef> {
        let Expr::Name(name) = base else {
            return None;
        };
        self.classes
            .iter()
            .copied()
            .find(|c| c.name.as_str() == name.id.as_str())
    }

    fn inherits_from(
        &self,
        class: &'a ast::StmtClassDef,
        base_name: &str,
        visiting: &mut HashSet<&'a str>,
    ) -> bool {
        if !visiting.insert(class.name.as_str()) {
            return false;
        }
        class.bases.iter().any(|base| {
            let direct = match base {
                Expr::Name(name) => name.id.as_str() == base_name,
                Expr::Attribute(attr) => attr.attr.as_str() == base_name,
                _ => false,
            };
            direct
                || self
                    .local_base(base)
                    .is_some_and(|parent| self.inherits_from(parent, base_name, visiting))
        })
    }

    fn collect_methods(
        &self,
        class: &'a ast::StmtClassDef,
        out: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
    ) {
        if !visiting.insert(class.name.as_str()) {
            return;
        }
        for stmt in &class.body {
            match stmt {
                Stmt::FunctionDef(def) => {
                    out.insert(def.name.as_str());
                }
                Stmt::AsyncFunctionDef(def) => {
                    out.insert(def.name.as_str());
                }
                _ => {}
            }
        }
        for base in &class.bases {
            if let Some(parent) = self.local_base(base) {
                self.collect_methods(parent, out, visiting);
            }
        }
    }
}

/// Collects `self.<name>(...)` call sites with their byte offsets.
#[derive(Default)]
struct SelfCallVisitor<'a> {
    calls: Vec<(&'a str, usize)>,
}

impl<'a> Visitor<'a> for SelfCallVisitor<'a> {
    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Call(call) = expr
            && let Expr::Attribute(attr) = call.func.as_ref()
            && let Expr::Name(receiver) = attr.value.as_ref()
            && receiver.id.as_str() == "self"
        {
            self.calls
                .push((attr.attr.as_str(), u32::from(call.range.start()) as usize));
        }
    }
}

/// Maps byte offsets to 1-based line numbers.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::fixtures::VALID_SCENE;

    fn validate(source: &str) -> ValidationResult {
        CodeValidator::new().validate(source)
    }

    fn has_error(result: &ValidationResult, needle: &str) -> bool {
        result.errors.iter().any(|e| e.contains(needle))
    }

    #[test]
    fn test_valid_scene_passes() {
        let result = validate(VALID_SCENE);
        assert!(result.ok, "unexpected errors: {:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_deeply_nested_source_is_a_syntax_error() {
        let source = format!(
            "from manim import *\nx = {}1{}\n",
            "[".repeat(49_000),
            "]".repeat(49_000)
        );
        assert!(source.len() < MAX_SOURCE_BYTES);
        let result = validate(&source);
        assert!(!result.ok);
        assert_eq!(
            result.errors,
            vec!["Syntax error: too many nested parentheses at line 2".to_string()]
        );

        let unary = format!("{}\nx = {}1\n", VALID_SCENE, "-".repeat(90_000));
        let result = validate(&unary);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Syntax error: expression too deeply nested"));
    }

    #[test]
    fn test_forbidden_import_plain() {
        let source = format!("import os\n{}", VALID_SCENE);
        let result = validate(&source);
        assert!(!result.ok);
        assert!(result.errors.contains(&"Forbidden import: os".to_string()));
    }

    #[test]
    fn test_forbidden_import_matches_root_module() {
        let source = format!("import os.path\n{}", VALID_SCENE);
        let result = validate(&source);
        assert!(result.errors.contains(&"Forbidden import: os.path".to_string()));
    }

    #[test]
    fn test_forbidden_import_from_form() {
        let source = format!(
            "from subprocess import run\nfrom urllib.request import urlopen\n{}",
            VALID_SCENE
        );
        let result = validate(&source);
        assert!(result.errors.contains(&"Forbidden import from: subprocess".to_string()));
        assert!(result.errors.contains(&"Forbidden import from: urllib.request".to_string()));
    }

    #[test]
    fn test_allowed_imports_pass() {
        let source = format!("import math\nimport numpy as np\n{}", VALID_SCENE);
        assert!(validate(&source).ok);
    }

    #[test]
    fn test_forbidden_call_bare_and_attribute() {
        let source = format!(
            "{}\nx = eval('1')\ny = builtins.exec('pass')\n",
            VALID_SCENE
        );
        let result = validate(&source);
        assert!(result.errors.contains(&"Forbidden call: eval".to_string()));
        assert!(result.errors.contains(&"Forbidden call: exec".to_string()));
    }

    #[test]
    fn test_repeated_forbidden_call_reported_once() {
        let source = format!(
            "{}\na = open('x')\nb = open('y')\nc = open('z')\n",
            VALID_SCENE
        );
        let result = validate(&source);
        let count = result
            .errors
            .iter()
            .filter(|e| *e == "Forbidden call: open")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_forbidden_call_in_nested_positions() {
        let source = "\
from manim import *

def helper(path=open('a')):
    return [compile(s, 'x', 'exec') for s in ()]

class GeneratedScene(Scene):
    @decorate(__import__('os'))
    def construct(self):
        label = f\"{input()}\"
";
        let result = validate(source);
        assert!(result.errors.contains(&"Forbidden call: open".to_string()));
        assert!(result.errors.contains(&"Forbidden call: compile".to_string()));
        assert!(result.errors.contains(&"Forbidden call: __import__".to_string()));
        assert!(result.errors.contains(&"Forbidden call: input".to_string()));
    }

    #[test]
    fn test_syntax_error_is_single_violation() {
        let source = "from manim import *\nimport os\nclass GeneratedScene(Scene):\n    def construct(self)\n        pass\n";
        let result = validate(source);
        assert!(!result.ok);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Syntax error: "));
        assert!(result.errors[0].contains(" at line "));
    }

    #[test]
    fn test_syntax_error_on_garbage() {
        let result = validate("def (:\n\t)))");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Syntax error: "));
    }

    #[test]
    fn test_oversized_source_reports_size_only() {
        let mut source = String::from("import os\n");
        source.push_str(&"# padding\n".repeat(MAX_SOURCE_BYTES / 10 + 1));
        let result = validate(&source);
        assert_eq!(result.errors, vec!["Code exceeds max size 100KB".to_string()]);
    }

    #[test]
    fn test_source_at_size_ceiling_is_parsed() {
        let mut source = VALID_SCENE.to_string();
        source.push_str(&"#".repeat(MAX_SOURCE_BYTES - source.len()));
        assert_eq!(source.len(), MAX_SOURCE_BYTES);
        assert!(validate(&source).ok);
    }

    #[test]
    fn test_missing_required_import() {
        let source = VALID_SCENE.replace("from manim import *\n", "");
        let result = validate(&source);
        assert!(result.errors.contains(&"Missing required import: from manim import *".to_string()));
    }

    #[test]
    fn test_missing_class_reports_class_and_method() {
        let result = validate("from manim import *\n\nclass Other(Scene):\n    def construct(self):\n        pass\n");
        assert!(result.errors.contains(&"Missing required class: GeneratedScene(Scene)".to_string()));
        assert!(result.errors.contains(&"Missing required method: construct(self)".to_string()));
    }

    #[test]
    fn test_missing_base() {
        let result = validate("from manim import *\n\nclass GeneratedScene:\n    def construct(self):\n        pass\n");
        assert_eq!(
            result.errors,
            vec!["Required class GeneratedScene must inherit from Scene".to_string()]
        );
    }

    #[test]
    fn test_transitive_base_through_local_class() {
        let source = "\
from manim import *

class Base(Scene):
    def title(self):
        return Text('hi')

class GeneratedScene(Base):
    def construct(self):
        self.play(Write(self.title()))
";
        let result = validate(source);
        assert!(result.ok, "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_qualified_base_accepted() {
        let source = "\
from manim import *
import manim

class GeneratedScene(manim.Scene):
    def construct(self):
        self.wait(1)
";
        assert!(validate(source).ok);
    }

    #[test]
    fn test_inheritance_cycle_does_not_hang() {
        let source = "\
from manim import *

class A(GeneratedScene):
    pass

class GeneratedScene(A):
    def construct(self):
        pass
";
        let result = validate(source);
        assert!(has_error(&result, "must inherit from Scene"));
    }

    #[test]
    fn test_duplicate_entry_class() {
        let source = format!("{}\nclass GeneratedScene(Scene):\n    pass\n", VALID_SCENE);
        let result = validate(&source);
        assert!(result.errors.contains(&"Duplicate required class: GeneratedScene is defined 2 times".to_string()));
    }

    #[test]
    fn test_nested_entry_class_does_not_count() {
        let source = "\
from manim import *

def factory():
    class GeneratedScene(Scene):
        def construct(self):
            pass
    return GeneratedScene
";
        let result = validate(source);
        assert!(result.errors.contains(&"Missing required class: GeneratedScene(Scene)".to_string()));
    }

    #[test]
    fn test_missing_construct() {
        let source = "from manim import *\n\nclass GeneratedScene(Scene):\n    def setup(self):\n        pass\n";
        let result = validate(source);
        assert_eq!(result.errors, vec!["Missing required method: construct(self)".to_string()]);
    }

    #[test]
    fn test_unknown_public_scene_method() {
        let source = "\
from manim import *

class GeneratedScene(Scene):
    def construct(self):
        circle = Circle()
        self.play_and_wait(Create(circle))
";
        let result = validate(source);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Unknown Scene method at line 6: self.play_and_wait()"));
    }

    #[test]
    fn test_undefined_private_helper() {
        let source = "\
from manim import *

class GeneratedScene(Scene):
    def construct(self):
        self._set_background()
";
        let result = validate(source);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Undefined helper method at line 5: self._set_background()"));
    }

    #[test]
    fn test_defined_helpers_are_allowed() {
        let source = "\
from manim import *

class GeneratedScene(Scene):
    def construct(self):
        self._intro()
        self.outro()

    def _intro(self):
        self.add(Square())

    async def outro(self):
        self.wait(0.5)
";
        let result = validate(source);
        assert!(result.ok, "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_calls_on_attributes_of_self_are_not_checked() {
        let source = "\
from manim import *

class GeneratedScene(MovingCameraScene):
    def construct(self):
        self.camera.frame.set(width=10)
";
        let result = validate(source);
        assert!(!has_error(&result, "Unknown Scene method"));
    }

    #[test]
    fn test_all_violations_collected() {
        let source = "import socket\nfrom os import path\nx = exec('1')\n";
        let result = validate(source);
        assert!(result.errors.contains(&"Forbidden import: socket".to_string()));
        assert!(result.errors.contains(&"Forbidden import from: os".to_string()));
        assert!(result.errors.contains(&"Forbidden call: exec".to_string()));
        assert!(result.errors.contains(&"Missing required import: from manim import *".to_string()));
        assert!(result.errors.contains(&"Missing required class: GeneratedScene(Scene)".to_string()));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let source = format!("import os\n{}\nz = eval('2')\n", VALID_SCENE);
        let validator = CodeValidator::new();
        assert_eq!(validator.validate(&source), validator.validate(&source));
    }

    #[test]
    fn test_joined_uses_semicolons() {
        let result = ValidationResult::from_errors(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(result.joined(), "a; b");
        assert!(!result.ok);
    }

    #[test]
    fn test_line_index() {
        let index = LineIndex::new("a\nbc\n\nd");
        assert_eq!(index.line_of(0), 1);
        assert_eq!(index.line_of(2), 2);
        assert_eq!(index.line_of(5), 3);
        assert_eq!(index.line_of(6), 4);
    }
}
