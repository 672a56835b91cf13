//! Substitution of dependency outputs into task inputs.
//!
//! Two forms are recognised inside string values (object keys are left as-is):
//! - `$task.<id>.output[.path]`: a direct reference. `path` segments are
//!   object keys or array indices.
//! - `{{ expr }}`: a sandboxed expression. Each dependency is visible as
//!   `<id>.output` and as `$task['<id>'].output`.
//!
//! A string consisting of exactly one reference or one template is replaced by
//! the raw JSON value; otherwise each occurrence is interpolated as text.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use lisa_core::error::{LisaError, Result};

use crate::expression::{to_text, ExpressionEvaluator, TASK_ROOT};

const TASK_PREFIX: &str = "$task.";
const OUTPUT_SEGMENT: &str = ".output";

#[derive(Debug, Clone, PartialEq)]
struct TaskRef {
    start: usize,
    end: usize,
    task: String,
    path: Vec<String>,
}

impl TaskRef {
    fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Template {
    start: usize,
    end: usize,
    expression: String,
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn take_id(s: &str) -> &str {
    let end = s.find(|c: char| !is_id_char(c)).unwrap_or(s.len());
    &s[..end]
}

fn find_task_refs(s: &str) -> Vec<TaskRef> {
    let mut refs = Vec::new();
    for (start, _) in s.match_indices(TASK_PREFIX) {
        let mut i = start + TASK_PREFIX.len();
        let task = take_id(&s[i..]);
        if task.is_empty() {
            continue;
        }
        i += task.len();
        if !s[i..].starts_with(OUTPUT_SEGMENT) {
            continue;
        }
        i += OUTPUT_SEGMENT.len();
        if s[i..].starts_with(is_id_char) {
            // e.g. `.outputs`
            continue;
        }
        let mut path = Vec::new();
        while s[i..].starts_with('.') {
            let segment = take_id(&s[i + 1..]);
            if segment.is_empty() {
                break;
            }
            path.push(segment.to_string());
            i += 1 + segment.len();
        }
        refs.push(TaskRef {
            start,
            end: i,
            task: task.to_string(),
            path,
        });
    }
    refs
}

fn find_templates(s: &str) -> Vec<Template> {
    let mut templates = Vec::new();
    let mut offset = 0;
    while let Some(open) = s[offset..].find("{{") {
        let start = offset + open;
        let Some(close) = s[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        templates.push(Template {
            start,
            end,
            expression: s[start + 2..end - 2].trim().to_string(),
        });
        offset = end;
    }
    templates
}

/// Static view of what an input refers to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct References {
    /// Task ids named by `$task.<id>.output` references.
    pub tasks: BTreeSet<String>,
    /// Context names read by `{{ }}` expressions that parse, including task
    /// ids spelled as static `$task` keys.
    pub identifiers: BTreeSet<String>,
}

/// Collect every reference in `input` without evaluating anything.
///
/// Expressions that fail to parse are skipped here; they fail the task when it
/// runs.
pub fn references(evaluator: &ExpressionEvaluator, input: &Value) -> References {
    let mut refs = References::default();
    collect(evaluator, input, &mut refs);
    refs
}

fn collect(evaluator: &ExpressionEvaluator, value: &Value, refs: &mut References) {
    match value {
        Value::String(s) => {
            refs.tasks.extend(find_task_refs(s).into_iter().map(|r| r.task));
            for template in find_templates(s) {
                if let Ok(ids) = evaluator.identifiers(&template.expression) {
                    refs.identifiers.extend(ids.into_iter().filter(|id| id != TASK_ROOT));
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(evaluator, v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect(evaluator, v, refs)),
        _ => {}
    }
}

/// Expression context for a set of dependency outputs.
pub fn expression_context(outputs: &BTreeMap<String, Value>) -> Map<String, Value> {
    let mut by_id = Map::new();
    for (id, output) in outputs {
        let mut entry = Map::new();
        entry.insert("output".to_string(), output.clone());
        by_id.insert(id.clone(), Value::Object(entry));
    }
    let mut context = by_id.clone();
    context.insert(TASK_ROOT.to_string(), Value::Object(by_id));
    context
}

/// Resolves references in task inputs against dependency outputs only.
pub struct InputResolver<'a> {
    evaluator: &'a ExpressionEvaluator,
    outputs: &'a BTreeMap<String, Value>,
    context: Map<String, Value>,
}

impl<'a> InputResolver<'a> {
    pub fn new(evaluator: &'a ExpressionEvaluator, outputs: &'a BTreeMap<String, Value>) -> Self {
        Self {
            evaluator,
            outputs,
            context: expression_context(outputs),
        }
    }

    pub fn resolve(&self, input: &Value) -> Result<Value> {
        match input {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => items.iter().map(|v| self.resolve(v)).collect::<Result<Vec<_>>>().map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, s: &str) -> Result<Value> {
        let templates = find_templates(s);
        // References inside a template belong to the expression.
        let refs: Vec<TaskRef> = find_task_refs(s)
            .into_iter()
            .filter(|r| !templates.iter().any(|t| r.start >= t.start && r.end <= t.end))
            .collect();

        if refs.is_empty() && templates.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        let trimmed_start = s.len() - s.trim_start().len();
        let trimmed_end = s.trim_end().len();
        if templates.is_empty() && refs.len() == 1 && refs[0].start == 0 && refs[0].end == s.len() {
            return self.lookup(&refs[0], s);
        }
        if refs.is_empty()
            && templates.len() == 1
            && templates[0].start == trimmed_start
            && templates[0].end == trimmed_end
        {
            return self.evaluator.evaluate(&templates[0].expression, &self.context);
        }

        let mut spans: Vec<(usize, usize, String)> = Vec::with_capacity(refs.len() + templates.len());
        for r in &refs {
            spans.push((r.start, r.end, to_text(&self.lookup(r, s)?)));
        }
        for t in &templates {
            let value = self.evaluator.evaluate(&t.expression, &self.context)?;
            spans.push((t.start, t.end, to_text(&value)));
        }
        spans.sort_by_key(|(start, _, _)| *start);

        let mut out = String::with_capacity(s.len());
        let mut cursor = 0;
        for (start, end, text) in spans {
            out.push_str(&s[cursor..start]);
            out.push_str(&text);
            cursor = end;
        }
        out.push_str(&s[cursor..]);
        Ok(Value::String(out))
    }

    fn lookup(&self, reference: &TaskRef, source: &str) -> Result<Value> {
        let mut current = self.outputs.get(&reference.task).ok_or_else(|| {
            LisaError::Expression(format!(
                "'{}' refers to a task that is not a completed dependency",
                reference.text(source)
            ))
        })?;
        for segment in &reference.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| {
                LisaError::Expression(format!("'{}' not found in output", reference.text(source)))
            })?;
        }
        Ok(current.clone())
    }
}

/// Resolve all references in `input` against `outputs`.
pub fn resolve_input(
    evaluator: &ExpressionEvaluator,
    input: &Value,
    outputs: &BTreeMap<String, Value>,
) -> Result<Value> {
    InputResolver::new(evaluator, outputs).resolve(input)
}
