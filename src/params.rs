//! Input templates and parameter resolution.
//!
//! A stage's input is declared as a template whose string leaves may be
//! references of the form `${source.path}`. Templates are parsed once, at
//! workflow submission, into an explicit sum type; resolution dereferences
//! each reference against the workflow context in a single pass. Resolved
//! values are never re-scanned for references.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::{StageStatus, WorkflowContext};
use crate::error::StageError;

/// Source name for the workflow's initial parameters.
pub const INPUT_PARAMS_SOURCE: &str = "input_params";

/// A leaf value is a reference iff it is a string matching this grammar.
static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{([A-Za-z0-9_.]+)\.(.+)\}$").expect("reference grammar"));

/// One node of a parsed input template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    /// Any non-reference leaf, substituted verbatim.
    Literal(Value),
    /// A dereference of `path` into `source`'s output (or the workflow's
    /// `input_params`).
    Reference { source: String, path: String },
    Map(Vec<(String, TemplateValue)>),
    List(Vec<TemplateValue>),
}

/// A parsed stage input template. The root is always a mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTemplate {
    entries: Vec<(String, TemplateValue)>,
}

impl InputTemplate {
    /// Parse a raw template. `sources` lists the names a reference may point
    /// at (stage names plus `input_params`); since stage names themselves
    /// contain dots, the longest declared source that prefixes the
    /// placeholder wins the split between source and path.
    pub fn parse(raw: &Value, sources: &[String]) -> Result<Self, StageError> {
        let Value::Object(map) = raw else {
            return Err(StageError::invalid_input(
                "input template must be a mapping",
            ));
        };
        let entries = map
            .iter()
            .map(|(key, value)| (key.clone(), parse_value(value, sources)))
            .collect();
        Ok(Self { entries })
    }

    /// An empty template, for stages that take no input.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Produce the fully literal input for this stage.
    pub fn resolve(&self, context: &WorkflowContext) -> Result<Map<String, Value>, StageError> {
        let mut resolved = Map::new();
        for (key, value) in &self.entries {
            resolved.insert(key.clone(), resolve_value(value, context)?);
        }
        Ok(resolved)
    }
}

fn parse_value(raw: &Value, sources: &[String]) -> TemplateValue {
    match raw {
        Value::String(text) => parse_leaf(text, sources),
        Value::Object(map) => TemplateValue::Map(
            map.iter()
                .map(|(key, value)| (key.clone(), parse_value(value, sources)))
                .collect(),
        ),
        Value::Array(items) => {
            TemplateValue::List(items.iter().map(|item| parse_value(item, sources)).collect())
        }
        other => TemplateValue::Literal(other.clone()),
    }
}

fn parse_leaf(text: &str, sources: &[String]) -> TemplateValue {
    let Some(captures) = REFERENCE_RE.captures(text) else {
        return TemplateValue::Literal(Value::String(text.to_string()));
    };

    // Inner body without the `${` / `}` delimiters.
    let inner = &text[2..text.len() - 1];

    // Prefer the longest declared source; stage names contain dots, so the
    // regex split alone cannot tell `ffmpeg.extract_audio` from its path.
    let mut best: Option<&String> = None;
    for source in sources {
        if inner.len() > source.len() + 1
            && inner.starts_with(source.as_str())
            && inner.as_bytes()[source.len()] == b'.'
            && best.is_none_or(|current| source.len() > current.len())
        {
            best = Some(source);
        }
    }

    match best {
        Some(source) => TemplateValue::Reference {
            source: source.clone(),
            path: inner[source.len() + 1..].to_string(),
        },
        // Grammar match without a declared source: keep the greedy regex
        // split so resolution can report the unknown source by name.
        None => TemplateValue::Reference {
            source: captures[1].to_string(),
            path: captures[2].to_string(),
        },
    }
}

fn resolve_value(value: &TemplateValue, context: &WorkflowContext) -> Result<Value, StageError> {
    match value {
        TemplateValue::Literal(literal) => Ok(literal.clone()),
        TemplateValue::Reference { source, path } => resolve_reference(source, path, context),
        TemplateValue::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), resolve_value(value, context)?);
            }
            Ok(Value::Object(map))
        }
        TemplateValue::List(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(resolve_value(item, context)?);
            }
            Ok(Value::Array(list))
        }
    }
}

fn resolve_reference(
    source: &str,
    path: &str,
    context: &WorkflowContext,
) -> Result<Value, StageError> {
    let root: Value = if source == INPUT_PARAMS_SOURCE {
        Value::Object(context.input_params.clone())
    } else {
        let Some(record) = context.stage(source) else {
            return Err(StageError::unresolved_reference(format!(
                "reference source {source} is not a stage of this workflow"
            )));
        };
        if record.status != StageStatus::Success {
            return Err(StageError::unresolved_reference(format!(
                "stage {source} has not succeeded (status {:?})",
                record.status
            )));
        }
        Value::Object(record.output.clone())
    };

    lookup_path(&root, path).ok_or_else(|| {
        StageError::missing_field(format!("path {path} does not exist in {source}"))
    })
}

/// Walk a dotted path; numeric segments index into arrays.
fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn context_with_success_stage() -> WorkflowContext {
        let mut input_params = Map::new();
        input_params.insert("video_path".into(), json!("/share/in/a.mp4"));
        input_params.insert("word_timestamps".into(), json!(false));
        input_params.insert("offset".into(), json!(0));

        let mut context = WorkflowContext::new(
            "wf-A",
            "/share/workflows/wf-A",
            vec![
                "ffmpeg.extract_audio".to_string(),
                "asr.transcribe".to_string(),
            ],
            input_params,
        );
        let record = context.stage_mut("ffmpeg.extract_audio").expect("stage");
        record.status = StageStatus::Success;
        record.output.insert("audio_path".into(), json!("/share/workflows/wf-A/a.wav"));
        record.output.insert(
            "statistics".into(),
            json!({"duration": 12.5, "channels": [1, 2]}),
        );
        context
    }

    fn sources() -> Vec<String> {
        vec![
            "input_params".to_string(),
            "ffmpeg.extract_audio".to_string(),
            "asr.transcribe".to_string(),
        ]
    }

    #[test]
    fn literals_pass_through_unchanged() {
        let template = InputTemplate::parse(
            &json!({"model_name": "large-v3", "beam_size": 5, "flag": true}),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["model_name"], json!("large-v3"));
        assert_eq!(resolved["beam_size"], json!(5));
        assert_eq!(resolved["flag"], json!(true));
    }

    #[test]
    fn resolves_input_params_reference() {
        let template = InputTemplate::parse(
            &json!({"video_path": "${input_params.video_path}"}),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["video_path"], json!("/share/in/a.mp4"));
    }

    #[test]
    fn resolves_stage_output_reference_with_dotted_node_name() {
        let template = InputTemplate::parse(
            &json!({"audio_path": "${ffmpeg.extract_audio.audio_path}"}),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["audio_path"], json!("/share/workflows/wf-A/a.wav"));
    }

    #[test]
    fn resolves_nested_paths_and_array_indexes() {
        let template = InputTemplate::parse(
            &json!({
                "duration": "${ffmpeg.extract_audio.statistics.duration}",
                "first_channel": "${ffmpeg.extract_audio.statistics.channels.0}",
            }),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["duration"], json!(12.5));
        assert_eq!(resolved["first_channel"], json!(1));
    }

    #[test]
    fn zero_and_false_resolve_as_present_values() {
        let template = InputTemplate::parse(
            &json!({
                "offset": "${input_params.offset}",
                "word_timestamps": "${input_params.word_timestamps}",
            }),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["offset"], json!(0));
        assert_eq!(resolved["word_timestamps"], json!(false));
    }

    #[test]
    fn reference_to_unfinished_stage_is_unresolved() {
        let template = InputTemplate::parse(
            &json!({"data": "${asr.transcribe.transcribe_data_path}"}),
            &sources(),
        )
        .expect("parse");
        let error = template
            .resolve(&context_with_success_stage())
            .expect_err("unfinished stage");
        assert_eq!(error.kind, ErrorKind::UnresolvedReference);
    }

    #[test]
    fn reference_to_unknown_source_is_unresolved() {
        let template = InputTemplate::parse(&json!({"x": "${nobody.field}"}), &sources())
            .expect("parse");
        let error = template
            .resolve(&context_with_success_stage())
            .expect_err("unknown source");
        assert_eq!(error.kind, ErrorKind::UnresolvedReference);
    }

    #[test]
    fn missing_path_is_missing_field() {
        let template = InputTemplate::parse(
            &json!({"x": "${ffmpeg.extract_audio.no_such_key}"}),
            &sources(),
        )
        .expect("parse");
        let error = template
            .resolve(&context_with_success_stage())
            .expect_err("missing path");
        assert_eq!(error.kind, ErrorKind::MissingField);
    }

    #[test]
    fn non_matching_strings_stay_literal() {
        let template = InputTemplate::parse(
            &json!({
                "plain": "just a string",
                "half": "${not closed",
                "spaced": "${with space.x}",
            }),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["plain"], json!("just a string"));
        assert_eq!(resolved["half"], json!("${not closed"));
        assert_eq!(resolved["spaced"], json!("${with space.x}"));
    }

    #[test]
    fn resolution_is_single_pass() {
        let mut context = context_with_success_stage();
        let record = context.stage_mut("ffmpeg.extract_audio").expect("stage");
        record
            .output
            .insert("nested_ref".into(), json!("${input_params.video_path}"));

        let template = InputTemplate::parse(
            &json!({"value": "${ffmpeg.extract_audio.nested_ref}"}),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context).expect("resolve");
        // The resolved value is substituted as-is, not re-scanned.
        assert_eq!(resolved["value"], json!("${input_params.video_path}"));
    }

    #[test]
    fn templates_keep_shape_for_maps_and_lists() {
        let template = InputTemplate::parse(
            &json!({
                "formats": ["srt", "json"],
                "options": {"audio_path": "${ffmpeg.extract_audio.audio_path}", "level": 2},
            }),
            &sources(),
        )
        .expect("parse");
        let resolved = template.resolve(&context_with_success_stage()).expect("resolve");
        assert_eq!(resolved["formats"], json!(["srt", "json"]));
        assert_eq!(
            resolved["options"],
            json!({"audio_path": "/share/workflows/wf-A/a.wav", "level": 2})
        );
    }
}
