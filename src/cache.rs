//! Cache keys and the reuse judgement.
//!
//! A stage's cache identity is the node name plus a digest over the
//! node-declared `cache_key_fields` projected onto its resolved input,
//! serialized as canonical JSON. Declaring no fields opts the node out of
//! reuse entirely.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::context::{StageRecord, StageStatus};
use crate::kv::{KvError, KvStore};
use crate::util::json::canonical_string;

/// Content-addressed identifier: `"<node_name>:<hex md5 digest>"`.
///
/// Returns `None` when `fields` is empty (the node opts out of reuse).
/// Declared fields missing from the input are omitted from the projection,
/// not substituted.
#[must_use]
pub fn cache_key(node_name: &str, input: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    let mut projection = Map::new();
    for field in fields {
        if let Some(value) = input.get(*field) {
            projection.insert((*field).to_string(), value.clone());
        }
    }
    let digest = md5::compute(canonical_string(&Value::Object(projection)));
    Some(format!("{node_name}:{digest:x}"))
}

/// Whether a field value counts as present. Only `null` and the empty string
/// are invalid; `0`, `false` and the empty list are all meaningful outputs.
#[must_use]
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Whether a prior stage record may stand in for a fresh execution.
#[must_use]
pub fn can_reuse(record: &StageRecord, required_output_fields: &[&str]) -> bool {
    if record.status != StageStatus::Success {
        return false;
    }
    if record.output.is_empty() {
        return false;
    }
    required_output_fields.iter().all(|field| {
        record
            .output
            .get(*field)
            .is_some_and(is_meaningful)
    })
}

/// Cross-run cache index over the key-value store.
///
/// Successful stage outputs are published under their cache key; a later run
/// of the same node with the same projected input grafts the stored output
/// instead of re-executing. The `enabled` flag is the global kill switch:
/// when off, lookups always miss and nothing is published.
pub struct CacheIndex {
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl CacheIndex {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    fn entry_key(cache_key: &str) -> String {
        format!("cache:{cache_key}")
    }

    /// Stored output for `cache_key`, when reuse is enabled and the stored
    /// entry still satisfies the node's required output fields.
    pub async fn lookup(
        &self,
        cache_key: &str,
        required_output_fields: &[&str],
    ) -> Result<Option<Map<String, Value>>, KvError> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(entry) = self.kv.get(&Self::entry_key(cache_key)).await? else {
            return Ok(None);
        };
        let Some(output) = entry
            .value
            .get("output")
            .and_then(Value::as_object)
            .cloned()
        else {
            return Ok(None);
        };

        if output.is_empty() {
            return Ok(None);
        }
        let complete = required_output_fields
            .iter()
            .all(|field| output.get(*field).is_some_and(is_meaningful));
        if !complete {
            return Ok(None);
        }
        Ok(Some(output))
    }

    /// Publish a successful output under its cache key. Best effort: a store
    /// hiccup here must not fail the stage that produced the output.
    pub async fn publish(
        &self,
        cache_key: &str,
        workflow_id: &str,
        output: &Map<String, Value>,
    ) {
        if !self.enabled || output.is_empty() {
            return;
        }
        let entry = json!({
            "output": output,
            "source_workflow_id": workflow_id,
        });
        if let Err(error) = self.kv.put(&Self::entry_key(cache_key), &entry).await {
            debug!(cache_key, %error, "cache publish failed, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::kv::MemoryKvStore;

    fn record_with(status: StageStatus, output: &[(&str, Value)]) -> StageRecord {
        let mut record = StageRecord::new("asr.transcribe", "asr.transcribe");
        record.status = status;
        record.output = output
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        record
    }

    #[test]
    fn key_is_stable_and_order_independent() {
        let mut left = Map::new();
        left.insert("audio_path".into(), json!("/share/a.wav"));
        left.insert("model_name".into(), json!("large-v3"));

        let mut right = Map::new();
        right.insert("model_name".into(), json!("large-v3"));
        right.insert("audio_path".into(), json!("/share/a.wav"));

        let fields = ["audio_path", "model_name"];
        assert_eq!(
            cache_key("asr.transcribe", &left, &fields),
            cache_key("asr.transcribe", &right, &fields)
        );
    }

    #[test]
    fn key_ignores_undeclared_fields() {
        let mut base = Map::new();
        base.insert("audio_path".into(), json!("/share/a.wav"));

        let mut noisy = base.clone();
        noisy.insert("log_level".into(), json!("debug"));

        let fields = ["audio_path"];
        assert_eq!(
            cache_key("asr.transcribe", &base, &fields),
            cache_key("asr.transcribe", &noisy, &fields)
        );
    }

    #[test]
    fn key_changes_with_projected_values() {
        let mut left = Map::new();
        left.insert("video_path".into(), json!("/share/one.mp4"));
        let mut right = Map::new();
        right.insert("video_path".into(), json!("/share/two.mp4"));

        let fields = ["video_path"];
        assert_ne!(
            cache_key("ffmpeg.extract_audio", &left, &fields),
            cache_key("ffmpeg.extract_audio", &right, &fields)
        );
    }

    #[test]
    fn missing_declared_fields_are_omitted() {
        let mut partial = Map::new();
        partial.insert("audio_path".into(), json!("/share/a.wav"));

        let key = cache_key("asr.transcribe", &partial, &["audio_path", "model_name"]);
        assert!(key.is_some_and(|k| k.starts_with("asr.transcribe:")));
    }

    #[test]
    fn empty_field_list_opts_out() {
        let mut input = Map::new();
        input.insert("audio_path".into(), json!("/share/a.wav"));
        assert_eq!(cache_key("asr.transcribe", &input, &[]), None);
    }

    #[rstest]
    #[case(json!(null), false)]
    #[case(json!(""), false)]
    #[case(json!("x"), true)]
    #[case(json!(0), true)]
    #[case(json!(false), true)]
    #[case(json!([]), true)]
    #[case(json!({}), true)]
    fn only_null_and_empty_string_are_absent(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(is_meaningful(&value), expected);
    }

    #[test]
    fn reuse_requires_success() {
        let record = record_with(StageStatus::Failed, &[("audio_path", json!("/share/a.wav"))]);
        assert!(!can_reuse(&record, &["audio_path"]));

        let record = record_with(StageStatus::Pending, &[("audio_path", json!("/share/a.wav"))]);
        assert!(!can_reuse(&record, &["audio_path"]));
    }

    #[test]
    fn reuse_requires_non_empty_output() {
        let record = record_with(StageStatus::Success, &[]);
        assert!(!can_reuse(&record, &[]));
    }

    #[test]
    fn reuse_rejects_null_and_empty_string() {
        let record = record_with(StageStatus::Success, &[("audio_path", json!(null))]);
        assert!(!can_reuse(&record, &["audio_path"]));

        let record = record_with(StageStatus::Success, &[("audio_path", json!(""))]);
        assert!(!can_reuse(&record, &["audio_path"]));
    }

    #[test]
    fn zero_false_and_empty_list_are_valid() {
        let record = record_with(
            StageStatus::Success,
            &[
                ("segment_count", json!(0)),
                ("word_timestamps", json!(false)),
                ("variants", json!([])),
            ],
        );
        assert!(can_reuse(
            &record,
            &["segment_count", "word_timestamps", "variants"]
        ));
    }

    #[test]
    fn reuse_without_required_fields_checks_status_and_emptiness_only() {
        let record = record_with(StageStatus::Success, &[("anything", json!("x"))]);
        assert!(can_reuse(&record, &[]));
    }

    #[tokio::test]
    async fn index_round_trips_and_respects_kill_switch() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let index = CacheIndex::new(Arc::clone(&kv), true);

        let mut output = Map::new();
        output.insert("audio_path".into(), json!("/share/a.wav"));
        index.publish("ffmpeg.extract_audio:abc", "wf-A", &output).await;

        let hit = index
            .lookup("ffmpeg.extract_audio:abc", &["audio_path"])
            .await
            .expect("lookup");
        assert_eq!(hit, Some(output.clone()));

        let miss = index
            .lookup("ffmpeg.extract_audio:abc", &["missing_field"])
            .await
            .expect("lookup");
        assert_eq!(miss, None);

        let disabled = CacheIndex::new(kv, false);
        let off = disabled
            .lookup("ffmpeg.extract_audio:abc", &["audio_path"])
            .await
            .expect("lookup");
        assert_eq!(off, None);
    }
}
