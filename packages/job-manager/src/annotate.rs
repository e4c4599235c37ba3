//! Job annotations.
//!
//! Annotations are transient metadata (scheduler notes, user memos)
//! merged recursively: null values delete keys, subdictionaries merge
//! deeply, and a subdictionary that becomes empty is pruned. They are
//! not eventlog events; observers learn of changes through the batch
//! publication channel.

use serde_json::{Map, Value};

use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

/// Deep-merge `updates` into `target`. Returns true when anything
/// observable changed.
fn merge(target: &mut Map<String, Value>, updates: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, value) in updates {
        match value {
            Value::Null => {
                changed |= target.remove(key).is_some();
            }
            Value::Object(sub_updates) => {
                let emptied = {
                    let sub = target
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !sub.is_object() {
                        *sub = Value::Object(Map::new());
                        changed = true;
                    }
                    let sub_map = sub.as_object_mut().expect("object ensured above");
                    changed |= merge(sub_map, sub_updates);
                    sub_map.is_empty()
                };
                if emptied {
                    // Prune rather than keep an empty subdict. Creating
                    // and immediately pruning one is not a change.
                    target.remove(key);
                }
            }
            other => {
                if target.get(key) != Some(other) {
                    target.insert(key.clone(), other.clone());
                    changed = true;
                }
            }
        }
    }
    changed
}

impl JobManager {
    /// Merge an annotation update into a job. The annotations container
    /// disappears when the merge leaves it empty. Returns whether
    /// anything changed; changes are queued for batch publication.
    pub(crate) fn annotations_update(
        &mut self,
        id: JobId,
        updates: &Value,
    ) -> Result<bool, ServiceError> {
        let updates = updates
            .as_object()
            .ok_or_else(|| ServiceError::proto("annotations must be an object"))?;
        let job = self
            .jobs
            .active_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        let mut map = match job.annotations.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let changed = merge(&mut map, updates);
        job.annotations = if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        };
        if changed {
            self.event.defer_annotation_pub(id);
        }
        Ok(changed)
    }

    /// annotate {id, annotations}
    pub(crate) fn handle_annotate(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let updates = request.key("annotations")?.clone();
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only annotate their own jobs".to_string(),
            ));
        }
        self.annotations_update(id, &updates)?;
        request.responder.respond(serde_json::json!({}));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_update_is_a_noop() {
        let mut target = as_map(json!({"sched": {"reason": "waiting"}}));
        assert!(!merge(&mut target, &as_map(json!({}))));
        assert_eq!(target, as_map(json!({"sched": {"reason": "waiting"}})));
    }

    #[test]
    fn null_removes_key() {
        let mut target = as_map(json!({"a": 1, "b": 2}));
        assert!(merge(&mut target, &as_map(json!({"a": null}))));
        assert_eq!(target, as_map(json!({"b": 2})));
    }

    #[test]
    fn removing_missing_key_changes_nothing() {
        let mut target = as_map(json!({"b": 2}));
        assert!(!merge(&mut target, &as_map(json!({"a": null}))));
    }

    #[test]
    fn deep_merge_preserves_siblings() {
        let mut target = as_map(json!({"sched": {"reason": "waiting", "queue": "batch"}}));
        assert!(merge(
            &mut target,
            &as_map(json!({"sched": {"reason": "resources"}}))
        ));
        assert_eq!(
            target,
            as_map(json!({"sched": {"reason": "resources", "queue": "batch"}}))
        );
    }

    #[test]
    fn emptied_subdict_is_pruned() {
        let mut target = as_map(json!({"sched": {"reason": "waiting"}}));
        assert!(merge(
            &mut target,
            &as_map(json!({"sched": {"reason": null}}))
        ));
        assert!(target.is_empty());
    }

    #[test]
    fn identical_value_is_not_a_change() {
        let mut target = as_map(json!({"a": 1}));
        assert!(!merge(&mut target, &as_map(json!({"a": 1}))));
    }
}
