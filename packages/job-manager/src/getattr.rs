//! Per-job attribute fetch.

use serde_json::{json, Value};

use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

impl JobManager {
    /// getattr {id, attrs: [...]}: return jobspec, R, or the eventlog.
    pub(crate) async fn handle_getattr(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let attrs = request
            .key("attrs")?
            .as_array()
            .cloned()
            .ok_or_else(|| ServiceError::proto("'attrs' is not an array"))?;
        let (userid, jobspec, resources, eventlog) = {
            let job = self
                .jobs
                .lookup(id)
                .ok_or_else(|| ServiceError::NotFound(format!("job {id} not found")))?;
            let eventlog: Vec<Value> = job.eventlog.iter().map(|entry| entry.to_json()).collect();
            (
                job.userid,
                job.jobspec.clone(),
                job.resources.clone(),
                eventlog,
            )
        };
        if !request.cred.may_act_on(userid) {
            return Err(ServiceError::Authorization(
                "guests may only read their own jobs".to_string(),
            ));
        }
        let mut payload = serde_json::Map::new();
        for attr in &attrs {
            let name = attr
                .as_str()
                .ok_or_else(|| ServiceError::proto("attr name is not a string"))?;
            match name {
                "jobspec" => {
                    payload.insert("jobspec".to_string(), jobspec.clone());
                }
                "R" => {
                    let resources = match &resources {
                        Some(r) => r.clone(),
                        None => self
                            .kvs
                            .get(&id.kvs_key("R"))
                            .await
                            .ok()
                            .flatten()
                            .ok_or_else(|| {
                                ServiceError::NotFound(format!("job {id} has no resources"))
                            })?,
                    };
                    payload.insert("R".to_string(), resources);
                }
                "eventlog" => {
                    payload.insert("eventlog".to_string(), json!(eventlog.clone()));
                }
                other => {
                    return Err(ServiceError::Validation(format!(
                        "unknown attribute '{other}'"
                    )));
                }
            }
        }
        request.responder.respond(Value::Object(payload));
        Ok(())
    }
}
