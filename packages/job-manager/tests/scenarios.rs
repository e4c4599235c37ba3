//! End-to-end scenarios driving the job manager through its public
//! surface with recording doubles, the way the host reactor would.

use serde_json::{json, Value};

use job_manager::event::EventEntry;
use job_manager::housekeeping::TargetStatus;
use job_manager::ids::JobId;
use job_manager::kvs::Kvs;
use job_manager::job::PRIORITY_UNSET;
use job_manager::restart::CHECKPOINT_KEY;
use job_manager::rpc::{Credentials, Response};
use job_manager::testing::TestHarness;
use job_manager::traits::{AllocResponse, StartResponse};
use job_manager::JobState;

fn payload(response: Response) -> Value {
    match response {
        Response::Payload(payload) => payload,
        Response::Error { errnum, errstr } => panic!("unexpected error {errnum}: {errstr}"),
    }
}

fn error_str(response: Response) -> String {
    match response {
        Response::Error { errstr, .. } => errstr,
        Response::Payload(payload) => panic!("unexpected success: {payload}"),
    }
}

#[tokio::test]
async fn s1_happy_path_to_run() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;

    let id = h.submit_job(h.basic_job()).await;

    let allocs = h.sched.take_allocs();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].id, id);
    assert_eq!(allocs[0].priority, 16);
    assert_eq!(allocs[0].userid, 42);
    assert_eq!(allocs[0].t_submit, 1.0);

    h.jm.handle_alloc_response(AllocResponse::Granted {
        id,
        note: Some(String::new()),
        annotations: None,
    })
    .await;
    h.settle().await;

    assert_eq!(h.jm.job_state(id), Some(JobState::Run));
    assert_eq!(
        h.event_names(id),
        vec!["submit", "validate", "depend", "priority", "alloc"]
    );

    // The persisted eventlog matches the in-memory one.
    let log = h
        .kvs
        .get_raw(&id.kvs_key("eventlog"))
        .await
        .unwrap()
        .expect("eventlog committed");
    let persisted = EventEntry::decode_log(&log).unwrap();
    assert_eq!(persisted.len(), 5);
    assert_eq!(persisted[0].name, "submit");
    assert_eq!(persisted[4].name, "alloc");
}

#[tokio::test]
async fn s2_hold_then_release() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;

    let id = h
        .submit_job(json!({ "jobspec": {}, "urgency": 0, "userid": 42 }))
        .await;

    // Held: parked in SCHED with minimum priority, not in the inqueue,
    // no alloc sent.
    assert_eq!(h.jm.job_state(id), Some(JobState::Sched));
    assert_eq!(h.jm.job_priority(id), Some(0));
    assert!(h.jm.sched_queue_ids().is_empty());
    assert!(h.sched.take_allocs().is_empty());

    let mut rx = h
        .rpc("job-manager.urgency", json!({ "id": id.0, "urgency": 16 }))
        .await;
    assert_eq!(payload(rx.try_recv().unwrap())["old_urgency"], json!(0));
    h.settle().await;

    assert_eq!(h.jm.job_priority(id), Some(16));
    let allocs = h.sched.take_allocs();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].priority, 16);
}

#[tokio::test]
async fn s3_exception_before_alloc_response() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;

    let id = h
        .submit_job(json!({ "jobspec": {}, "urgency": 16, "userid": 42, "flags": 1 }))
        .await;
    assert_eq!(h.sched.take_allocs().len(), 1);

    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel", "note": "changed my mind" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;

    // The pending alloc was cancelled and the job ran to INACTIVE.
    assert_eq!(h.sched.take_cancels(), vec![id]);
    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));
    let names = h.event_names(id);
    assert_eq!(names.last().map(String::as_str), Some("clean"));
    assert!(names.contains(&"exception".to_string()));
    assert!(h.bus.topics().contains(&"job-exception".to_string()));

    let mut rx = h.rpc("job-manager.wait", json!({ "id": id.0 })).await;
    let result = payload(rx.try_recv().unwrap());
    assert_eq!(result["success"], json!(false));
    assert_eq!(
        result["errstr"],
        json!("Fatal exception type=cancel changed my mind")
    );
}

async fn run_job_with_resources(h: &mut TestHarness, ranks: &str) -> JobId {
    let id = h.submit_job(h.basic_job()).await;
    assert_eq!(h.sched.take_allocs().len(), 1);
    h.kvs
        .insert_doc(
            &id.kvs_key("R"),
            json!({ "execution": { "ranks": ranks, "starttime": 100.0 } }),
        )
        .await;
    h.jm.handle_alloc_response(AllocResponse::Granted {
        id,
        note: None,
        annotations: None,
    })
    .await;
    h.settle().await;
    assert_eq!(h.jm.job_state(id), Some(JobState::Run));
    id
}

#[tokio::test(start_paused = true)]
async fn s4_housekeeping_collapsed_final_release() {
    let mut h = TestHarness::with_config(
        job_manager::Config::from_value(json!({
            "housekeeping": { "command": ["/bin/true"], "release-after": "1s" },
        }))
        .unwrap(),
    );
    h.scheduler_ready("unlimited").await;
    let id = run_job_with_resources(&mut h, "0-1").await;

    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;

    // Resources went to housekeeping; the job finished without waiting.
    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));
    let launches = h.bulk.take_launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].1, vec![0, 1]);
    assert_eq!(launches[0].2, vec!["/bin/true".to_string()]);
    assert!(launches[0]
        .3
        .iter()
        .any(|(k, v)| k == "FLUX_JOB_ID" && *v == id.to_string()));
    assert!(h.sched.take_frees().is_empty());

    // Both targets complete before the release-after timer fires: one
    // collapsed final release carrying every rank.
    h.jm.handle_housekeeping_finish(id, 0, TargetStatus::Exited(0))
        .await;
    assert!(h.sched.take_frees().is_empty());
    h.jm.handle_housekeeping_finish(id, 1, TargetStatus::Exited(0))
        .await;
    let frees = h.sched.take_frees();
    assert_eq!(frees.len(), 1);
    assert_eq!(frees[0].ranks.as_deref(), Some(&[0u32, 1][..]));
    assert!(frees[0].is_final);
}

#[tokio::test(start_paused = true)]
async fn s4_housekeeping_timer_partial_release() {
    let mut h = TestHarness::with_config(
        job_manager::Config::from_value(json!({
            "housekeeping": { "command": ["/bin/true"], "release-after": "1s" },
        }))
        .unwrap(),
    );
    h.scheduler_ready("unlimited").await;
    let id = run_job_with_resources(&mut h, "0-1").await;
    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;
    h.bulk.take_launches();

    h.jm.handle_housekeeping_finish(id, 0, TargetStatus::Exited(0))
        .await;
    assert!(h.jm.housekeeping_next_deadline().is_some());

    tokio::time::advance(std::time::Duration::from_secs(2)).await;
    h.jm.handle_housekeeping_timer().await;
    let frees = h.sched.take_frees();
    assert_eq!(frees.len(), 1);
    assert_eq!(frees[0].ranks.as_deref(), Some(&[0u32][..]));
    assert!(!frees[0].is_final);

    h.jm.handle_housekeeping_finish(id, 1, TargetStatus::Exited(1))
        .await;
    let frees = h.sched.take_frees();
    assert_eq!(frees.len(), 1);
    assert_eq!(frees[0].ranks.as_deref(), Some(&[1u32][..]));
    assert!(frees[0].is_final);
}

#[tokio::test]
async fn s5_restart_consistency() {
    // First life: job A parked in SCHED, job B running.
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let a = h.submit_job(h.basic_job()).await;
    let b = h
        .submit_job(json!({ "jobspec": {}, "urgency": 16, "userid": 7 }))
        .await;
    h.sched.take_allocs();
    h.kvs
        .insert_doc(&b.kvs_key("R"), json!({ "execution": { "ranks": "0" } }))
        .await;
    h.jm.handle_alloc_response(AllocResponse::Granted {
        id: b,
        note: None,
        annotations: None,
    })
    .await;
    h.settle().await;
    assert_eq!(h.jm.job_state(a), Some(JobState::Sched));
    assert_eq!(h.jm.job_state(b), Some(JobState::Run));
    h.jm.shutdown().await.unwrap();
    let max_jobid = h.jm.max_jobid();

    // Second life over the same store.
    let mut h2 = TestHarness::with_store(h.kvs.clone());
    let summary = h2.jm.restart(0).await.unwrap();
    assert_eq!(summary.active, 2);
    assert_eq!(summary.running, 1);
    h2.settle().await;

    // A went back through the PRIORITY pathway and was reprioritized.
    let names = h2.event_names(a);
    assert!(names.contains(&"flux-restart".to_string()));
    assert_eq!(names.last().map(String::as_str), Some("priority"));
    assert_eq!(h2.jm.job_state(a), Some(JobState::Sched));
    assert_ne!(h2.jm.job_priority(a), Some(PRIORITY_UNSET));

    // B stays RUN, marked for reattach.
    assert_eq!(h2.jm.job_state(b), Some(JobState::Run));
    assert_eq!(h2.jm.job_is_reattach(b), Some(true));
    assert_eq!(h2.jm.stats()["running_jobs"], json!(1));
    assert_eq!(h2.jm.max_jobid(), max_jobid);
}

#[tokio::test]
async fn s6_owner_override_freezes_job() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;

    // Instance owner (uid 0) updates user 42's job; validation is
    // skipped for the owner, so the job is frozen afterwards.
    let mut rx = h
        .rpc(
            "job-manager.update",
            json!({ "id": id.0, "updates": { "attributes.system.duration": 600.0 } }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;

    let names = h.event_names(id);
    assert!(names.contains(&"jobspec-update".to_string()));
    assert!(names.contains(&"set-flags".to_string()));

    let mut rx = h
        .rpc_as(
            "job-manager.update",
            json!({ "id": id.0, "updates": { "attributes.system.duration": 1200.0 } }),
            Credentials::user(42),
        )
        .await;
    assert_eq!(
        error_str(rx.try_recv().unwrap()),
        "job is immutable due to previous instance owner update"
    );
}

#[tokio::test]
async fn submit_to_disabled_queue_is_rejected_without_insertion() {
    let mut h = TestHarness::with_config(
        job_manager::Config::from_value(json!({
            "queues": { "batch": {} },
        }))
        .unwrap(),
    );
    let mut rx = h
        .rpc(
            "job-manager.queue-enable",
            json!({ "name": "batch", "enable": false, "reason": "maintenance window" }),
        )
        .await;
    payload(rx.try_recv().unwrap());

    let mut rx = h
        .rpc(
            "job-manager.submit",
            json!({ "jobs": [{ "jobspec": { "attributes": { "system": { "queue": "batch" } } } }] }),
        )
        .await;
    h.settle().await;
    let response = payload(rx.try_recv().unwrap());
    assert_eq!(response["ids"], json!([]));
    assert_eq!(response["errors"][0][1], json!("maintenance window"));
    assert_eq!(h.jm.active_count(), 0);
}

#[tokio::test]
async fn single_mode_admits_one_outstanding_alloc() {
    let mut h = TestHarness::new();
    h.scheduler_ready("single").await;
    let first = h.submit_job(h.basic_job()).await;
    let second = h.submit_job(h.basic_job()).await;

    let allocs = h.sched.take_allocs();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].id, first);
    assert_eq!(h.jm.job_sched_flags(second), Some((true, false)));

    // The response frees the slot and the next request goes out.
    h.jm.handle_alloc_response(AllocResponse::Granted {
        id: first,
        note: None,
        annotations: None,
    })
    .await;
    h.settle().await;
    let allocs = h.sched.take_allocs();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].id, second);
}

#[tokio::test]
async fn alloc_queued_and_pending_are_exclusive() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    // After the drain the job has a request outstanding and is out of
    // the queue.
    assert_eq!(h.jm.job_sched_flags(id), Some((false, true)));
    assert!(h.jm.sched_queue_ids().is_empty());
}

#[tokio::test]
async fn scheduler_teardown_requeues_pending_allocs() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    assert_eq!(h.sched.take_allocs().len(), 1);

    h.jm.handle_scheduler_error("scheduler unloaded");
    assert!(!h.jm.sched_ready());
    assert_eq!(h.jm.job_sched_flags(id), Some((true, false)));
    assert_eq!(h.jm.sched_queue_ids(), vec![id]);

    // Next handshake resends automatically.
    h.scheduler_ready("unlimited").await;
    let allocs = h.sched.take_allocs();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].id, id);
}

#[tokio::test]
async fn alloc_error_response_raises_fatal_exception() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    h.sched.take_allocs();

    h.jm.handle_alloc_response(AllocResponse::Error {
        id,
        note: Some("unsatisfiable request".to_string()),
    })
    .await;
    h.settle().await;
    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));
    let log = h.event_names(id);
    assert!(log.contains(&"exception".to_string()));
}

#[tokio::test]
async fn cancel_race_returns_transient_grant() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    h.sched.take_allocs();

    // Cancel first; the grant arrives anyway.
    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    assert_eq!(h.sched.take_cancels(), vec![id]);

    h.settle().await;
    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));

    // The grant that raced the cancel is returned whole, and the
    // interface stays up.
    h.jm.handle_alloc_response(AllocResponse::Granted {
        id,
        note: None,
        annotations: None,
    })
    .await;
    let frees = h.sched.take_frees();
    assert_eq!(frees.len(), 1);
    assert!(frees[0].is_final);
    assert!(h.jm.sched_ready());
}

#[tokio::test]
async fn exec_interface_runs_job_to_completion() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    h.exec_ready("job-exec").await;
    let id = run_job_with_resources(&mut h, "0").await;

    let starts = h.exec.take_starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].0, "job-exec");
    assert_eq!(starts[0].1, id);
    assert_eq!(starts[0].2, 42);

    h.jm.handle_start_response(StartResponse::Start { id }).await;
    h.jm.handle_start_response(StartResponse::Finish { id, status: 0 })
        .await;
    h.jm.handle_start_response(StartResponse::Release {
        id,
        ranks: "all".to_string(),
        is_final: true,
    })
    .await;
    h.settle().await;

    let frees = h.sched.take_frees();
    assert_eq!(frees.len(), 1);
    assert!(frees[0].is_final);
    h.jm.handle_free_response(id).await;
    h.settle().await;

    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));
    let names = h.event_names(id);
    assert_eq!(
        names,
        vec![
            "submit",
            "validate",
            "depend",
            "priority",
            "alloc",
            "start",
            "finish",
            "release",
            "free",
            "clean"
        ]
    );
}

#[tokio::test]
async fn wait_any_with_no_waitables_fails_like_no_children() {
    let mut h = TestHarness::new();
    let mut rx = h
        .rpc("job-manager.wait", json!({ "id": u64::MAX }))
        .await;
    let err = rx.try_recv().unwrap();
    match err {
        Response::Error { errnum, .. } => assert_eq!(errnum, 10),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn journal_streams_events_with_sequence_numbers() {
    let mut h = TestHarness::new();
    let mut journal = h.rpc("job-manager.journal", json!({})).await;
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;

    let first = payload(journal.try_recv().unwrap());
    assert_eq!(first["id"], json!(id.0));
    assert_eq!(first["eventlog_seq"], json!(1));
    assert_eq!(first["events"][0]["name"], json!("submit"));
    let second = payload(journal.try_recv().unwrap());
    assert_eq!(second["eventlog_seq"], json!(2));
}

#[tokio::test]
async fn getinfo_reports_max_jobid_only_after_commit() {
    let mut h = TestHarness::new();
    let mut rx = h
        .rpc("job-manager.submit", json!({ "jobs": [h.basic_job()] }))
        .await;
    // Pre-commit: the id exists in memory but is not advertised.
    let mut info = h.rpc("job-manager.getinfo", json!({})).await;
    assert_eq!(payload(info.try_recv().unwrap())["max_jobid"], json!(0));

    h.settle().await;
    let id = payload(rx.try_recv().unwrap())["ids"][0].as_u64().unwrap();
    let mut info = h.rpc("job-manager.getinfo", json!({})).await;
    assert_eq!(payload(info.try_recv().unwrap())["max_jobid"], json!(id));
}

#[tokio::test]
async fn purge_removes_inactive_job_and_its_store_entries() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;
    assert_eq!(h.jm.job_state(id), Some(JobState::Inactive));
    assert!(h.kvs.contains(&id.kvs_key("eventlog")).await);

    let mut rx = h.rpc("job-manager.purge", json!({ "id": id.0 })).await;
    h.settle().await;
    assert_eq!(payload(rx.try_recv().unwrap())["count"], json!(1));
    assert_eq!(h.jm.inactive_count(), 0);
    assert!(!h.kvs.contains(&id.kvs_key("eventlog")).await);
}

#[tokio::test]
async fn drain_completes_when_last_job_retires() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    let mut drain = h.rpc("job-manager.drain", json!({})).await;
    assert!(drain.try_recv().is_err());

    let mut rx = h
        .rpc(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;
    payload(drain.try_recv().expect("drain completed"));
}

#[tokio::test]
async fn annotations_merge_and_publish_via_batch() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await;
    h.bus.take_published();

    let mut rx = h
        .rpc(
            "job-manager.annotate",
            json!({ "id": id.0, "annotations": { "user": { "note": "rerun of 123" } } }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;
    assert_eq!(
        h.jm.job_annotations(id),
        Some(json!({ "user": { "note": "rerun of 123" } }))
    );
    assert!(h.bus.topics().contains(&"job-annotations".to_string()));

    // Deleting the only key removes the container entirely.
    let mut rx = h
        .rpc(
            "job-manager.annotate",
            json!({ "id": id.0, "annotations": { "user": { "note": null } } }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.settle().await;
    assert_eq!(h.jm.job_annotations(id), None);
}

#[tokio::test]
async fn queue_state_survives_restart_via_checkpoint() {
    let config = json!({ "queues": { "batch": {}, "debug": {} } });
    let mut h = TestHarness::with_config(
        job_manager::Config::from_value(config.clone()).unwrap(),
    );
    let mut rx = h
        .rpc(
            "job-manager.queue-start",
            json!({ "name": "batch", "start": true }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    let mut rx = h
        .rpc(
            "job-manager.queue-enable",
            json!({ "name": "debug", "enable": false, "reason": "gpu firmware" }),
        )
        .await;
    payload(rx.try_recv().unwrap());
    h.jm.shutdown().await.unwrap();
    assert!(h.kvs.contains(CHECKPOINT_KEY).await);

    let mut h2 = TestHarness::with_store_and_config(
        h.kvs.clone(),
        job_manager::Config::from_value(config).unwrap(),
    );
    h2.jm.restart(0).await.unwrap();
    let mut rx = h2
        .rpc("job-manager.queue-status", json!({ "name": "debug" }))
        .await;
    let status = payload(rx.try_recv().unwrap());
    assert_eq!(status["enable"], json!(false));
    assert_eq!(status["disable_reason"], json!("gpu firmware"));
}

#[tokio::test]
async fn kvs_commit_failure_is_fatal() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    h.kvs.poison().await;
    let mut rx = h
        .rpc("job-manager.submit", json!({ "jobs": [h.basic_job()] }))
        .await;
    h.settle().await;
    assert!(h.jm.fatal_error().is_some());
    // The caller still gets exactly one (error) response.
    assert!(matches!(
        rx.try_recv().unwrap(),
        Response::Error { .. }
    ));
}

#[tokio::test]
async fn inqueue_is_ordered_by_priority_then_id() {
    let mut h = TestHarness::new();
    // No scheduler: jobs stay queued.
    let low = h
        .submit_job(json!({ "jobspec": {}, "urgency": 8, "userid": 1 }))
        .await;
    let high = h
        .submit_job(json!({ "jobspec": {}, "urgency": 24, "userid": 1 }))
        .await;
    let mid = h
        .submit_job(json!({ "jobspec": {}, "urgency": 16, "userid": 1 }))
        .await;
    assert_eq!(h.jm.sched_queue_ids(), vec![high, mid, low]);
}

#[tokio::test]
async fn events_arriving_during_commit_drain_in_order() {
    let mut h = TestHarness::new();
    let mut rx = h
        .rpc("job-manager.submit", json!({ "jobs": [h.basic_job()] }))
        .await;
    let id = h.jm.active_ids()[0];

    // Close the batch as though its commit were in flight: the job is
    // paused and new events queue instead of applying.
    let batch = h.jm.flush_batch().expect("open batch");
    let mut urx = h
        .rpc("job-manager.urgency", json!({ "id": id.0, "urgency": 31 }))
        .await;
    payload(urx.try_recv().unwrap());
    assert_eq!(h.jm.job_priority(id), Some(16));

    // Commit completes: queued events drain through the normal path and
    // the priority catches up (expedite pins it to the ceiling).
    h.kvs.commit(batch.txn.clone()).await.unwrap();
    h.jm.complete_batch(batch, true).await;
    h.settle().await;
    payload(rx.try_recv().unwrap());
    assert_eq!(
        h.jm.job_priority(id),
        Some(job_manager::job::PRIORITY_MAX)
    );
    let names = h.event_names(id);
    assert!(names.contains(&"urgency".to_string()));
}

#[tokio::test]
async fn limited_mode_caps_outstanding_requests() {
    let mut h = TestHarness::new();
    h.scheduler_ready("limited").await; // limit = 2
    for _ in 0..3 {
        h.submit_job(h.basic_job()).await;
    }
    assert_eq!(h.sched.take_allocs().len(), 2);
    assert_eq!(h.jm.sched_queue_ids().len(), 1);
}

#[tokio::test]
async fn guest_cannot_touch_foreign_jobs() {
    let mut h = TestHarness::new();
    h.scheduler_ready("unlimited").await;
    let id = h.submit_job(h.basic_job()).await; // owned by uid 42

    let mut rx = h
        .rpc_as(
            "job-manager.raise",
            json!({ "id": id.0, "severity": 0, "type": "cancel" }),
            Credentials::user(99),
        )
        .await;
    match rx.try_recv().unwrap() {
        Response::Error { errnum, .. } => assert_eq!(errnum, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.jm.job_state(id), Some(JobState::Sched));
}
