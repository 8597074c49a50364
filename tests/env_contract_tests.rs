use std::collections::HashMap;

use craned::proto::{JobType, TaskSpec};
use craned::supervisor::env::build_task_env;

fn base_task() -> TaskSpec {
    TaskSpec {
        job_id: 12,
        name: "interactive".to_string(),
        r#type: JobType::Batch as i32,
        account: "research".to_string(),
        partition: "cpu".to_string(),
        qos: "high".to_string(),
        nodelist: vec!["cn0".to_string()],
        excludes: vec![],
        time_limit_seconds: 90,
        ..Default::default()
    }
}

#[test]
fn all_contract_variables_are_present() {
    let env = build_task_env(&base_task(), &HashMap::new(), 2 * 1024 * 1024 * 1024);

    for var in [
        "CRANE_JOB_NODELIST",
        "CRANE_EXCLUDES",
        "CRANE_JOB_NAME",
        "CRANE_ACCOUNT",
        "CRANE_PARTITION",
        "CRANE_QOS",
        "CRANE_JOB_ID",
        "CRANE_TIMELIMIT",
        "CRANE_MEM_PER_NODE",
    ] {
        assert!(env.contains_key(var), "missing {var}");
    }

    assert_eq!(env["CRANE_JOB_ID"], "12");
    assert_eq!(env["CRANE_TIMELIMIT"], "00:01:30");
    assert_eq!(env["CRANE_MEM_PER_NODE"], "2048");
}

#[test]
fn explicit_overlay_survives_but_contract_wins() {
    let mut task = base_task();
    task.env.insert("PATH".to_string(), "/opt/bin".to_string());
    task.env
        .insert("CRANE_JOB_ID".to_string(), "spoofed".to_string());

    let env = build_task_env(&task, &HashMap::new(), 0);
    assert_eq!(env["PATH"], "/opt/bin");
    // The contract value overrides the user-supplied one.
    assert_eq!(env["CRANE_JOB_ID"], "12");
}

#[test]
fn term_only_for_interactive_run() {
    let mut task = base_task();
    task.term_env = "xterm".to_string();
    let env = build_task_env(&task, &HashMap::new(), 0);
    assert!(!env.contains_key("TERM"));

    task.r#type = JobType::Crun as i32;
    let env = build_task_env(&task, &HashMap::new(), 0);
    assert_eq!(env["TERM"], "xterm");
}

#[test]
fn memory_cap_is_reported_in_mebibytes() {
    let env = build_task_env(&base_task(), &HashMap::new(), 128 * 1024 * 1024);
    assert_eq!(env["CRANE_MEM_PER_NODE"], "128");

    let env = build_task_env(&base_task(), &HashMap::new(), 1024 * 1024 - 1);
    assert_eq!(env["CRANE_MEM_PER_NODE"], "0");
}
