//! Environment construction for the user process.

use std::collections::HashMap;

use crate::proto::{self, JobType};
use crate::util::format_time_limit;

/// Build the environment of the user process: the task's explicit overlay,
/// the CRANE_* contract, login variables when requested, the interactive
/// TERM, and per-device injector variables.
pub fn build_task_env(
    task: &proto::TaskSpec,
    device_env: &HashMap<String, String>,
    memory_limit_bytes: u64,
) -> HashMap<String, String> {
    let mut env_map: HashMap<String, String> = task.env.clone();

    if task.get_user_env {
        // The user's login environment is reconstructed on this node by
        // running bash --login; HOME and SHELL come from the password
        // entry, mimicking the login step.
        if let Ok(Some(user)) =
            nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(task.uid))
        {
            env_map.insert("HOME".to_string(), user.dir.to_string_lossy().into_owned());
            env_map.insert(
                "SHELL".to_string(),
                user.shell.to_string_lossy().into_owned(),
            );
        }
    }

    env_map.insert("CRANE_JOB_NODELIST".to_string(), task.nodelist.join(";"));
    env_map.insert("CRANE_EXCLUDES".to_string(), task.excludes.join(";"));
    env_map.insert("CRANE_JOB_NAME".to_string(), task.name.clone());
    env_map.insert("CRANE_ACCOUNT".to_string(), task.account.clone());
    env_map.insert("CRANE_PARTITION".to_string(), task.partition.clone());
    env_map.insert("CRANE_QOS".to_string(), task.qos.clone());
    env_map.insert("CRANE_JOB_ID".to_string(), task.job_id.to_string());
    env_map.insert(
        "CRANE_TIMELIMIT".to_string(),
        format_time_limit(task.time_limit_seconds),
    );

    if task.r#type == JobType::Crun as i32 && !task.term_env.is_empty() {
        env_map.insert("TERM".to_string(), task.term_env.clone());
    }

    for (name, value) in device_env {
        env_map.insert(name.clone(), value.clone());
    }

    env_map.insert(
        "CRANE_MEM_PER_NODE".to_string(),
        (memory_limit_bytes / (1024 * 1024)).to_string(),
    );

    env_map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_spec() -> proto::TaskSpec {
        proto::TaskSpec {
            job_id: 7,
            name: "train".to_string(),
            r#type: JobType::Batch as i32,
            account: "acct".to_string(),
            partition: "gpu".to_string(),
            qos: "normal".to_string(),
            nodelist: vec!["cn1".to_string(), "cn2".to_string()],
            excludes: vec!["cn3".to_string()],
            time_limit_seconds: 3661,
            ..Default::default()
        }
    }

    #[test]
    fn crane_env_contract() {
        let env = build_task_env(&task_spec(), &HashMap::new(), 128 * 1024 * 1024);
        assert_eq!(env["CRANE_JOB_ID"], "7");
        assert_eq!(env["CRANE_JOB_NAME"], "train");
        assert_eq!(env["CRANE_JOB_NODELIST"], "cn1;cn2");
        assert_eq!(env["CRANE_EXCLUDES"], "cn3");
        assert_eq!(env["CRANE_ACCOUNT"], "acct");
        assert_eq!(env["CRANE_PARTITION"], "gpu");
        assert_eq!(env["CRANE_QOS"], "normal");
        assert_eq!(env["CRANE_TIMELIMIT"], "01:01:01");
        assert_eq!(env["CRANE_MEM_PER_NODE"], "128");
        assert!(!env.contains_key("TERM"));
    }

    #[test]
    fn task_overlay_is_preserved() {
        let mut task = task_spec();
        task.env
            .insert("MY_VAR".to_string(), "my-value".to_string());
        let env = build_task_env(&task, &HashMap::new(), 0);
        assert_eq!(env["MY_VAR"], "my-value");
    }

    #[test]
    fn term_is_set_for_interactive_pty() {
        let mut task = task_spec();
        task.r#type = JobType::Crun as i32;
        task.term_env = "xterm-256color".to_string();
        let env = build_task_env(&task, &HashMap::new(), 0);
        assert_eq!(env["TERM"], "xterm-256color");
    }

    #[test]
    fn device_injector_vars_are_added() {
        let device_env: HashMap<String, String> =
            [("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string())].into();
        let env = build_task_env(&task_spec(), &device_env, 0);
        assert_eq!(env["CUDA_VISIBLE_DEVICES"], "0,1");
    }
}
