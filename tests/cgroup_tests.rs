use std::collections::HashSet;

use craned::cgroup::bpf::{
    BpfDeviceMeta, BpfKey, BPF_DEVCG_ACC_MKNOD, BPF_DEVCG_ACC_READ, BPF_DEVCG_ACC_WRITE,
    BPF_DEVCG_DEV_CHAR, BPF_PERMISSION_DENY,
};
use craned::cgroup::{
    cgroup_name_of, job_id_from_cgroup_name, reconcile_partitions, ControllerFlags,
    V1_REQUIRED_CONTROLLERS, V2_REQUIRED_CONTROLLERS,
};

#[test]
fn cgroup_names_are_a_bijection_over_job_ids() {
    for job_id in [0u32, 1, 7, 4096, u32::MAX] {
        let name = cgroup_name_of(job_id);
        assert_eq!(job_id_from_cgroup_name(&name), Some(job_id));
    }
}

#[test]
fn foreign_directory_names_are_ignored() {
    for name in [
        "system.slice",
        "user.slice",
        "Crane_Task_",
        "Crane_Task_abc",
        "Crane_Task_1_2",
        "crane_task_1",
    ] {
        assert_eq!(job_id_from_cgroup_name(name), None);
    }
}

#[test]
fn required_controller_sets() {
    assert!(V1_REQUIRED_CONTROLLERS.contains(ControllerFlags::CPU));
    assert!(V1_REQUIRED_CONTROLLERS.contains(ControllerFlags::MEMORY));
    assert!(V1_REQUIRED_CONTROLLERS.contains(ControllerFlags::DEVICES));
    assert!(V1_REQUIRED_CONTROLLERS.contains(ControllerFlags::BLKIO));
    assert!(!V1_REQUIRED_CONTROLLERS.contains(ControllerFlags::FREEZER));

    assert!(V2_REQUIRED_CONTROLLERS.contains(ControllerFlags::CPU_V2));
    assert!(V2_REQUIRED_CONTROLLERS.contains(ControllerFlags::MEMORY_V2));
    assert!(V2_REQUIRED_CONTROLLERS.contains(ControllerFlags::IO_V2));
    assert!(!V2_REQUIRED_CONTROLLERS.contains(ControllerFlags::PIDS_V2));
}

#[test]
fn reconciliation_removes_exactly_the_unknown_jobs() {
    let discovered = vec![11, 12, 13];
    let running: HashSet<u32> = [11].into();

    let (kept, removed) = reconcile_partitions(&discovered, &running);
    assert_eq!(kept, vec![11]);
    assert_eq!(removed, vec![12, 13]);
}

#[test]
fn reconciliation_twice_yields_the_same_live_set() {
    let discovered = vec![1, 2, 3];
    let running: HashSet<u32> = [1, 3].into();

    let (kept, _) = reconcile_partitions(&discovered, &running);
    let (kept_again, removed_again) = reconcile_partitions(&kept, &running);
    assert_eq!(kept, kept_again);
    assert!(removed_again.is_empty());
}

#[test]
fn bpf_entry_layout_round_trips() {
    let key = BpfKey {
        cgroup_id: 987654321,
        major: 195,
        minor: 1,
    };
    let meta = BpfDeviceMeta {
        major: 195,
        minor: 1,
        permission: BPF_PERMISSION_DENY,
        access: BPF_DEVCG_ACC_READ | BPF_DEVCG_ACC_WRITE | BPF_DEVCG_ACC_MKNOD,
        dev_type: BPF_DEVCG_DEV_CHAR,
    };

    assert_eq!(BpfKey::from_bytes(&key.to_bytes()), Some(key));
    assert_eq!(BpfDeviceMeta::from_bytes(&meta.to_bytes()), Some(meta));
    assert_eq!(key.to_bytes().len(), 16);
    assert_eq!(meta.to_bytes().len(), 16);
}
