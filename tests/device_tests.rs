use std::collections::HashSet;

use craned::device::{Device, DeviceKind, DeviceMap, EnvInjector};

fn gpu(slot: &str, minor: u32) -> Device {
    Device {
        slot_id: slot.to_string(),
        name: "gpu".to_string(),
        gres_type: "a100".to_string(),
        kind: DeviceKind::Char,
        major: 195,
        minor,
        env_injector: EnvInjector::Nvidia,
    }
}

#[test]
fn deny_set_is_the_complement_of_the_assignment() {
    let map = DeviceMap::from_devices(vec![
        gpu("/dev/nvidia0", 0),
        gpu("/dev/nvidia1", 1),
        gpu("/dev/nvidia2", 2),
    ]);

    let assigned: HashSet<String> = ["/dev/nvidia1".to_string()].into();
    let denied: Vec<&str> = map
        .denied_devices(&assigned)
        .iter()
        .map(|d| d.slot_id.as_str())
        .collect();
    assert_eq!(denied, vec!["/dev/nvidia0", "/dev/nvidia2"]);
}

#[test]
fn full_assignment_denies_nothing() {
    let map = DeviceMap::from_devices(vec![gpu("/dev/nvidia0", 0), gpu("/dev/nvidia1", 1)]);
    let assigned: HashSet<String> =
        ["/dev/nvidia0".to_string(), "/dev/nvidia1".to_string()].into();
    assert!(map.denied_devices(&assigned).is_empty());
}

#[test]
fn unknown_slots_in_the_assignment_are_ignored() {
    let map = DeviceMap::from_devices(vec![gpu("/dev/nvidia0", 0)]);
    let assigned: HashSet<String> = ["/dev/nvidia9".to_string()].into();

    // The unknown slot contributes nothing, and the known device stays
    // denied.
    assert_eq!(map.denied_devices(&assigned).len(), 1);
    assert!(map.env_for_assigned(&assigned).is_empty());
}

#[test]
fn injector_env_is_sorted_and_comma_separated() {
    let map = DeviceMap::from_devices(vec![
        gpu("/dev/nvidia2", 2),
        gpu("/dev/nvidia0", 0),
        gpu("/dev/nvidia1", 1),
    ]);
    let assigned: HashSet<String> = [
        "/dev/nvidia2".to_string(),
        "/dev/nvidia0".to_string(),
        "/dev/nvidia1".to_string(),
    ]
    .into();

    let env = map.env_for_assigned(&assigned);
    assert_eq!(env["CUDA_VISIBLE_DEVICES"], "0,1,2");
}

#[test]
fn devices_without_injector_add_no_env() {
    let mut dev = gpu("/dev/fpga0", 0);
    dev.env_injector = EnvInjector::None;
    let map = DeviceMap::from_devices(vec![dev]);

    let assigned: HashSet<String> = ["/dev/fpga0".to_string()].into();
    assert!(map.env_for_assigned(&assigned).is_empty());
}
