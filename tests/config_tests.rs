use std::io::Write;

use craned::config::{parse_memory, CranedConfig};

#[test]
fn memory_size_suffixes() {
    assert_eq!(parse_memory("512").unwrap(), 512);
    assert_eq!(parse_memory("16K").unwrap(), 16 * 1024);
    assert_eq!(parse_memory("64M").unwrap(), 64 * 1024 * 1024);
    assert_eq!(parse_memory("8G").unwrap(), 8 * 1024 * 1024 * 1024);
    assert!(parse_memory("").is_err());
    assert!(parse_memory("1X").is_err());
}

#[test]
fn config_resolves_paths_under_base_dir() {
    let hostname = nix::unistd::gethostname()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
CraneBaseDir: /tmp/crane-test
ControlMachine: ctld.example.com
Nodes:
  - name: {hostname}
    cpu: 8
    memory: 16G
"#
    )
    .unwrap();

    let config = CranedConfig::load(file.path()).unwrap();
    assert_eq!(config.craned_id, hostname);
    assert_eq!(config.cpu_count, 8);
    assert_eq!(config.memory_bytes, 16 * 1024 * 1024 * 1024);
    assert_eq!(config.control_machine, "ctld.example.com");
    assert_eq!(
        config.craned_script_dir,
        std::path::Path::new("/tmp/crane-test/cranedscript")
    );
    assert_eq!(
        config.supervisor_sock_path(7),
        std::path::Path::new("/tmp/crane-test/task_7.sock")
    );
    assert_eq!(
        config.script_path(7),
        std::path::Path::new("/tmp/crane-test/cranedscript/Crane-7.sh")
    );
}

#[test]
fn config_rejects_hosts_missing_from_the_node_table() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
ControlMachine: ctld.example.com
Nodes:
  - name: some-other-node
    cpu: 4
    memory: 8G
"#
    )
    .unwrap();

    assert!(CranedConfig::load(file.path()).is_err());
}
