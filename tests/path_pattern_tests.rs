use craned::util::{format_time_limit, parse_file_path_pattern, substitute_path_tokens};

#[test]
fn empty_pattern_defaults_to_cwd_output_file() {
    assert_eq!(
        parse_file_path_pattern("", "/home/alice", 7),
        "/home/alice/Crane-7.out"
    );
}

#[test]
fn relative_pattern_is_prefixed_with_cwd() {
    assert_eq!(
        parse_file_path_pattern("out/log.txt", "/home/alice", 7),
        "/home/alice/out/log.txt"
    );
}

#[test]
fn absolute_pattern_is_used_as_is() {
    assert_eq!(
        parse_file_path_pattern("/var/log/job.out", "/home/alice", 7),
        "/var/log/job.out"
    );
}

#[test]
fn trailing_slash_appends_default_file_name() {
    assert_eq!(
        parse_file_path_pattern("/data/logs/", "/home/alice", 42),
        "/data/logs/Crane-42.out"
    );
    assert_eq!(
        parse_file_path_pattern("logs/", "/home/alice", 42),
        "/home/alice/logs/Crane-42.out"
    );
}

#[test]
fn token_substitution() {
    assert_eq!(
        substitute_path_tokens("/out/%x-%j-%u.log", 9, "alice", "train"),
        "/out/train-9-alice.log"
    );
    assert_eq!(substitute_path_tokens("/out/%j/%j", 3, "u", "n"), "/out/3/3");
    assert_eq!(substitute_path_tokens("/plain.log", 3, "u", "n"), "/plain.log");
}

#[test]
fn substitution_is_deterministic() {
    let resolve = || {
        substitute_path_tokens(
            &parse_file_path_pattern("result-%j-%u-%x.out", "/work", 11),
            11,
            "bob",
            "simulate",
        )
    };
    let first = resolve();
    assert_eq!(first, resolve());
    assert_eq!(first, "/work/result-11-bob-simulate.out");
}

#[test]
fn time_limit_formatting() {
    assert_eq!(format_time_limit(2), "00:00:02");
    assert_eq!(format_time_limit(7200), "02:00:00");
    assert_eq!(format_time_limit(86399), "23:59:59");
}
