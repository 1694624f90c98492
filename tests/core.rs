// tests/core.rs
//
// Schema-level parsing and validation: sizes, core specs, network
// selection strings, upload path hygiene.

use sandcell::core::{
    job_hostname, parse_core_spec, parse_size, short_id, JobSpec, NetworkSelection, UploadFile,
};
use sandcell::error::EngineError;
use uuid::Uuid;

#[test]
fn size_specs_parse_with_units() {
    assert_eq!(parse_size("1048576").unwrap(), 1 << 20);
    assert_eq!(parse_size("512MB").unwrap(), 512 * 1024 * 1024);
    assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
    assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    assert_eq!(parse_size(" 4kb ").unwrap(), 4096);
    assert_eq!(parse_size("1TB").unwrap(), 1u64 << 40);
}

#[test]
fn size_specs_reject_garbage() {
    for bad in ["", "MB", "12XB", "-5M", "1.5G"] {
        assert!(
            matches!(parse_size(bad), Err(EngineError::Validation(_))),
            "'{}' should not parse",
            bad
        );
    }
    assert!(parse_size("999999999T").is_err(), "overflow detected");
}

#[test]
fn core_specs_parse_sorted_and_deduped() {
    // Only core 0 is guaranteed everywhere; list forms still exercise the
    // parser via duplicates and whitespace.
    assert_eq!(parse_core_spec("0").unwrap(), vec![0]);
    assert_eq!(parse_core_spec("0,0, 0").unwrap(), vec![0]);
    assert_eq!(parse_core_spec("0-0").unwrap(), vec![0]);
}

#[test]
fn core_specs_reject_malformed_input() {
    for bad in ["", ",", "a-b", "3-1", "0-"] {
        assert!(
            parse_core_spec(bad).is_err(),
            "'{}' should not parse",
            bad
        );
    }
    let huge = format!("{}", usize::MAX);
    assert!(parse_core_spec(&huge).is_err(), "core beyond machine rejected");
}

#[test]
fn network_selection_parses_the_three_modes() {
    assert_eq!(NetworkSelection::parse(""), NetworkSelection::None);
    assert_eq!(NetworkSelection::parse("none"), NetworkSelection::None);
    assert_eq!(NetworkSelection::parse("isolated"), NetworkSelection::Isolated);
    assert_eq!(
        NetworkSelection::parse("batch"),
        NetworkSelection::Bridged("batch".into())
    );
    for reserved in ["none", "isolated", "host", "bridge"] {
        assert!(NetworkSelection::is_reserved_name(reserved));
    }
    assert!(!NetworkSelection::is_reserved_name("batch"));
}

#[test]
fn short_ids_are_stable_hex_prefixes() {
    let id = Uuid::new_v4();
    let s = short_id(&id);
    assert_eq!(s.len(), 8);
    assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(job_hostname(&id), format!("job-{}", s));
}

#[test]
fn upload_paths_must_stay_inside_the_workspace() {
    let upload = |path: &str| UploadFile {
        path: path.into(),
        mode: 0o644,
        content: vec![],
        is_dir: false,
        size: 0,
    };

    let mut spec = JobSpec {
        command: "/bin/true".into(),
        ..Default::default()
    };

    spec.uploads = vec![upload("ok/nested.txt")];
    assert!(spec.validate().is_ok());

    for bad in ["/etc/passwd", "../escape", "a/../../b"] {
        spec.uploads = vec![upload(bad)];
        assert!(
            matches!(spec.validate(), Err(EngineError::Validation(_))),
            "'{}' must be rejected",
            bad
        );
    }
}

#[test]
fn secret_env_is_redacted_from_views() {
    let mut spec = JobSpec {
        command: "/bin/true".into(),
        ..Default::default()
    };
    spec.secret_env.insert("API_KEY".into(), "hunter2".into());

    let job = sandcell::core::Job::new(spec);
    let view = sandcell::core::JobView::from_job(&job, None);
    let serialized = serde_json::to_string(&view).unwrap();
    assert!(
        !serialized.contains("hunter2"),
        "secrets must never serialize out of a view"
    );
}
