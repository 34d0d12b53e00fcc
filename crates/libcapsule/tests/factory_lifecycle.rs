//! Lifecycle behavior that can be observed without spawning real
//! containers: state persistence, status probing, and the transition
//! rules.
use std::fs;

use anyhow::Result;
use libcapsule::config::{ContainerConfig, NamespaceType, Namespaces};
use libcapsule::container::{not_exec_flag_path, ContainerStatus, State};
use libcapsule::error::CapsuleError;
use libcapsule::factory::CapsuleFactory;
use libcapsule::process::parent::process_start_time;

fn sample_config() -> ContainerConfig {
    ContainerConfig {
        namespaces: Namespaces::new(vec![NamespaceType::Pid, NamespaceType::Mount]),
        rootfs: std::env::temp_dir(),
        hostname: Some("capsule-test".to_owned()),
        ..Default::default()
    }
}

#[test]
fn test_create_then_load_yields_stopped_with_same_config() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;

    let config = sample_config();
    factory.create("c1", config.clone())?;

    let loaded = factory.load("c1")?;
    assert_eq!(loaded.status(), ContainerStatus::Stopped);
    assert_eq!(loaded.config(), &config);
    assert_eq!(loaded.pid(), None);
    Ok(())
}

#[test]
fn test_double_create_leaves_first_state_untouched() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;

    factory.create("c3", sample_config())?;
    let state_path = root.path().join("c3").join("state.json");
    let before = fs::read(&state_path)?;

    assert!(matches!(
        factory.create("c3", ContainerConfig::default()),
        Err(CapsuleError::ContainerIdExists)
    ));
    assert_eq!(fs::read(&state_path)?, before);
    Ok(())
}

#[test]
fn test_illegal_transition_does_not_alter_state_on_disk() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;
    factory.create("c-illegal", sample_config())?;

    let state_path = root.path().join("c-illegal").join("state.json");
    let before = fs::read(&state_path)?;

    // a Stopped container cannot be started
    let mut container = factory.load("c-illegal")?;
    assert!(matches!(
        container.start(),
        Err(CapsuleError::InvalidStateTransition { .. })
    ));
    // nor paused, resumed, or exec'd into
    assert!(matches!(
        container.pause(),
        Err(CapsuleError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        container.resume(),
        Err(CapsuleError::InvalidStateTransition { .. })
    ));

    assert_eq!(fs::read(&state_path)?, before);
    Ok(())
}

#[test]
fn test_destroy_is_idempotent() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;
    let mut container = factory.create("c-destroy", sample_config())?;

    container.destroy()?;
    assert!(!root.path().join("c-destroy").exists());
    // nothing left behind: a second destroy is a successful no-op
    container.destroy()?;
    Ok(())
}

#[test]
fn test_stale_pid_probes_as_stopped() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;
    factory.create("c-stale", sample_config())?;

    // forge a state that claims a live init process with an impossible
    // start time; the probe must treat the pid as recycled
    let container_root = root.path().join("c-stale");
    let mut state = State::load(&container_root)?;
    state.status = ContainerStatus::Running;
    state.init_pid = Some(1);
    state.init_start_time = Some(u64::MAX);
    state.save(&container_root)?;

    let loaded = factory.load("c-stale")?;
    assert_eq!(loaded.status(), ContainerStatus::Stopped);
    assert_eq!(loaded.pid(), None);

    // the cleared liveness was persisted back
    let reread = State::load(&container_root)?;
    assert_eq!(reread.status, ContainerStatus::Stopped);
    assert_eq!(reread.init_pid, None);
    Ok(())
}

#[test]
fn test_live_pid_with_sentinel_probes_as_created() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;
    factory.create("c-gated", sample_config())?;

    // this test process stands in for a live init process
    let own_pid = std::process::id() as i32;
    let own_start_time = process_start_time(own_pid)?;

    let container_root = root.path().join("c-gated");
    let mut state = State::load(&container_root)?;
    state.status = ContainerStatus::Created;
    state.init_pid = Some(own_pid);
    state.init_start_time = Some(own_start_time);
    state.save(&container_root)?;
    fs::write(not_exec_flag_path(&container_root), b"")?;

    let loaded = factory.load("c-gated")?;
    assert_eq!(loaded.status(), ContainerStatus::Created);

    // without the sentinel the same live pid reads as Running
    fs::remove_file(not_exec_flag_path(&container_root))?;
    let loaded = factory.load("c-gated")?;
    assert_eq!(loaded.status(), ContainerStatus::Running);
    Ok(())
}

#[test]
fn test_destroy_refused_while_probed_running() -> Result<()> {
    let root = tempfile::tempdir()?;
    let factory = CapsuleFactory::new(root.path())?;
    factory.create("c-alive", sample_config())?;

    let own_pid = std::process::id() as i32;
    let container_root = root.path().join("c-alive");
    let mut state = State::load(&container_root)?;
    state.status = ContainerStatus::Running;
    state.init_pid = Some(own_pid);
    state.init_start_time = Some(process_start_time(own_pid)?);
    state.save(&container_root)?;

    let mut container = factory.load("c-alive")?;
    assert_eq!(container.status(), ContainerStatus::Running);
    assert!(matches!(
        container.destroy(),
        Err(CapsuleError::ContainerNotStopped)
    ));
    // the refusal left everything in place
    assert!(container_root.join("state.json").exists());
    Ok(())
}

#[test]
fn test_legal_transition_walks_match_the_diagram() {
    use ContainerStatus::*;

    // every walk the diagram allows, step by step
    let walks: &[&[ContainerStatus]] = &[
        &[Stopped, Created, Running, Stopped],
        &[Stopped, Running, Paused, Running, Stopped],
        &[Stopped, Created, Stopped, Created, Running, Stopped],
    ];
    for walk in walks {
        for pair in walk.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    let illegal: &[(ContainerStatus, ContainerStatus)] = &[
        (Stopped, Paused),
        (Created, Paused),
        (Paused, Created),
        (Running, Created),
    ];
    for (from, to) in illegal {
        assert!(!from.can_transition_to(*to), "{from} -> {to} should be illegal");
    }
}
