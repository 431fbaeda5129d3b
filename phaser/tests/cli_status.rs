//! CLI tests: spawn the phaser binary and check exit codes and output.

use std::process::{Command, Output};

use phaser::exit_codes;
use phaser::test_support::TestPlan;

fn phaser(plan: &TestPlan, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_phaser"))
        .arg("--plan")
        .arg(plan.plan_dir())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run phaser")
}

#[test]
fn status_of_missing_plan_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_phaser"))
        .arg("--plan")
        .arg(temp.path().join("missing"))
        .arg("status")
        .status()
        .expect("run phaser");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn init_then_status_json() {
    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub", "02-tests"]).expect("phases");

    let work = plan.work_dir().to_string_lossy().into_owned();
    let init = phaser(&plan, &["init", "--work", &work]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&init.stdout).contains("(2 phases)"));

    let again = phaser(&plan, &["init", "--work", &work]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));

    let status = phaser(&plan, &["status", "--json"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let report: serde_json::Value = serde_json::from_slice(&status.stdout).expect("json");
    assert_eq!(report["running"], false);
    assert_eq!(report["total"], 2);
    assert_eq!(report["completed"], 0);
    assert_eq!(report["current_phase"], serde_json::Value::Null);
}

#[test]
fn skip_unknown_phase_is_invalid() {
    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub"]).expect("phases");
    plan.init().expect("init");

    let out = phaser(&plan, &["skip-phase", "07-nope"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown phase '07-nope'"));
}

#[cfg(unix)]
#[test]
fn start_completes_with_a_conforming_agent() {
    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub"]).expect("phases");
    plan.init_with_config(
        r#"
[agent]
command = ["sh", "-c", "printf '{\"phase\":\"%s\",\"status\":\"complete\"}' \"$PHASER_PHASE\" > \"$PHASER_RESULT_PATH\""]
"#,
    )
    .expect("init");

    let out = phaser(&plan, &["start"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("all phases completed"));

    let logs = phaser(&plan, &["logs"]);
    assert!(String::from_utf8_lossy(&logs.stdout).contains("phase completed"));
    let phase_logs = phaser(&plan, &["logs", "01-stub"]);
    assert!(String::from_utf8_lossy(&phase_logs.stdout).contains("==> verification.json <=="));
}

#[cfg(unix)]
#[test]
fn failing_agent_exits_with_phase_failed() {
    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub", "02-impl"]).expect("phases");
    plan.init_with_config("max_retries = 0\n[agent]\ncommand = [\"false\"]\n")
        .expect("init");

    let out = phaser(&plan, &["start"]);
    assert_eq!(out.status.code(), Some(exit_codes::PHASE_FAILED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("'01-stub' exhausted its retry budget"));

    let state = plan.state().expect("state");
    assert!(state.completed_phases.is_empty());
    assert_eq!(state.attempts("01-stub"), 1);
    assert_eq!(state.attempts("02-impl"), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn start_refuses_while_another_controller_holds_the_plan() {
    use phaser::io::lock::ControllerLock;

    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub"]).expect("phases");
    plan.init().expect("init");
    let paths = plan.paths().expect("paths");
    let _lock = ControllerLock::acquire(&paths.lock_path, &paths.plan_dir).expect("lock");

    let out = phaser(&plan, &["start"]);
    assert_eq!(out.status.code(), Some(exit_codes::ALREADY_RUNNING));
}

#[test]
fn start_on_uninitialized_plan_leaves_no_state_behind() {
    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub"]).expect("phases");

    let out = phaser(&plan, &["start"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("phaser init"));
    assert!(!plan.plan_dir().join(".phaser").exists());
}

/// Whether `pid` is gone; zombies waiting on a reaper count as gone.
#[cfg(target_os = "linux")]
fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[test]
fn interrupting_the_controller_kills_the_in_flight_agent() {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let plan = TestPlan::new().expect("plan");
    plan.phases(&["01-stub"]).expect("phases");
    let agent_pid_path = plan.root().join("agent.pid");
    plan.init_with_config(&format!(
        "[agent]\ncommand = [\"sh\", \"-c\", \"echo $$ > {}; exec sleep 30\"]\n",
        agent_pid_path.display()
    ))
    .expect("init");

    let mut controller = Command::new(env!("CARGO_BIN_EXE_phaser"))
        .arg("--plan")
        .arg(plan.plan_dir())
        .arg("start")
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn controller");

    let deadline = Instant::now() + Duration::from_secs(10);
    let agent_pid: i32 = loop {
        if let Some(pid) = std::fs::read_to_string(&agent_pid_path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "agent never started");
        std::thread::sleep(Duration::from_millis(20));
    };
    let paths = plan.paths().expect("paths");
    while !paths.child_pgid_path.exists() {
        assert!(Instant::now() < deadline, "agent group never recorded");
        std::thread::sleep(Duration::from_millis(20));
    }

    let controller_pid = i32::try_from(controller.id()).expect("pid");
    kill(Pid::from_raw(controller_pid), Signal::SIGINT).expect("interrupt controller");
    let status = controller.wait().expect("wait controller");
    assert_eq!(status.code(), Some(130));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !process_gone(agent_pid) {
        assert!(Instant::now() < deadline, "agent {agent_pid} outlived its controller");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!paths.child_pgid_path.exists());

    let status = phaser(&plan, &["status", "--json"]);
    let report: serde_json::Value = serde_json::from_slice(&status.stdout).expect("json");
    assert_eq!(report["running"], false);
}
