//! End-to-end pipeline behavior against a scripted fleet.

use std::sync::Arc;
use std::time::Duration;

use converge::core::operations::{Action, Operation};
use converge::core::registry::Registry;
use converge::core::types::{RunReport, Status};
use converge::events::{self, RunEvent};
use converge::exit_codes;
use converge::io::config::EngineConfig;
use converge::pipeline::Pipeline;
use converge::test_support::{Response, ScriptedConnector, hosts, line_present, numbered, shell};

const APP_CONF: &str = "/etc/app.conf";
const FILE_FACT: &str = "if [ -f /etc/app.conf ]";
const USERS_FACT: &str = "id $i";

fn config(threshold: f64) -> EngineConfig {
    EngineConfig {
        fail_threshold: threshold,
        parallelism: 4,
        ..EngineConfig::default()
    }
}

async fn run(
    connector: &Arc<ScriptedConnector>,
    names: &[&str],
    threshold: f64,
    operations: &[Operation],
) -> RunReport {
    Pipeline::new(
        config(threshold),
        Arc::new(Registry::builtin()),
        connector.clone(),
        hosts(names),
        None,
    )
    .run(operations)
    .await
}

fn status(report: &RunReport, host: &str, op: usize) -> Status {
    report
        .result(host, op)
        .map(|r| r.status)
        .unwrap_or_else(|| panic!("no result for {host} op {op}"))
}

fn user_present(name: &str, user: &str) -> Operation {
    Operation::new(
        name,
        Action::UserPresent {
            user: user.to_string(),
            home: Some(format!("/home/{user}")),
            shell: Some("/bin/bash".to_string()),
            group: None,
            groups: Vec::new(),
        },
    )
}

const DEPLOY_USER: &str = "uid=1000(deploy) gid=1000(deploy) groups=1000(deploy)/home/deploy:/bin/bash";

#[tokio::test]
async fn line_already_present_on_two_of_three_hosts() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond("a", FILE_FACT, Response::file_lines("foo=bar"));
    connector.respond("b", FILE_FACT, Response::file_lines("x=1\nfoo=bar"));
    connector.respond("c", FILE_FACT, Response::file_lines("x=1"));

    let op = line_present("ensure foo", APP_CONF, &["foo=bar"]);
    let report = run(&connector, &["a", "b", "c"], 0.0, &[op]).await;

    assert_eq!(status(&report, "a", 0), Status::NoChange);
    assert_eq!(status(&report, "b", 0), Status::NoChange);
    assert_eq!(status(&report, "c", 0), Status::Changed);
    assert_eq!(
        report.result("c", 0).map(|r| r.commands.clone()),
        Some(vec![
            "[ -z \"$(tail -c 1 /etc/app.conf)\" ] || printf '\\n' >> /etc/app.conf".to_string(),
            "printf '%s\\n' foo=bar >> /etc/app.conf".to_string(),
        ])
    );
    assert_eq!(connector.count("a", "foo=bar >>"), 0);
    assert_eq!(connector.count("b", "foo=bar >>"), 0);
    assert_eq!(connector.count("c", "foo=bar >>"), 1);
    assert!(report.success);
    assert_eq!(report.exit_code, exit_codes::OK);
}

#[tokio::test]
async fn unparsable_fact_excludes_only_that_host() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond_all(USERS_FACT, Response::ok().stdout(DEPLOY_USER));
    connector.respond(
        "b",
        USERS_FACT,
        Response::ok().stdout("uid=1000(deploy) gid=1000(deploy) groups=1000(deploy),garbage"),
    );

    let operations = [
        user_present("deploy user", "deploy"),
        shell("after", &["systemctl restart app"]),
    ];
    let report = run(&connector, &["a", "b", "c"], 0.5, &operations).await;

    assert_eq!(status(&report, "a", 0), Status::NoChange);
    assert_eq!(status(&report, "b", 0), Status::Failed);
    assert_eq!(status(&report, "c", 0), Status::NoChange);
    let error = report
        .result("b", 0)
        .and_then(|r| r.error.clone())
        .expect("b error");
    assert!(error.message.contains("malformed group entry"));

    assert_eq!(status(&report, "b", 1), Status::Skipped);
    assert_eq!(status(&report, "a", 1), Status::Success);
    assert_eq!(status(&report, "c", 1), Status::Success);
    assert_eq!(connector.count("b", "systemctl"), 0);
    assert!(report.success);
}

#[tokio::test]
async fn threshold_breach_stops_every_later_operation() {
    let connector = Arc::new(ScriptedConnector::new());
    let names = numbered("web", 10);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    for failing in &names[..4] {
        connector.respond(failing, "migrate", Response::exit(1).stderr("lock held"));
    }

    let operations = [shell("migrate", &["migrate"]), shell("restart", &["restart"])];
    let report = run(&connector, &names, 0.3, &operations).await;

    assert_eq!(report.aborted_at, Some(0));
    assert_eq!(report.count(0, Status::Failed), 4);
    assert_eq!(report.count(0, Status::Success), 6);
    assert_eq!(report.count(1, Status::Skipped), 10);
    for host in &names {
        assert_eq!(connector.count(host, "restart"), 0);
    }
    assert!(!report.success);
    assert_eq!(report.exit_code, exit_codes::THRESHOLD_EXCEEDED);
}

#[tokio::test]
async fn ratio_equal_to_threshold_does_not_abort() {
    let connector = Arc::new(ScriptedConnector::new());
    let names = numbered("h", 10);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    for failing in &names[..3] {
        connector.respond(failing, "step", Response::exit(1));
    }
    let report = run(
        &connector,
        &names,
        0.3,
        &[shell("step", &["step"]), shell("next", &["next"])],
    )
    .await;
    assert_eq!(report.aborted_at, None);
    assert_eq!(report.count(1, Status::Success), 7);
    assert_eq!(report.count(1, Status::Skipped), 3);
}

#[tokio::test]
async fn second_run_emits_no_commands() {
    let connector = Arc::new(ScriptedConnector::new());
    for host in ["a", "b"] {
        connector.respond(host, FILE_FACT, Response::file_lines("x=1"));
        connector.on_success(
            host,
            "foo=bar >>",
            FILE_FACT,
            Response::file_lines("x=1\nfoo=bar"),
        );
    }
    let op = line_present("ensure foo", APP_CONF, &["foo=bar"]);

    let first = run(&connector, &["a", "b"], 0.0, std::slice::from_ref(&op)).await;
    assert_eq!(first.count(0, Status::Changed), 2);

    let before = connector.calls().len();
    let second = run(&connector, &["a", "b"], 0.0, &[op]).await;
    assert_eq!(second.count(0, Status::NoChange), 2);
    let new_calls = &connector.calls()[before..];
    assert!(new_calls.iter().all(|c| c.command.starts_with("if [ -f")));
}

#[tokio::test]
async fn commands_keep_their_order_on_every_host() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond("a", "step-1", Response::ok().delay(Duration::from_millis(30)));
    connector.respond("b", "step-2", Response::ok().delay(Duration::from_millis(30)));
    connector.respond("c", "step-3", Response::ok().delay(Duration::from_millis(10)));

    let op = shell("steps", &["step-1", "step-2", "step-3"]);
    let report = run(&connector, &["a", "b", "c"], 0.0, &[op]).await;
    assert_eq!(report.count(0, Status::Success), 3);

    for host in ["a", "b", "c"] {
        assert_eq!(connector.commands(host), vec!["step-1", "step-2", "step-3"]);
    }
}

#[tokio::test]
async fn later_operations_follow_declared_order_per_host() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond("a", "first", Response::ok().delay(Duration::from_millis(40)));

    let operations = [shell("one", &["first"]), shell("two", &["second"])];
    run(&connector, &["a", "b"], 0.0, &operations).await;

    let calls = connector.calls();
    let last_first = calls
        .iter()
        .filter(|c| c.command == "first")
        .map(|c| c.seq)
        .max()
        .expect("first ran");
    let earliest_second = calls
        .iter()
        .filter(|c| c.command == "second")
        .map(|c| c.seq)
        .min()
        .expect("second ran");
    assert!(last_first < earliest_second);
}

#[tokio::test]
async fn timeouts_fail_the_host_without_touching_siblings() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond("slow", "sync", Response::ok().delay(Duration::from_secs(3)));
    let mut op = shell("sync", &["sync", "after-sync"]);
    op.options.timeout_secs = Some(1);

    let report = run(&connector, &["fast", "slow"], 0.5, &[op]).await;
    assert_eq!(status(&report, "fast", 0), Status::Success);
    assert_eq!(status(&report, "slow", 0), Status::Timeout);
    assert_eq!(connector.commands("slow"), vec!["sync"]);
    assert_eq!(connector.commands("fast"), vec!["sync", "after-sync"]);
}

#[tokio::test]
async fn tolerant_operations_plan_against_degraded_facts() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond_all(
        USERS_FACT,
        Response::ok().stdout("uid=7(x) gid=7(x) groups=7(x),broken"),
    );
    let mut op = user_present("deploy user", "deploy");
    op.options.tolerant = true;

    let report = run(&connector, &["a"], 0.0, &[op]).await;
    let result = report.result("a", 0).expect("result");
    assert_eq!(result.status, Status::Changed);
    assert_eq!(result.degraded_facts, vec!["users"]);
    assert_eq!(
        result.commands,
        vec!["useradd -d /home/deploy -s /bin/bash deploy"]
    );
}

#[tokio::test]
async fn events_describe_the_run() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.respond("a", "hello", Response::ok().stdout("hi there"));
    let (tx, mut rx) = events::channel();
    let pipeline = Pipeline::new(
        config(0.0),
        Arc::new(Registry::builtin()),
        connector.clone(),
        hosts(&["a"]),
        Some(tx),
    );
    pipeline.run(&[shell("greet", &["hello"])]).await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(RunEvent::OperationStarted { index: 0, .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::Output { line, .. } if line == "hi there"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::HostFinished { status: Status::Success, .. }
    )));
    assert!(matches!(
        seen.last(),
        Some(RunEvent::RunFinished { success: true, exit_code: 0 })
    ));
}
