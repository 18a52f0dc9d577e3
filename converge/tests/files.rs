//! Config, inventory and deploy files driving a scripted run.

use std::fs;
use std::sync::Arc;

use converge::core::registry::Registry;
use converge::core::types::{RunReport, Status};
use converge::io::config::load_config;
use converge::io::deploy::load_deploy;
use converge::io::inventory::load_inventory;
use converge::io::report::write_report;
use converge::pipeline::Pipeline;
use converge::test_support::{Response, ScriptedConnector};

const INVENTORY: &str = r#"
[hosts.web1]
data = { port = 8080 }

[hosts.web2]
address = "10.0.0.2"

[groups.web]
hosts = ["web1", "web2"]
data = { port = 80, env = "prod" }

[groups.db]
hosts = ["db1"]
"#;

const DEPLOY: &str = r#"
[[operations]]
name = "app dir"
action = "directory_present"
path = "/srv/app"
mode = "0755"
escalate = true

[[operations]]
name = "listen port"
action = "line_present"
path = "/srv/app/app.conf"
lines = ["port={{ host.data.port }}", "env={{ host.data.env }}"]
"#;

const CONFIG: &str = r#"
parallelism = 2
fail_threshold = 0.5
"#;

#[tokio::test]
async fn files_drive_a_limited_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let write = |name: &str, contents: &str| {
        let path = temp.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    };
    let config = load_config(&write("converge.toml", CONFIG)).expect("config");
    let inventory = load_inventory(&write("inventory.toml", INVENTORY)).expect("inventory");
    let deploy = load_deploy(&write("deploy.toml", DEPLOY)).expect("deploy");
    assert_eq!(config.parallelism, 2);

    let targets = inventory.select(&["web".to_string()]).expect("limit");
    assert_eq!(targets.len(), 2);

    let connector = Arc::new(ScriptedConnector::new());
    connector.respond_all(
        "ls -ld",
        Response::ok().stdout("drwxr-xr-x 2 root root 4096 Jan 1 00:00 /srv/app"),
    );
    connector.respond("web1", "if [ -f", Response::file_lines("port=8080"));
    connector.respond("web2", "if [ -f", Response::ok());

    let pipeline = Pipeline::new(
        config,
        Arc::new(Registry::builtin()),
        connector.clone(),
        targets,
        None,
    );
    let report = pipeline.run(&deploy.operations).await;

    assert_eq!(report.hosts, vec!["web1", "web2"]);
    assert_eq!(report.count(0, Status::NoChange), 2);
    assert_eq!(
        report.result("web1", 1).map(|r| r.commands.clone()),
        Some(vec![
            "[ -z \"$(tail -c 1 /srv/app/app.conf)\" ] || printf '\\n' >> /srv/app/app.conf".to_string(),
            "printf '%s\\n' env=prod >> /srv/app/app.conf".to_string(),
        ])
    );
    assert_eq!(
        report.result("web2", 1).map(|r| r.commands.clone()),
        Some(vec![
            "printf '%s\\n' port=80 >> /srv/app/app.conf".to_string(),
            "printf '%s\\n' env=prod >> /srv/app/app.conf".to_string(),
        ])
    );
    assert_eq!(connector.connects("db1"), 0);
    assert!(report.success);

    let report_path = temp.path().join("report.json");
    write_report(&report_path, &report).expect("write report");
    let loaded: RunReport =
        serde_json::from_str(&fs::read_to_string(&report_path).expect("read")).expect("decode");
    assert_eq!(loaded, report);
}

#[tokio::test]
async fn escalated_operations_wrap_commands_with_sudo() {
    let connector = Arc::new(ScriptedConnector::new());
    let deploy = converge::io::deploy::parse_deploy(DEPLOY).expect("deploy");
    let pipeline = Pipeline::new(
        load_config(std::path::Path::new("/nonexistent/converge.toml")).expect("defaults"),
        Arc::new(Registry::builtin()),
        connector.clone(),
        converge::test_support::hosts(&["web1"]),
        None,
    );
    // `ls -ld` prints nothing for a missing path.
    let report = pipeline.run(&deploy.operations[..1]).await;

    assert_eq!(report.result("web1", 0).map(|r| r.status), Some(Status::Changed));
    let commands = connector.commands("web1");
    assert_eq!(
        &commands[1..],
        [
            "sudo -H -n sh -c 'mkdir -p /srv/app'",
            "sudo -H -n sh -c 'chmod 0755 /srv/app'",
        ]
    );
}
