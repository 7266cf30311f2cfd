use std::path::Path;

use gantry_core::{AppBuilder, Config, Console, Response, RunState};
use gantry_tools::{PolicyMode, ProviderConfig};
use tempfile::TempDir;

fn config_for(root: &Path) -> Config {
    let mut config = Config::default();
    config.workspace.root = root.to_path_buf();
    config.workspace.id = "it".into();
    config
}

async fn console_for(config: Config) -> (AppBuilder, Console<gantry_core::BuiltinTools>) {
    let app = AppBuilder::from_config(config);
    let engine = app.build_engine().await.unwrap();
    let console = Console::new(engine, app.reports_dir());
    (app, console)
}

fn write_plan(root: &TempDir, json: &str) -> String {
    let path = root.path().join("plan.json");
    std::fs::write(&path, json).unwrap();
    path.display().to_string()
}

async fn finish<E: gantry_tools::ToolExecutor>(console: &Console<E>, response: Response) -> String {
    let job = response.job.expect("command should schedule execution");
    job.run(console.engine()).await
}

const WRITE_PLAN: &str = r#"{"steps": [
    {"intent": "look around", "tool_id": "fs_list_dir", "arguments": {"path": "."}},
    {"intent": "leave a note", "tool_id": "builtin:fs_write_text",
     "arguments": {"path": "notes/out.txt", "content": "hello"}}
]}"#;

#[tokio::test]
async fn approve_resume_complete_and_report() {
    let root = tempfile::tempdir().unwrap();
    let (app, mut console) = console_for(config_for(root.path())).await;
    let plan = write_plan(&root, WRITE_PLAN);

    let started = console.handle(&format!("run start write a note --plan {plan}")).await;
    let summary = finish(&console, started).await;
    assert!(summary.contains("[PAUSED]"), "{summary}");
    assert!(summary.contains("awaits approval"), "{summary}");

    let run_id = console.current_run().unwrap().to_owned();
    let pending = console.engine().pending_approvals(&run_id).await.unwrap();
    let approval = pending[0].id.clone();
    console.handle(&format!("approve {approval} session")).await;
    let resumed = console.handle("run resume").await;
    let summary = finish(&console, resumed).await;
    assert!(summary.contains("[COMPLETED]"), "{summary}");
    assert_eq!(
        std::fs::read_to_string(root.path().join("notes/out.txt")).unwrap(),
        "hello"
    );

    let artifacts = console.handle("artifact list").await;
    assert!(artifacts.text.contains("out.txt"), "{}", artifacts.text);

    let audit = std::fs::read_to_string(root.path().join(".gantry/audit.jsonl")).unwrap();
    let kinds: Vec<String> = audit
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(record["run_id"], run_id.as_str());
            record["result"]["type"].as_str().unwrap().to_owned()
        })
        .collect();
    assert_eq!(kinds, ["success", "approval_required", "success"]);

    let report = console.handle("run report").await;
    assert!(report.text.contains("report written"), "{}", report.text);
    let json = std::fs::read_to_string(app.reports_dir().join(format!("{run_id}.json"))).unwrap();
    let json: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(json["counts"]["done"], 2);
    assert!(
        app.reports_dir()
            .join(format!("{run_id}.md"))
            .exists()
    );
}

#[tokio::test]
async fn restart_surfaces_incomplete_run_without_grants() {
    let root = tempfile::tempdir().unwrap();
    let plan = write_plan(&root, WRITE_PLAN);
    let run_id = {
        let (_app, mut console) = console_for(config_for(root.path())).await;
        let started = console.handle(&format!("run start survive --plan {plan}")).await;
        finish(&console, started).await;
        console.current_run().unwrap().to_owned()
    };

    let (_app, mut console) = console_for(config_for(root.path())).await;
    let status = console.handle("run status").await;
    assert!(status.text.contains(&run_id), "{}", status.text);

    let attached = console.handle(&format!("run attach {run_id}")).await;
    assert!(attached.text.contains("[PAUSED]"), "{}", attached.text);
    let run = console.engine().snapshot(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Paused);
    assert!(run.approvals.session_grants().is_empty());
    assert_eq!(run.plan[1].status, gantry_core::StepStatus::Pending);

    // Nothing executes until the operator acts; resuming re-enters the gate.
    let resumed = console.handle("run resume").await;
    let summary = finish(&console, resumed).await;
    assert!(summary.contains("awaits approval"), "{summary}");
    assert!(!root.path().join("notes/out.txt").exists());
}

#[tokio::test]
async fn strict_mode_refuses_tools_without_risk_metadata() {
    let root = tempfile::tempdir().unwrap();
    let manifest = root.path().join("ext.json");
    std::fs::write(&manifest, r#"[{"name": "mystery", "description": "no risk declared"}]"#)
        .unwrap();
    let mut config = config_for(root.path());
    config.policy.mode = PolicyMode::Strict;
    config.providers.push(ProviderConfig {
        id: "ext".into(),
        manifest,
        ..ProviderConfig::default()
    });
    let (_app, mut console) = console_for(config).await;

    let explained = console.handle("policy explain ext:mystery {}").await;
    assert!(explained.text.contains("=> deny"), "{}", explained.text);

    let plan = write_plan(
        &root,
        r#"[
            {"intent": "look around", "tool_id": "fs_list_dir", "arguments": {"path": "."}},
            {"intent": "poke it", "tool_id": "ext:mystery", "arguments": {}}
        ]"#,
    );
    let started = console.handle(&format!("run start strict --plan {plan}")).await;
    let summary = finish(&console, started).await;
    assert!(summary.contains("[PAUSED]"), "{summary}");
    assert!(summary.contains("denied"), "{summary}");

    let skipped = console.handle("run skip 2").await;
    assert!(skipped.text.contains("[COMPLETED]"), "{}", skipped.text);
}

#[tokio::test]
async fn unknown_tool_in_plan_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let (_app, mut console) = console_for(config_for(root.path())).await;
    let plan = write_plan(
        &root,
        r#"[{"intent": "launch", "tool_id": "rocket_launch", "arguments": {}}]"#,
    );
    let response = console.handle(&format!("run start launch --plan {plan}")).await;
    assert!(response.text.contains("invalid plan"), "{}", response.text);
    assert!(response.job.is_none());

    let run_id = console.current_run().unwrap().to_owned();
    let run = console.engine().snapshot(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Planning);
    assert!(run.plan.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn manifest_tool_runs_through_its_command_transport() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("ext.json"),
        r#"[{"name": "lookup", "risk": "read"}]"#,
    )
    .unwrap();
    std::fs::write(
        root.path().join("ext.sh"),
        "#!/bin/sh\n[ \"$2\" = lookup ] && echo '{\"success\": true, \"content\": \"found it\"}'\n",
    )
    .unwrap();
    let mut config = config_for(root.path());
    config.providers.push(ProviderConfig {
        id: "ext".into(),
        manifest: "ext.json".into(),
        command: vec!["sh".into(), "ext.sh".into()],
        ..ProviderConfig::default()
    });
    let (_app, mut console) = console_for(config).await;

    let plan = write_plan(
        &root,
        r#"[{"intent": "ask the provider", "tool_id": "ext:lookup", "arguments": {"q": "x"}}]"#,
    );
    let started = console.handle(&format!("run start lookup --plan {plan}")).await;
    let summary = finish(&console, started).await;
    assert!(summary.contains("[COMPLETED]"), "{summary}");

    let run_id = console.current_run().unwrap().to_owned();
    let run = console.engine().snapshot(&run_id).await.unwrap();
    assert_eq!(run.plan[0].output.as_deref(), Some("found it"));
}
