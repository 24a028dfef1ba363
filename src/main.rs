use anyhow::Context;
use std::env;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use subflow_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
    scheduler::{WorkflowDefinition, spawn_resume_daemon},
};

/// CLI exit codes: 0 success, 1 user error, 2 system error, 3 workflow failed.
const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_SYSTEM_ERROR: i32 = 2;
const EXIT_WORKFLOW_FAILED: i32 = 3;

fn control_plane_url() -> String {
    env::var("SUBFLOW_CONTROL_URL").unwrap_or_else(|_| "http://127.0.0.1:9105".to_string())
}

fn blocking_client() -> Result<reqwest::blocking::Client, i32> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| {
            eprintln!("failed to create http client: {e}");
            EXIT_SYSTEM_ERROR
        })
}

/// Perform a health check against the local HTTP server.
fn run_healthcheck() -> i32 {
    let url = format!("{}/health/live", control_plane_url());
    let client = match blocking_client() {
        Ok(c) => c,
        Err(code) => return code,
    };

    match client.get(&url).send() {
        Ok(resp) if resp.status().is_success() => EXIT_OK,
        Ok(resp) => {
            eprintln!("healthcheck failed: status {}", resp.status());
            EXIT_SYSTEM_ERROR
        }
        Err(e) => {
            eprintln!("healthcheck failed: {e}");
            EXIT_SYSTEM_ERROR
        }
    }
}

/// Submit a YAML workflow definition; with `--wait`, follow it to a terminal
/// state.
fn run_submit(args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        eprintln!("usage: subflow-worker submit <workflow.yaml> [--wait]");
        return EXIT_USER_ERROR;
    };
    let wait = args.iter().any(|a| a == "--wait");

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("failed to read {path}: {e}");
            return EXIT_USER_ERROR;
        }
    };
    let definition = match WorkflowDefinition::from_yaml(&raw) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("invalid workflow definition: {e}");
            return EXIT_USER_ERROR;
        }
    };

    let client = match blocking_client() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let response = match client
        .post(format!("{}/v1/workflows", control_plane_url()))
        .json(&definition)
        .send()
    {
        Ok(response) => response,
        Err(e) => {
            eprintln!("failed to reach the orchestrator: {e}");
            return EXIT_SYSTEM_ERROR;
        }
    };

    if response.status().is_client_error() {
        eprintln!("submission rejected: {}", body_text(response));
        return EXIT_USER_ERROR;
    }
    if !response.status().is_success() {
        eprintln!("submission failed: {}", body_text(response));
        return EXIT_SYSTEM_ERROR;
    }

    let body: serde_json::Value = match response.json() {
        Ok(body) => body,
        Err(e) => {
            eprintln!("unreadable submission response: {e}");
            return EXIT_SYSTEM_ERROR;
        }
    };
    let workflow_id = body["workflow_id"].as_str().unwrap_or_default().to_string();
    println!("{workflow_id}");

    if wait {
        follow_workflow(&client, &workflow_id)
    } else {
        EXIT_OK
    }
}

fn follow_workflow(client: &reqwest::blocking::Client, workflow_id: &str) -> i32 {
    loop {
        std::thread::sleep(Duration::from_secs(2));
        let response = match client
            .get(format!("{}/v1/workflows/{workflow_id}", control_plane_url()))
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                eprintln!("failed to poll workflow {workflow_id}: {e}");
                return EXIT_SYSTEM_ERROR;
            }
        };
        let body: serde_json::Value = match response.json() {
            Ok(body) => body,
            Err(e) => {
                eprintln!("unreadable status response: {e}");
                return EXIT_SYSTEM_ERROR;
            }
        };
        match body["status"].as_str() {
            Some("SUCCESS") => return EXIT_OK,
            Some("FAILED") | Some("CANCELLED") => {
                eprintln!("workflow {workflow_id} ended as {}", body["status"]);
                return EXIT_WORKFLOW_FAILED;
            }
            _ => {}
        }
    }
}

fn run_status(args: &[String]) -> i32 {
    let Some(workflow_id) = args.first() else {
        eprintln!("usage: subflow-worker status <workflow_id>");
        return EXIT_USER_ERROR;
    };
    let client = match blocking_client() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let response = match client
        .get(format!("{}/v1/workflows/{workflow_id}", control_plane_url()))
        .send()
    {
        Ok(response) => response,
        Err(e) => {
            eprintln!("failed to reach the orchestrator: {e}");
            return EXIT_SYSTEM_ERROR;
        }
    };
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        eprintln!("workflow {workflow_id} not found");
        return EXIT_USER_ERROR;
    }
    if !response.status().is_success() {
        eprintln!("status query failed: {}", body_text(response));
        return EXIT_SYSTEM_ERROR;
    }

    let body: serde_json::Value = match response.json() {
        Ok(body) => body,
        Err(e) => {
            eprintln!("unreadable status response: {e}");
            return EXIT_SYSTEM_ERROR;
        }
    };
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    match body["status"].as_str() {
        Some("FAILED") | Some("CANCELLED") => EXIT_WORKFLOW_FAILED,
        _ => EXIT_OK,
    }
}

fn run_cancel(args: &[String]) -> i32 {
    let Some(workflow_id) = args.first() else {
        eprintln!("usage: subflow-worker cancel <workflow_id>");
        return EXIT_USER_ERROR;
    };
    let client = match blocking_client() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let response = match client
        .post(format!(
            "{}/v1/workflows/{workflow_id}/cancel",
            control_plane_url()
        ))
        .send()
    {
        Ok(response) => response,
        Err(e) => {
            eprintln!("failed to reach the orchestrator: {e}");
            return EXIT_SYSTEM_ERROR;
        }
    };
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        eprintln!("workflow {workflow_id} not found");
        return EXIT_USER_ERROR;
    }
    if !response.status().is_success() {
        eprintln!("cancel failed: {}", body_text(response));
        return EXIT_SYSTEM_ERROR;
    }
    EXIT_OK
}

fn body_text(response: reqwest::blocking::Response) -> String {
    let status = response.status();
    response
        .text()
        .unwrap_or_else(|_| format!("status {status}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Control-plane subcommands run against an already-serving worker.
    let args: Vec<String> = env::args().collect();
    if args.len() > 1 {
        let code = match args[1].as_str() {
            "healthcheck" => run_healthcheck(),
            "submit" => run_submit(&args[2..]),
            "status" => run_status(&args[2..]),
            "cancel" => run_cancel(&args[2..]),
            other => {
                eprintln!("unknown subcommand: {other}");
                EXIT_USER_ERROR
            }
        };
        std::process::exit(code);
    }

    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(|s| s.as_str())
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    // Tracing initialization is handled by Telemetry::new()
    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.http_bind();
    let registry = match ComponentRegistry::build(config.clone()).await {
        Ok(registry) => registry,
        Err(build_error) => {
            eprintln!("failed to start worker: {build_error:#}");
            std::process::exit(EXIT_SYSTEM_ERROR);
        }
    };

    let _resume_daemon =
        spawn_resume_daemon(registry.scheduler(), config.resume_rescan_interval());
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    info!(%bind_addr, "listening");

    if let Err(serve_error) = axum::serve(listener, router).await {
        warn!(error = %serve_error, "server exited with error");
    }

    Ok(())
}
