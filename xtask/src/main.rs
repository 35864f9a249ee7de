use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "parley-server";

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Parley backend")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks")]
    Lint,
    #[command(about = "Execute `cargo test --workspace`")]
    Test,
    #[command(about = "Run fmt + clippy + test sequence")]
    Ci,
    #[command(about = "Compile server with metrics and verify `/metrics` endpoint")]
    CiMetricsSmoke,
    #[command(about = "Start the server, send a message over HTTP and read it back")]
    MessagingSmoke,
}

#[derive(Deserialize)]
struct IssuedToken {
    user_id: String,
    token: String,
}

fn main() {
    let cli = Cli::parse();

    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .expect("workspace root");

    let result = match cli.command {
        Task::Fmt => run_commands(&workspace_root, [("cargo", &["fmt", "--all"])]),
        Task::Lint => run_commands(
            &workspace_root,
            [
                ("cargo", &["fmt", "--all", "--", "--check"]),
                ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
            ],
        ),
        Task::Test => run_commands(&workspace_root, [("cargo", &["test", "--workspace"])]),
        Task::Ci => run_ci(&workspace_root),
        Task::CiMetricsSmoke => run_ci_metrics_smoke(&workspace_root),
        Task::MessagingSmoke => run_messaging_smoke(&workspace_root),
    };

    if !result {
        exit(1);
    }
}

fn run_ci(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [
            ("cargo", &["fmt", "--all", "--", "--check"]),
            ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
        ],
    ) {
        return false;
    }
    run_commands(workspace_root, [("cargo", &["test", "--workspace"])])
}

fn run_ci_metrics_smoke(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [(
            "cargo",
            &["build", "--features", "metrics", "-p", SERVER_PACKAGE],
        )],
    ) {
        return false;
    }

    let Some(bind_addr) = reserve_bind_addr() else {
        return false;
    };
    let Some(mut child) = spawn_server(
        workspace_root,
        &["--features", "metrics"],
        &[
            "--bind-addr",
            &bind_addr,
            "--metrics-enabled",
            "true",
            "--media-base-dir",
            &smoke_media_dir(),
        ],
    ) else {
        return false;
    };

    let result = with_client(|client| {
        let base_url = format!("http://{bind_addr}");
        if !wait_for_ready(client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
            eprintln!("server failed to report ready state within timeout");
            return false;
        }
        verify_metrics(client, &format!("{base_url}/metrics"))
    });

    stop_server(&mut child);
    result
}

fn run_messaging_smoke(workspace_root: &Path) -> bool {
    let Some(signing_key) = generate_signing_key(workspace_root) else {
        return false;
    };
    let (Some(sender), Some(receiver)) = (
        issue_token(workspace_root, &signing_key),
        issue_token(workspace_root, &signing_key),
    ) else {
        return false;
    };

    let Some(bind_addr) = reserve_bind_addr() else {
        return false;
    };
    let Some(mut child) = spawn_server(
        workspace_root,
        &[],
        &[
            "--bind-addr",
            &bind_addr,
            "--identity-signing-key",
            &signing_key,
            "--media-base-dir",
            &smoke_media_dir(),
        ],
    ) else {
        return false;
    };

    let result = with_client(|client| {
        let base_url = format!("http://{bind_addr}");
        if !wait_for_ready(client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
            eprintln!("server failed to report ready state within timeout");
            return false;
        }
        exchange_message(client, &base_url, &sender, &receiver)
    });

    stop_server(&mut child);
    result
}

fn exchange_message(client: &Client, base_url: &str, sender: &IssuedToken, receiver: &IssuedToken) -> bool {
    let send_url = format!("{base_url}/client/v1/messages/send/{}", receiver.user_id);
    match client
        .post(&send_url)
        .bearer_auth(&sender.token)
        .json(&json!({ "text": "smoke test" }))
        .send()
    {
        Ok(response) if response.status() == StatusCode::CREATED => {}
        Ok(response) => {
            eprintln!("send returned unexpected status {}", response.status());
            return false;
        }
        Err(err) => {
            eprintln!("failed to call send endpoint: {err}");
            return false;
        }
    }

    let history_url = format!("{base_url}/client/v1/messages/{}", sender.user_id);
    let page: Value = match client
        .get(&history_url)
        .bearer_auth(&receiver.token)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.json())
    {
        Ok(page) => page,
        Err(err) => {
            eprintln!("failed to read history: {err}");
            return false;
        }
    };

    let delivered = page["messages"]
        .as_array()
        .and_then(|messages| messages.first())
        .map(|message| message["text"] == "smoke test" && message["seen"] == true)
        .unwrap_or(false);
    if !delivered {
        eprintln!("history did not contain the sent message: {page}");
    }
    delivered
}

fn generate_signing_key(workspace_root: &Path) -> Option<String> {
    let stdout = server_command_output(workspace_root, &["generate-signing-key"])?;
    let key = stdout
        .lines()
        .find_map(|line| line.strip_prefix("signing_key = "))
        .map(str::to_string);
    if key.is_none() {
        eprintln!("generate-signing-key printed no signing key");
    }
    key
}

fn issue_token(workspace_root: &Path, signing_key: &str) -> Option<IssuedToken> {
    let stdout = server_command_output(
        workspace_root,
        &["--identity-signing-key", signing_key, "issue-token"],
    )?;
    match serde_json::from_str(&stdout) {
        Ok(token) => Some(token),
        Err(err) => {
            eprintln!("issue-token printed unexpected output: {err}");
            None
        }
    }
}

fn server_command_output(workspace_root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("cargo")
        .args(["run", "--quiet", "-p", SERVER_PACKAGE, "--"])
        .args(args)
        .current_dir(workspace_root)
        .stderr(Stdio::inherit())
        .output();
    match output {
        Ok(output) if output.status.success() => String::from_utf8(output.stdout).ok(),
        Ok(output) => {
            eprintln!("{SERVER_PACKAGE} {} failed with {}", args.join(" "), output.status);
            None
        }
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            None
        }
    }
}

fn spawn_server(workspace_root: &Path, cargo_args: &[&str], server_args: &[&str]) -> Option<Child> {
    let spawned = Command::new("cargo")
        .args(["run", "--quiet"])
        .args(cargo_args)
        .args(["-p", SERVER_PACKAGE, "--"])
        .args(server_args)
        .env("RUST_LOG", "warn")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn();
    match spawned {
        Ok(child) => Some(child),
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            None
        }
    }
}

fn stop_server(child: &mut Child) {
    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();
}

fn with_client(check: impl FnOnce(&Client) -> bool) -> bool {
    match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => check(&client),
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    }
}

fn smoke_media_dir() -> String {
    std::env::temp_dir()
        .join("parley-smoke-media")
        .display()
        .to_string()
}

fn reserve_bind_addr() -> Option<String> {
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok();
    if port.is_none() {
        eprintln!("failed to reserve a free TCP port");
    }
    port.map(|port| format!("127.0.0.1:{port}"))
}

fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return true,
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    false
}

fn verify_metrics(client: &Client, url: &str) -> bool {
    match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => match response.text() {
            Ok(body) => {
                if body.contains("parley_http_requests_total") && body.contains("parley_online_users") {
                    true
                } else {
                    eprintln!("metrics endpoint responded without expected families");
                    false
                }
            }
            Err(err) => {
                eprintln!("failed to read metrics body: {err}");
                false
            }
        },
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            false
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            false
        }
    }
}

fn run_commands<const N: usize>(
    workspace_root: &Path,
    commands: [(&str, &[&str]); N],
) -> bool {
    for (program, args) in commands {
        let status = Command::new(program)
            .args(args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command '{program} {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn '{program}': {err}");
                return false;
            }
        }
    }
    true
}
