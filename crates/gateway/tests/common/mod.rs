#![allow(dead_code)]

use anyhow::Context as _;
use std::io::BufRead as _;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Kills the gateway process when the test is done (or panics).
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub struct SpawnedGateway {
    pub child: KillOnDrop,
    pub base: String,
}

static CONFIG_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Write a throwaway YAML config for one gateway instance.
pub fn write_config(yaml: &str) -> anyhow::Result<PathBuf> {
    let n = CONFIG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "canopy-gateway-test-{}-{n}.yaml",
        std::process::id()
    ));
    std::fs::write(&path, yaml).with_context(|| format!("write config {}", path.display()))?;
    Ok(path)
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // Logs are JSON when not attached to a TTY; the address ends before the
    // next quote or brace.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

pub fn wait_for_gateway_port(
    mut child: Child,
    timeout: Duration,
) -> anyhow::Result<SpawnedGateway> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let start = Instant::now();
    let mut last_lines: Vec<String> = Vec::new();

    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!("gateway process exited early: {status}");
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line.clone());

                if let Some(addr) = parse_listen_addr(&line, "Starting HTTP server on ") {
                    return Ok(SpawnedGateway {
                        child: KillOnDrop(child),
                        base: format!("http://{addr}"),
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = child.kill();
    anyhow::bail!(
        "timed out waiting for gateway port; last output:\n{}",
        last_lines.join("\n")
    );
}

/// Spawn the gateway binary in config-file mode on an ephemeral port.
pub fn spawn_gateway(config_path: &std::path::Path) -> anyhow::Result<SpawnedGateway> {
    let bin = env!("CARGO_BIN_EXE_canopy-mcp-gateway");
    let child = Command::new(bin)
        .arg("--bind")
        .arg("127.0.0.1:0")
        .arg("--config")
        .arg(config_path)
        .arg("--log-level")
        .arg("info")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn gateway")?;
    wait_for_gateway_port(child, Duration::from_secs(10))
}

/// Spawn the gateway with no config file and no database: it comes up
/// uninitialized and rejects protected routes with 403.
pub fn spawn_gateway_unconfigured() -> anyhow::Result<SpawnedGateway> {
    let bin = env!("CARGO_BIN_EXE_canopy-mcp-gateway");
    let child = Command::new(bin)
        .arg("--bind")
        .arg("127.0.0.1:0")
        .arg("--log-level")
        .arg("info")
        .env_remove("CANOPY_GATEWAY_CONFIG")
        .env_remove("CANOPY_GATEWAY_DATABASE_URL")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn gateway (unconfigured)")?;
    wait_for_gateway_port(child, Duration::from_secs(10))
}

/// Poll until `check` passes or the timeout elapses. Audit writes are
/// asynchronous, so assertions about them need a little patience.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
