use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{chown, Gid, Uid};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::privileged_api::{HelperCommand, HelperReply, ReadyFrame};
use crate::tunnel_name::{is_valid_name, TunnelName};
use crate::wireguard::{wg_quick, wg_show, ToolPaths};

const CONFIG_SUFFIX: &str = ".conf";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub config_dir: PathBuf,
    pub tools: ToolPaths,
}

/// Command logic of the privileged helper. Runs elevated when spawned by the
/// broker, or in-process when the caller already is root.
#[derive(Debug, Clone)]
pub struct Helper {
    options: HelperOptions,
}

impl Helper {
    #[must_use]
    pub fn new(options: HelperOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.options.config_dir
    }

    #[must_use]
    pub fn config_path(&self, name: &TunnelName) -> PathBuf {
        self.options.config_dir.join(name.config_file_name())
    }

    /// Perform exactly one command.
    pub async fn execute(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> Result<Value> {
        let tools = &self.options.tools;
        let named = || {
            name.ok_or_else(|| AppError::InvalidName("Invalid tunnel name.".into()))
        };

        match command {
            HelperCommand::List => {
                let names = self.list_configs().await?;
                Ok(Value::from(names))
            }
            HelperCommand::Read => self.read_config(named()?).await.map(Value::String),
            HelperCommand::Write => {
                let path = self.write_config(named()?, content).await?;
                Ok(Value::String(path.display().to_string()))
            }
            HelperCommand::Delete => {
                self.delete_config(named()?).await?;
                Ok(Value::Bool(true))
            }
            HelperCommand::WgShowDump => Ok(Value::String(wg_show::dump(tools, named()?).await)),
            HelperCommand::WgShowAllowedIps => Ok(Value::String(
                wg_show::allowed_ips(tools, named()?).await,
            )),
            HelperCommand::WgShowInterfaces => Ok(Value::String(wg_show::interfaces(tools).await)),
            HelperCommand::WgShowAll => Ok(Value::String(wg_show::all(tools).await)),
            HelperCommand::WgUp => {
                wg_quick::up(tools, &self.config_path(named()?)).await?;
                Ok(Value::Bool(true))
            }
            HelperCommand::WgDown => {
                wg_quick::down(tools, &self.config_path(named()?)).await;
                Ok(Value::Bool(true))
            }
            HelperCommand::WgRestart => {
                wg_quick::restart(tools, &self.config_path(named()?)).await?;
                Ok(Value::Bool(true))
            }
        }
    }

    /// Decode one input line and run it. Lines that are not JSON objects with
    /// a positive integer `id` produce no reply.
    pub async fn handle_line(&self, line: &str) -> Option<HelperReply> {
        let payload: Value = serde_json::from_str(line.trim()).ok()?;
        let id = payload.get("id").and_then(Value::as_u64).filter(|id| *id > 0)?;

        let reply = match self.dispatch_payload(&payload).await {
            Ok(data) => HelperReply::success(id, data),
            Err(e) => {
                debug!( id = ?id, error = ?e.to_string(), "privileged_request_failed");
                HelperReply::failure(id, &e)
            }
        };
        Some(reply)
    }

    async fn dispatch_payload(&self, payload: &Value) -> Result<Value> {
        let command: HelperCommand = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()?;
        info!( command = ?command.as_str(), "privileged_request_received");

        let name = if command.takes_name() {
            let raw = payload
                .pointer("/args/name")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::InvalidName("Invalid tunnel name.".into()))?;
            Some(TunnelName::normalize(raw)?)
        } else {
            None
        };
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        self.execute(command, name.as_ref(), content).await
    }

    async fn list_configs(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.config_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(CONFIG_SUFFIX))
            else {
                continue;
            };
            if is_valid_name(stem) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_config(&self, name: &TunnelName) -> Result<String> {
        match tokio::fs::read_to_string(self.config_path(name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(
                format!("Tunnel {} not found.", name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the config through a 0600 temp file in the same directory and a
    /// rename, so readers only ever see the old or the new content.
    async fn write_config(&self, name: &TunnelName, content: &str) -> Result<PathBuf> {
        ensure_private_dir(self.config_dir()).await?;
        let target = self.config_path(name);
        let tmp = self.config_dir().join(format!(
            ".tmp-{}-{}-{}-{}",
            name,
            std::process::id(),
            unix_nanos(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let result = write_private_file(&tmp, content.as_bytes()).await;
        let result = match result {
            Ok(()) => tokio::fs::rename(&tmp, &target).await.map_err(AppError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        info!( path = ?target.display().to_string(), "config_written");
        Ok(target)
    }

    async fn delete_config(&self, name: &TunnelName) -> Result<()> {
        let path = self.config_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!( path = ?path.display().to_string(), "config_deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    // The requested mode is subject to umask; set it explicitly.
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    chown(path, Some(Uid::effective()), Some(Gid::effective())).map_err(std::io::Error::from)?;
    Ok(())
}

async fn ensure_private_dir(dir: &Path) -> Result<()> {
    if tokio::fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Serve the line protocol: announce readiness, then answer every request
/// line. Requests run concurrently; a single writer keeps frames whole.
pub async fn serve<R, W>(helper: Arc<Helper>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ready = serde_json::to_vec(&ReadyFrame::new())?;
    ready.push(b'\n');
    writer.write_all(&ready).await?;
    writer.flush().await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!( error = ?e.to_string(), "privileged_response_write_failed");
                return;
            }
            if let Err(e) = writer.flush().await {
                warn!( error = ?e.to_string(), "privileged_response_flush_failed");
                return;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = reader.read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            debug!("privileged_helper_exiting_stdin_eof");
            break;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        if text.trim().is_empty() {
            continue;
        }

        let helper = helper.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let Some(reply) = helper.handle_line(&text).await else {
                debug!("privileged_request_dropped_malformed");
                return;
            };
            match serde_json::to_vec(&reply) {
                Ok(mut frame) => {
                    frame.push(b'\n');
                    let _ = tx.send(frame);
                }
                Err(e) => warn!( error = ?e.to_string(), "privileged_response_encode_failed"),
            }
        });
    }

    // In-flight requests hold sender clones; the writer drains them before exiting.
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

/// Entry point of `wgpanel helper`: serve on stdin/stdout.
pub async fn serve_stdio(options: HelperOptions) -> anyhow::Result<()> {
    info!(
        config_dir = ?options.config_dir.display().to_string(),
        wg = ?options.tools.wg.display().to_string(),
        euid = ?Uid::effective().as_raw(), "privileged_helper_start");
    let helper = Arc::new(Helper::new(options));
    serve(helper, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    use tokio::io::AsyncReadExt;

    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake tool");
        path
    }

    fn helper_in(dir: &Path, wg_body: &str, wg_quick_body: &str) -> Helper {
        let bin_dir = dir.join("bin");
        std::fs::create_dir_all(&bin_dir).expect("create bin dir");
        Helper::new(HelperOptions {
            config_dir: dir.join("wireguard"),
            tools: ToolPaths {
                wg: fake_tool(&bin_dir, "wg", wg_body),
                wg_quick: fake_tool(&bin_dir, "wg-quick", wg_quick_body),
            },
        })
    }

    fn name(raw: &str) -> TunnelName {
        TunnelName::normalize(raw).expect("valid name")
    }

    #[tokio::test]
    async fn write_then_read_returns_exact_content_with_private_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(dir.path(), "exit 0", "exit 0");
        let wg0 = name("wg0");
        let content = "[Interface]\nPrivateKey = abc=\nAddress = 10.0.0.2/32\n";

        helper
            .execute(HelperCommand::Write, Some(&wg0), content)
            .await
            .expect("write");
        let read = helper
            .execute(HelperCommand::Read, Some(&wg0), "")
            .await
            .expect("read");
        assert_eq!(read, Value::String(content.into()));

        let meta = std::fs::metadata(helper.config_path(&wg0)).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(meta.uid(), Uid::effective().as_raw());
        let dir_mode = std::fs::metadata(helper.config_dir())
            .expect("dir metadata")
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let leftovers: Vec<_> = std::fs::read_dir(helper.config_dir())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_partial_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = Arc::new(helper_in(dir.path(), "exit 0", "exit 0"));
        let wg0 = name("wg0");
        let a = "A".repeat(256 * 1024);
        let b = "B".repeat(256 * 1024);
        helper
            .execute(HelperCommand::Write, Some(&wg0), &a)
            .await
            .expect("seed");

        let writer = {
            let helper = helper.clone();
            let wg0 = wg0.clone();
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                for i in 0..20 {
                    let content = if i % 2 == 0 { &b } else { &a };
                    helper
                        .execute(HelperCommand::Write, Some(&wg0), content)
                        .await
                        .expect("write");
                }
            })
        };

        for _ in 0..40 {
            let listed = helper
                .execute(HelperCommand::List, None, "")
                .await
                .expect("list");
            assert_eq!(listed, serde_json::json!(["wg0"]));
            let read = helper
                .execute(HelperCommand::Read, Some(&wg0), "")
                .await
                .expect("read");
            let text = read.as_str().expect("string");
            assert!(text == a || text == b, "observed partial write of {} bytes", text.len());
        }
        writer.await.expect("writer task");
    }

    #[tokio::test]
    async fn read_missing_is_not_found_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(dir.path(), "exit 0", "exit 0");
        let ghost = name("ghost");

        let err = helper
            .execute(HelperCommand::Read, Some(&ghost), "")
            .await
            .expect_err("missing config");
        assert!(matches!(err, AppError::NotFound(_)));

        for _ in 0..2 {
            let deleted = helper
                .execute(HelperCommand::Delete, Some(&ghost), "")
                .await
                .expect("delete");
            assert_eq!(deleted, Value::Bool(true));
        }
    }

    #[tokio::test]
    async fn list_filters_and_sorts_config_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(dir.path(), "exit 0", "exit 0");
        assert_eq!(
            helper.execute(HelperCommand::List, None, "").await.expect("list"),
            serde_json::json!([])
        );

        std::fs::create_dir_all(helper.config_dir()).expect("config dir");
        for file in ["zeta.conf", "alpha.conf", "notes.txt", "bad name.conf", ".tmp-x-1-2"] {
            std::fs::write(helper.config_dir().join(file), "").expect("seed file");
        }
        std::fs::create_dir(helper.config_dir().join("dir.conf")).expect("seed dir");

        let listed = helper.execute(HelperCommand::List, None, "").await.expect("list");
        assert_eq!(listed, serde_json::json!(["alpha", "zeta"]));
    }

    #[tokio::test]
    async fn diagnostic_queries_tolerate_inactive_interfaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(
            dir.path(),
            "echo 'Unable to access interface: No such device' >&2; exit 1",
            "exit 0",
        );
        let wg0 = name("wg0");
        for command in [HelperCommand::WgShowDump, HelperCommand::WgShowAllowedIps] {
            let out = helper.execute(command, Some(&wg0), "").await.expect("tolerated");
            assert_eq!(out, Value::String(String::new()));
        }
        for command in [HelperCommand::WgShowInterfaces, HelperCommand::WgShowAll] {
            let out = helper.execute(command, None, "").await.expect("tolerated");
            assert_eq!(out, Value::String(String::new()));
        }
    }

    #[tokio::test]
    async fn wg_show_passes_validated_name_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(dir.path(), "echo \"$@\"", "exit 0");
        let out = helper
            .execute(HelperCommand::WgShowDump, Some(&name("home")), "")
            .await
            .expect("dump");
        assert_eq!(out, Value::String("show home dump\n".into()));
    }

    #[tokio::test]
    async fn up_propagates_failure_and_down_tolerates_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(
            dir.path(),
            "exit 0",
            "echo \"Line unrecognized: 'Adress=10.0.0.2'\" >&2; exit 1",
        );
        let wg0 = name("wg0");

        let err = helper
            .execute(HelperCommand::WgUp, Some(&wg0), "")
            .await
            .expect_err("up fails");
        assert!(matches!(err, AppError::Tool(_)));
        assert!(err.to_string().contains("Line unrecognized"));

        let down = helper
            .execute(HelperCommand::WgDown, Some(&wg0), "")
            .await
            .expect("down tolerated");
        assert_eq!(down, Value::Bool(true));
    }

    #[tokio::test]
    async fn restart_ignores_down_failure_but_not_up_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("calls.log");
        let body = format!(
            "echo \"$1\" >> '{}'\n[ \"$1\" = down ] && exit 1\nexit 0",
            log.display()
        );
        let helper = helper_in(dir.path(), "exit 0", &body);
        let wg0 = name("wg0");

        helper
            .execute(HelperCommand::WgRestart, Some(&wg0), "")
            .await
            .expect("restart");
        assert_eq!(std::fs::read_to_string(&log).expect("log"), "down\nup\n");
    }

    #[tokio::test]
    async fn handle_line_reports_errors_and_drops_malformed_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = helper_in(dir.path(), "exit 0", "exit 0");

        let reply = helper
            .handle_line(r#"{"id":4,"command":"read","args":{"name":"../../etc/shadow"}}"#)
            .await
            .expect("reply");
        assert!(!reply.ok);
        assert_eq!(reply.code.as_deref(), Some("InvalidName"));

        let reply = helper
            .handle_line(r#"{"id":5,"command":"format_disk","args":{}}"#)
            .await
            .expect("reply");
        assert_eq!(reply.code.as_deref(), Some("UnsupportedCommand"));
        assert_eq!(reply.error.as_deref(), Some("Unsupported command."));

        let reply = helper
            .handle_line(r#"{"id":6,"command":"wg_up","args":{}}"#)
            .await
            .expect("reply");
        assert_eq!(reply.code.as_deref(), Some("InvalidName"));

        for garbage in ["{not json", r#"{"command":"list"}"#, r#"{"id":0,"command":"list"}"#, "[1,2]"] {
            assert!(helper.handle_line(garbage).await.is_none(), "{garbage}");
        }
    }

    #[tokio::test]
    async fn serve_announces_ready_then_answers_each_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = Arc::new(helper_in(dir.path(), "exit 0", "exit 0"));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let server_task = tokio::spawn(serve(helper, server_read, server_write));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(
                b"garbage\n{\"id\":1,\"command\":\"write\",\"args\":{\"name\":\"wg0\"},\"content\":\"x\"}\n\n{\"id\":2,\"command\":\"nope\"}\n",
            )
            .await
            .expect("write requests");
        client_write.shutdown().await.expect("close stdin");
        drop(client_write);

        let mut output = String::new();
        client_read
            .read_to_string(&mut output)
            .await
            .expect("read replies");
        server_task.await.expect("join").expect("serve");

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3, "{output}");
        assert_eq!(lines[0], r#"{"type":"ready"}"#);
        let mut ids: Vec<u64> = lines[1..]
            .iter()
            .map(|l| serde_json::from_str::<HelperReply>(l).expect("reply frame").id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
