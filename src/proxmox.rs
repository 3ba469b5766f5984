//! Proxmox VE destination connector.
//!
//! VM definition, device configuration and power state go through the REST
//! API on port 8006. Disk import uses `qm importdisk` on the node, either
//! locally or over ssh.

use crate::config::{DestinationConfig, DiskFormat};
use crate::connectors::{
    BootDevice, BootOrder, DestinationConnector, NetworkSpec, VmDefinition, VmHandle,
};
use crate::exec::{RemoteShell, run_local};
use crate::request::Credentials;
use crate::retry::with_retries;
use crate::{MigrationError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
// Tickets expire after two hours; renew well before that.
const TICKET_RENEWAL: Duration = Duration::from_secs(90 * 60);

#[derive(Clone)]
pub enum ProxmoxAuth {
    Password { username: String, password: String },
    ApiToken(String),
}

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
    issued: Instant,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct ClusterResource {
    #[serde(default)]
    vmid: Option<u32>,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Thin JSON client for the Proxmox VE API.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth: ProxmoxAuth,
    session: Mutex<Option<Session>>,
    retries: u32,
}

impl ProxmoxClient {
    pub fn new(
        host: &str,
        port: u16,
        auth: ProxmoxAuth,
        verify_tls: bool,
        retries: u32,
    ) -> Result<Self> {
        let base_url = format!("https://{}:{}/api2/json", host, port);
        Self::with_base_url(base_url, auth, verify_tls, retries)
    }

    /// Client rooted at an explicit API URL, e.g. `https://pve01:8006/api2/json`.
    pub fn with_base_url(
        base_url: String,
        auth: ProxmoxAuth,
        verify_tls: bool,
        retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MigrationError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            auth,
            session: Mutex::new(None),
            retries,
        })
    }

    fn uses_ticket(&self) -> bool {
        matches!(self.auth, ProxmoxAuth::Password { .. })
    }

    async fn login(&self) -> Result<Session> {
        let ProxmoxAuth::Password { username, password } = &self.auth else {
            return Err(MigrationError::State("token auth has no session".to_string()));
        };
        let url = format!("{}/access/ticket", self.base_url);
        let body = json!({ "username": username, "password": password });

        let ticket: TicketData = with_retries("Proxmox login", self.retries, || async {
            let response = self.http.post(&url).json(&body).send().await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(MigrationError::Authentication(format!(
                    "Proxmox rejected credentials for {}",
                    username
                )));
            }
            decode(response).await
        })
        .await?;

        log_debug!("Authenticated to Proxmox as {}", username);
        Ok(Session {
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_token,
            issued: Instant::now(),
        })
    }

    async fn authorize(
        &self,
        method: &Method,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        match &self.auth {
            ProxmoxAuth::ApiToken(token) => {
                Ok(builder.header("Authorization", format!("PVEAPIToken={}", token)))
            }
            ProxmoxAuth::Password { .. } => {
                let mut session = self.session.lock().await;
                let stale = session
                    .as_ref()
                    .is_none_or(|s| s.issued.elapsed() >= TICKET_RENEWAL);
                if stale {
                    *session = Some(self.login().await?);
                }
                let Some(session) = session.as_ref() else {
                    return Err(MigrationError::State("no Proxmox session".to_string()));
                };
                let builder =
                    builder.header("Cookie", format!("PVEAuthCookie={}", session.ticket));
                if *method == Method::GET {
                    Ok(builder)
                } else {
                    Ok(builder.header("CSRFPreventionToken", session.csrf_token.clone()))
                }
            }
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut builder = self.http.request(method.clone(), url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(self.authorize(method, builder).await?.send().await?)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        log_debug!("Proxmox {} {}", method, path);
        let response = self.dispatch(&method, &url, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED && self.uses_ticket() {
            // Ticket expired or revoked server-side: log in again and resend once.
            log_warn!("Proxmox rejected the session ticket, logging in again");
            self.session.lock().await.take();
            let response = self.dispatch(&method, &url, body).await?;
            return decode(response).await;
        }
        decode(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        with_retries(&format!("GET {}", path), self.retries, || {
            self.send(Method::GET, path, None)
        })
        .await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.send(Method::PUT, path, Some(body)).await
    }

    /// Poll an asynchronous task until it stops; non-OK exit status is an API error.
    pub async fn wait_task(&self, node: &str, upid: &str) -> Result<()> {
        let started = Instant::now();
        let path = format!("/nodes/{}/tasks/{}/status", node, upid);
        loop {
            let status: TaskStatus = self.get(&path).await?;
            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(MigrationError::Api(format!(
                        "task {} failed: {}",
                        upid,
                        other.unwrap_or("unknown exit status")
                    ))),
                };
            }
            if started.elapsed() > TASK_TIMEOUT {
                return Err(MigrationError::Timeout {
                    operation: format!("Proxmox task {}", upid),
                    limit: TASK_TIMEOUT,
                });
            }
            sleep(TASK_POLL_INTERVAL).await;
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(MigrationError::Authentication(
            "Proxmox session rejected".to_string(),
        ));
    }
    if !status.is_success() {
        let reason = status.canonical_reason().unwrap_or("").to_string();
        let body = response.text().await.unwrap_or_default();
        return Err(MigrationError::Api(format!(
            "HTTP {} {}: {}",
            status.as_u16(),
            reason,
            body.trim()
        )));
    }
    let envelope: Envelope<T> = response.json().await?;
    Ok(envelope.data)
}

/// Where `qm importdisk` runs.
pub enum DiskImporter {
    Local,
    Ssh(RemoteShell),
}

impl DiskImporter {
    async fn import(
        &self,
        vmid: u32,
        path: &Path,
        storage: &str,
        format: DiskFormat,
    ) -> Result<String> {
        let args = vec![
            "importdisk".to_string(),
            vmid.to_string(),
            path.to_string_lossy().into_owned(),
            storage.to_string(),
            "--format".to_string(),
            format.as_str().to_string(),
        ];
        let output = match self {
            DiskImporter::Local => run_local("qm", &args).await?,
            DiskImporter::Ssh(shell) => {
                let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
                shell.run(&format!("qm {}", quoted.join(" "))).await?
            }
        };
        parse_imported_volume(&output).ok_or_else(|| {
            MigrationError::Api(format!(
                "could not find imported volume in qm output: {}",
                output.trim()
            ))
        })
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Extract `local-lvm:vm-100-disk-0` from
/// `Successfully imported disk as 'unused0:local-lvm:vm-100-disk-0'`.
pub fn parse_imported_volume(output: &str) -> Option<String> {
    const MARKER: &str = "imported disk as '";
    let line = output.lines().rev().find(|l| l.contains(MARKER))?;
    let start = line.find(MARKER)? + MARKER.len();
    let rest = &line[start..];
    let quoted = &rest[..rest.find('\'')?];
    let volume = match quoted.split_once(':') {
        Some((slot, volume)) if slot.starts_with("unused") => volume,
        _ => quoted,
    };
    Some(volume.to_string())
}

/// Proxmox VM names must be valid DNS names.
pub fn proxmox_vm_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "migrated-vm".to_string()
    } else {
        trimmed.to_string()
    }
}

fn boot_device_key(device: BootDevice) -> &'static str {
    match device {
        BootDevice::PrimaryDisk => "virtio0",
        BootDevice::Cdrom => "ide2",
        BootDevice::Network => "net0",
    }
}

pub struct ProxmoxConnector {
    client: ProxmoxClient,
    node: String,
    storage: String,
    disk_format: DiskFormat,
    importer: DiskImporter,
}

impl ProxmoxConnector {
    pub fn new(
        client: ProxmoxClient,
        node: String,
        storage: String,
        disk_format: DiskFormat,
        importer: DiskImporter,
    ) -> Self {
        Self {
            client,
            node,
            storage,
            disk_format,
            importer,
        }
    }

    pub fn from_config(credentials: &Credentials, config: &DestinationConfig) -> Result<Self> {
        let auth = match (&config.api_token, &credentials.password) {
            (Some(token), _) => ProxmoxAuth::ApiToken(token.clone()),
            (None, Some(password)) => ProxmoxAuth::Password {
                username: credentials.username.clone(),
                password: password.clone(),
            },
            (None, None) => {
                return Err(MigrationError::Config(
                    "destination password or api_token is required".to_string(),
                ));
            }
        };
        let client = ProxmoxClient::new(
            &credentials.host,
            config.port,
            auth,
            config.verify_tls,
            config.retries,
        )?;
        let importer = if config.import_via_ssh {
            let ssh_credentials = Credentials {
                host: credentials.host.clone(),
                username: "root".to_string(),
                password: None,
            };
            DiskImporter::Ssh(RemoteShell::new(
                &ssh_credentials,
                config.node_ssh_port,
                config.retries,
            ))
        } else {
            DiskImporter::Local
        };
        Ok(Self::new(
            client,
            config.node.clone(),
            config.storage.clone(),
            config.disk_format,
            importer,
        ))
    }

    fn vm_path(&self, handle: &VmHandle, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", handle.node, handle.vmid, suffix)
    }

    async fn set_config(&self, handle: &VmHandle, body: Value) -> Result<()> {
        let _: Value = self.client.put(&self.vm_path(handle, "/config"), &body).await?;
        Ok(())
    }

    async fn import_primary(&self, handle: &VmHandle, path: &Path) -> Result<()> {
        let format = DiskFormat::from_path(path).unwrap_or(self.disk_format);
        let volume = self
            .importer
            .import(handle.vmid, path, &self.storage, format)
            .await?;
        log_info!("Imported {} as {}", path.display(), volume);
        self.set_config(handle, json!({ "virtio0": volume })).await
    }
}

#[async_trait]
impl DestinationConnector for ProxmoxConnector {
    fn name(&self) -> &str {
        "proxmox"
    }

    async fn exists(&self, vmid: u32) -> Result<bool> {
        let resources: Vec<ClusterResource> =
            self.client.get("/cluster/resources?type=vm").await?;
        Ok(resources.iter().any(|r| r.vmid == Some(vmid)))
    }

    async fn create_vm(&self, definition: &VmDefinition) -> Result<VmHandle> {
        log_info!(
            "Creating VM {} ({}) on node {}",
            definition.vmid,
            definition.name,
            self.node
        );
        let body = json!({
            "vmid": definition.vmid,
            "name": proxmox_vm_name(&definition.name),
            "cores": definition.cores,
            "memory": definition.memory_mb,
            "ostype": definition.guest_os.proxmox_ostype(),
        });
        let upid: String = self
            .client
            .post(&format!("/nodes/{}/qemu", self.node), &body)
            .await?;
        self.client.wait_task(&self.node, &upid).await?;
        Ok(VmHandle {
            node: self.node.clone(),
            vmid: definition.vmid,
        })
    }

    async fn import_disk(&self, handle: &VmHandle, path: &Path) -> Result<()> {
        self.import_primary(handle, path).await
    }

    async fn replace_disk(&self, handle: &VmHandle, path: &Path) -> Result<()> {
        // The previous virtio0 volume is kept by Proxmox as an unused disk.
        self.import_primary(handle, path).await
    }

    async fn configure_devices(
        &self,
        handle: &VmHandle,
        network: &NetworkSpec,
        boot: &BootOrder,
    ) -> Result<()> {
        let order: Vec<&str> = boot.devices().iter().map(|d| boot_device_key(*d)).collect();
        self.set_config(
            handle,
            json!({
                "net0": format!("{},bridge={}", network.model, network.bridge),
                "boot": format!("order={}", order.join(";")),
            }),
        )
        .await
    }

    async fn attach_media(&self, handle: &VmHandle, iso: &str) -> Result<()> {
        self.set_config(handle, json!({ "ide2": format!("{},media=cdrom", iso) }))
            .await
    }

    async fn start(&self, handle: &VmHandle) -> Result<()> {
        log_info!("Starting VM {} on node {}", handle.vmid, handle.node);
        let upid: String = self
            .client
            .post(&self.vm_path(handle, "/status/start"), &json!({}))
            .await?;
        self.client.wait_task(&handle.node, &upid).await
    }
}
