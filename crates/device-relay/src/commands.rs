//! REST client for the device command endpoint.
//!
//! Commands are fire-and-forget from the viewer's side: results come back
//! as envelopes on the relay channel, not in the HTTP response.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::CommandError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    StartCamera,
    StopCamera,
    StartCameraStream,
    StopCameraStream,
    CaptureFrame,
    Screenshot,
    RecordAudio,
    StartAudioStream,
    StopAudioStream,
    UsbOn,
    UsbOff,
    CreateVpn,
    Other(String),
}

impl Command {
    pub const KNOWN: [Command; 12] = [
        Command::StartCamera,
        Command::StopCamera,
        Command::StartCameraStream,
        Command::StopCameraStream,
        Command::CaptureFrame,
        Command::Screenshot,
        Command::RecordAudio,
        Command::StartAudioStream,
        Command::StopAudioStream,
        Command::UsbOn,
        Command::UsbOff,
        Command::CreateVpn,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Command::StartCamera => "start_camera",
            Command::StopCamera => "stop_camera",
            Command::StartCameraStream => "start_camera_stream",
            Command::StopCameraStream => "stop_camera_stream",
            Command::CaptureFrame => "capture_frame",
            Command::Screenshot => "screenshot",
            Command::RecordAudio => "record_audio",
            Command::StartAudioStream => "start_audio_stream",
            Command::StopAudioStream => "stop_audio_stream",
            Command::UsbOn => "usb_on",
            Command::UsbOff => "usb_off",
            Command::CreateVpn => "create_vpn",
            Command::Other(raw) => raw,
        }
    }
}

impl FromStr for Command {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(Command::KNOWN
            .into_iter()
            .find(|known| known.as_str() == s)
            .unwrap_or_else(|| Command::Other(s.to_string())))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// Accepted, the device has not acknowledged yet.
    Pending,
    Other(String),
}

impl CommandStatus {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "success" | "ok" => CommandStatus::Success,
            "pending" => CommandStatus::Pending,
            _ => CommandStatus::Other(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub status: CommandStatus,
    pub device: Option<String>,
    pub command: Option<String>,
}

#[derive(Serialize)]
struct SendCommandRequest<'a> {
    device_id: &'a str,
    command: &'a str,
}

#[derive(Deserialize, Default)]
struct SendCommandResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    command: Option<String>,
}

pub struct CommandClient {
    http: reqwest::Client,
    endpoint: Url,
    bearer: Option<String>,
}

impl CommandClient {
    pub fn new(api_base: &Url, bearer: Option<String>) -> Result<Self, CommandError> {
        let mut base = api_base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("send_command")
            .map_err(|err| CommandError::Endpoint(format!("invalid command endpoint: {err}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            bearer,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send(&self, device_id: &str, command: &Command) -> Result<CommandReceipt, CommandError> {
        debug!(target = "relay", device = %device_id, command = %command, endpoint = %self.endpoint, "sending command");
        let mut builder = self.http.post(self.endpoint.clone());
        if let Some(token) = self.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .json(&SendCommandRequest {
                device_id,
                command: command.as_str(),
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CommandError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        // Some deployments answer with an empty body.
        let parsed: SendCommandResponse = serde_json::from_str(&body).unwrap_or_default();
        let receipt = CommandReceipt {
            status: parsed
                .status
                .as_deref()
                .map(CommandStatus::parse)
                .unwrap_or(CommandStatus::Success),
            device: parsed.device,
            command: parsed.command,
        };
        info!(target = "relay", device = %device_id, command = %command, status = ?receipt.status, "command accepted");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    type Seen = mpsc::UnboundedSender<(Option<String>, Value)>;

    async fn handler(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let command = body["command"].as_str().unwrap_or_default().to_string();
        let _ = seen.send((auth, body.clone()));
        match command.as_str() {
            "usb_on" => (StatusCode::OK, Json(json!({"status": "PENDING"}))),
            "forbidden" => (StatusCode::FORBIDDEN, Json(json!({"detail": "no"}))),
            _ => (
                StatusCode::OK,
                Json(json!({"status": "success", "device": body["device_id"], "command": command})),
            ),
        }
    }

    async fn spawn_api() -> (Url, mpsc::UnboundedReceiver<(Option<String>, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/send_command", post(handler))
            .with_state(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/api")).unwrap(), rx)
    }

    #[test]
    fn commands_parse_from_wire_names() {
        assert_eq!("capture_frame".parse::<Command>().unwrap(), Command::CaptureFrame);
        assert_eq!(
            "reboot".parse::<Command>().unwrap(),
            Command::Other("reboot".into())
        );
        for known in Command::KNOWN {
            assert_eq!(known.to_string().parse::<Command>().unwrap(), known);
        }
    }

    #[tokio::test]
    async fn posts_json_with_bearer_token() {
        let (base, mut seen) = spawn_api().await;
        let client = CommandClient::new(&base, Some("admin-token".into())).unwrap();
        assert_eq!(client.endpoint().path(), "/api/send_command");

        let receipt = client.send("dev1", &Command::Screenshot).await.unwrap();
        assert_eq!(receipt.status, CommandStatus::Success);
        assert_eq!(receipt.device.as_deref(), Some("dev1"));
        assert_eq!(receipt.command.as_deref(), Some("screenshot"));

        let (auth, body) = seen.recv().await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer admin-token"));
        assert_eq!(body, json!({"device_id": "dev1", "command": "screenshot"}));
    }

    #[tokio::test]
    async fn pending_and_rejected_responses() {
        let (base, _seen) = spawn_api().await;
        let client = CommandClient::new(&base, None).unwrap();

        let receipt = client.send("dev1", &Command::UsbOn).await.unwrap();
        assert_eq!(receipt.status, CommandStatus::Pending);

        let err = client
            .send("dev1", &Command::Other("forbidden".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected { status: 403, .. }));
    }
}
