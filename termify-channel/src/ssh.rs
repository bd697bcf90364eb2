//! SSH transport: authenticated remote shells and the connectivity probe.
//!
//! Both paths share [`connect`], which resolves the host, runs the handshake
//! and authenticates with a password or a private key. The probe tears the
//! connection down straight away; [`SshChannel::open`] keeps it and requests a
//! PTY-backed interactive shell on a fresh session channel.
//!
//! Failures fall into three buckets callers render differently:
//! [`ChannelError::Unreachable`] (network, DNS, timeouts),
//! [`ChannelError::AuthFailed`] (credentials rejected or unusable) and
//! [`ChannelError::ProtocolError`] (anything else the server refused).

use crate::channel::{
    Channel, ChannelExit, ChannelKind, ChannelOutput, OUTPUT_QUEUE, OpenedChannel, OutputStream,
};
use crate::error::ChannelError;
use crate::geometry::Geometry;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key};
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Bound on TCP connect, handshake and authentication together.
    pub connect_timeout: Duration,
    pub keepalive: Option<Duration>,
    /// Terminal type requested with the remote PTY.
    pub term: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Some(Duration::from_secs(30)),
            term: "xterm-256color".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum SshAuth {
    Password(SecretString),
    PrivateKey {
        /// OpenSSH or PEM encoded key material.
        key: SecretString,
        passphrase: Option<SecretString>,
    },
}

impl SshAuth {
    /// Assemble credentials from optional request fields.
    ///
    /// Exactly one of `password` and `private_key` must be present.
    pub fn from_parts(
        password: Option<String>,
        private_key: Option<String>,
        passphrase: Option<String>,
    ) -> Result<Self, ChannelError> {
        match (password, private_key) {
            (Some(password), None) => Ok(SshAuth::Password(password.into())),
            (None, Some(key)) => Ok(SshAuth::PrivateKey {
                key: key.into(),
                passphrase: passphrase.map(Into::into),
            }),
            (Some(_), Some(_)) => Err(ChannelError::AuthFailed(
                "password and private key are mutually exclusive".to_string(),
            )),
            (None, None) => Err(ChannelError::AuthFailed(
                "either a password or a private key is required".to_string(),
            )),
        }
    }
}

#[derive(Debug)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Expected `SHA256:` host key fingerprint. Any key is accepted when unset.
    pub host_fingerprint: Option<String>,
}

/// What the server revealed about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub key_algorithm: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
struct HostKey {
    algorithm: String,
    fingerprint: String,
}

struct ClientHandler {
    expected_fingerprint: Option<String>,
    seen: Arc<Mutex<Option<HostKey>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let algorithm = server_public_key.algorithm().as_str().to_string();
        let accepted = self
            .expected_fingerprint
            .as_ref()
            .is_none_or(|expected| *expected == fingerprint);
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(HostKey {
            algorithm,
            fingerprint,
        });
        Ok(accepted)
    }
}

fn protocol_error(context: &str) -> impl FnOnce(russh::Error) -> ChannelError + '_ {
    move |e| ChannelError::ProtocolError(format!("{context}: {e}"))
}

/// Connect and authenticate, returning the session handle and the host key.
async fn connect(
    target: &SshTarget,
    options: &SshOptions,
) -> Result<(Handle<ClientHandler>, HostKey), ChannelError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: options.keepalive,
        ..Default::default()
    });
    let seen = Arc::new(Mutex::new(None));
    let handler = ClientHandler {
        expected_fingerprint: target.host_fingerprint.clone(),
        seen: Arc::clone(&seen),
    };

    let attempt = async {
        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| classify_connect_error(e, target, &seen))?;
        authenticate(&mut handle, target).await?;
        Ok::<_, ChannelError>(handle)
    };

    let handle = tokio::time::timeout(options.connect_timeout, attempt)
        .await
        .map_err(|_| {
            ChannelError::Unreachable(format!(
                "{}:{} did not complete login within {:?}",
                target.host, target.port, options.connect_timeout
            ))
        })??;

    let host_key = seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| ChannelError::ProtocolError("server presented no host key".to_string()))?;
    Ok((handle, host_key))
}

fn classify_connect_error(
    err: russh::Error,
    target: &SshTarget,
    seen: &Mutex<Option<HostKey>>,
) -> ChannelError {
    let actual = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
    if let (Some(expected), Some(actual)) = (target.host_fingerprint.as_ref(), actual)
        && *expected != actual.fingerprint
    {
        return ChannelError::ProtocolError(format!(
            "host key mismatch for {}: expected {}, got {}",
            target.host, expected, actual.fingerprint
        ));
    }
    match err {
        russh::Error::IO(e) => {
            ChannelError::Unreachable(format!("{}:{}: {}", target.host, target.port, e))
        }
        other => ChannelError::ProtocolError(format!("handshake with {} failed: {}", target.host, other)),
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &SshTarget,
) -> Result<(), ChannelError> {
    let result = match &target.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(target.username.as_str(), password.expose_secret())
            .await
            .map_err(protocol_error("password authentication"))?,
        SshAuth::PrivateKey { key, passphrase } => {
            let key = decode_secret_key(
                key.expose_secret(),
                passphrase.as_ref().map(|p| p.expose_secret()),
            )
            .map_err(|e| ChannelError::AuthFailed(format!("unusable private key: {e}")))?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(protocol_error("negotiating key signature"))?
                .flatten();
            handle
                .authenticate_publickey(
                    target.username.as_str(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(protocol_error("public key authentication"))?
        }
    };

    if result.success() {
        Ok(())
    } else {
        Err(ChannelError::AuthFailed(format!(
            "server rejected credentials for {}",
            target.username
        )))
    }
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("SSH disconnect: {}", e);
    }
}

/// Authenticate against `target` and disconnect immediately.
pub async fn probe(target: &SshTarget, options: &SshOptions) -> Result<ServerInfo, ChannelError> {
    let (handle, host_key) = connect(target, options).await?;
    disconnect(&handle).await;
    info!(
        "SSH probe of {}@{}:{} succeeded ({})",
        target.username, target.host, target.port, host_key.fingerprint
    );
    Ok(ServerInfo {
        host: target.host.clone(),
        port: target.port,
        key_algorithm: host_key.algorithm,
        fingerprint: host_key.fingerprint,
    })
}

/// Interactive shell on an SSH session channel.
pub struct SshChannel {
    writer: tokio::sync::Mutex<ChannelWriteHalf<Msg>>,
    handle: tokio::sync::Mutex<Handle<ClientHandler>>,
    closed: AtomicBool,
}

impl SshChannel {
    pub async fn open(
        target: &SshTarget,
        options: &SshOptions,
        geometry: Geometry,
    ) -> Result<OpenedChannel, ChannelError> {
        let (handle, host_key) = connect(target, options).await?;
        let (channel, pending) = match start_shell(&handle, options, geometry).await {
            Ok(opened) => opened,
            Err(e) => {
                disconnect(&handle).await;
                return Err(e);
            }
        };
        info!(
            "Opened SSH shell {}@{}:{} ({})",
            target.username, target.host, target.port, host_key.fingerprint
        );

        let (mut reader, writer) = channel.split();
        let (tx, output) = OutputStream::channel(OUTPUT_QUEUE);
        tokio::spawn(async move {
            for data in pending {
                if tx.send(ChannelOutput::Data(data)).await.is_err() {
                    return;
                }
            }
            let mut exit_code = None;
            while let Some(msg) = reader.wait().await {
                match msg {
                    ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                        if tx.send(ChannelOutput::Data(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            debug!("SSH shell closed with exit status {:?}", exit_code);
            let _ = tx.send(ChannelOutput::Closed(ChannelExit { exit_code })).await;
        });

        Ok(OpenedChannel {
            channel: Arc::new(Self {
                writer: tokio::sync::Mutex::new(writer),
                handle: tokio::sync::Mutex::new(handle),
                closed: AtomicBool::new(false),
            }),
            output,
        })
    }
}

/// Request a PTY and a shell, returning the channel and any output that
/// arrived while waiting for the replies.
async fn start_shell(
    handle: &Handle<ClientHandler>,
    options: &SshOptions,
    geometry: Geometry,
) -> Result<(russh::Channel<Msg>, Vec<Vec<u8>>), ChannelError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(protocol_error("opening session channel"))?;
    let mut pending = Vec::new();

    channel
        .request_pty(
            true,
            &options.term,
            u32::from(geometry.cols),
            u32::from(geometry.rows),
            0,
            0,
            &[],
        )
        .await
        .map_err(protocol_error("requesting PTY"))?;
    await_reply(&mut channel, "PTY", &mut pending).await?;

    channel
        .request_shell(true)
        .await
        .map_err(protocol_error("requesting shell"))?;
    await_reply(&mut channel, "shell", &mut pending).await?;

    Ok((channel, pending))
}

async fn await_reply(
    channel: &mut russh::Channel<Msg>,
    request: &str,
    pending: &mut Vec<Vec<u8>>,
) -> Result<(), ChannelError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(ChannelError::ProtocolError(format!(
                    "server refused {request} request"
                )));
            }
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                pending.push(data.to_vec());
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(ChannelError::ProtocolError(format!(
                    "channel closed while waiting for {request} reply"
                )));
            }
            Some(_) => {}
        }
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Remote
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.writer
            .lock()
            .await
            .data(data)
            .await
            .map_err(ChannelError::io)
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.writer
            .lock()
            .await
            .window_change(u32::from(geometry.cols), u32::from(geometry.rows), 0, 0)
            .await
            .map_err(ChannelError::io)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.writer.lock().await.close().await {
            warn!("closing SSH shell channel: {}", e);
        }
        disconnect(&*self.handle.lock().await).await;
        Ok(())
    }
}
