//! The control plane: a length-framed RPC spoken over a UNIX stream socket,
//! and the controller personality's `start`/`stop`/`restart`/passthrough
//! sub-commands built on top of it.
//!
//! Wire format: a 4-byte big-endian length prefix followed by a JSON
//! payload, in both directions. Three verbs, each with an empty body:
//! `Incref`, `Decref`, `Restart`. The `Decref`-to-zero case is special —
//! the client must see its reply and close its end before the supervisor
//! finishes tearing down — so the server side hands callers a second
//! channel to signal once that has happened, rather than replying and
//! shutting down in the same step.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ControlError {
    #[error("input/output error on the control socket: {0}")]
    Io(#[source] io::Error),
    #[error("could not connect to the control socket at {0:?}: {1}")]
    Connect(PathBuf, #[source] io::Error),
    #[error("could not bind the control socket at {0:?}: {1}")]
    Bind(PathBuf, #[source] io::Error),
    #[error("could not encode an RPC message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode an RPC message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("the supervisor is no longer accepting control-plane requests")]
    SupervisorGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Incref,
    Decref,
    Restart,
}

/// One accepted request, paired with the channel its handler replies
/// through.
pub struct Request {
    pub verb: Verb,
    reply: oneshot::Sender<Decision>,
}

impl Request {
    /// Acknowledge the request; the client's reply is sent immediately.
    pub fn ack(self) {
        let _ = self.reply.send(Decision::Ack);
    }

    /// Acknowledge a `Decref` that has just dropped the reference count to
    /// zero. The client's reply is still sent immediately, but the returned
    /// receiver only resolves once the client has closed its connection —
    /// the supervisor must wait on it before tearing down.
    #[must_use]
    pub fn ack_shutting_down(self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.reply.send(Decision::ShuttingDown(tx));
        rx
    }
}

enum Decision {
    Ack,
    ShuttingDown(oneshot::Sender<()>),
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Bind the control socket at `path`, removing any stale socket file first.
pub async fn bind(path: &Path) -> Result<UnixListener, ControlError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(ControlError::Io)?;
    }
    UnixListener::bind(path).map_err(|err| ControlError::Bind(path.to_owned(), err))
}

/// Accept connections forever, forwarding each decoded verb to `requests`.
/// Each connection is handled on its own task so that a slow or stuck
/// client cannot block others.
pub async fn serve(listener: UnixListener, requests: mpsc::Sender<Request>) -> ControlError {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => return ControlError::Io(err),
        };
        let requests = requests.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, requests).await {
                log::debug!("control connection ended: {err}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    requests: mpsc::Sender<Request>,
) -> Result<(), ControlError> {
    let frame = read_frame(&mut stream).await.map_err(ControlError::Io)?;
    let verb: Verb = serde_json::from_slice(&frame).map_err(ControlError::Decode)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    requests
        .send(Request { verb, reply: reply_tx })
        .await
        .map_err(|_| ControlError::SupervisorGone)?;

    match reply_rx.await.map_err(|_| ControlError::SupervisorGone)? {
        Decision::Ack => {
            write_frame(&mut stream, b"{}").await.map_err(ControlError::Io)?;
        }
        Decision::ShuttingDown(disconnected) => {
            write_frame(&mut stream, b"{}").await.map_err(ControlError::Io)?;
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
            let _ = disconnected.send(());
        }
    }
    Ok(())
}

/// Connect to the control socket at `path` and call `verb`, waiting for the
/// (empty) reply.
pub async fn call(path: &Path, verb: Verb) -> Result<(), ControlError> {
    let mut stream = UnixStream::connect(path)
        .await
        .map_err(|err| ControlError::Connect(path.to_owned(), err))?;
    let payload = serde_json::to_vec(&verb).map_err(ControlError::Encode)?;
    write_frame(&mut stream, &payload).await.map_err(ControlError::Io)?;
    read_frame(&mut stream).await.map_err(ControlError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Request, Verb};

    #[tokio::test]
    async fn incref_is_acknowledged_without_shutting_down() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(".xpg.skt");
        let listener = super::bind(&socket).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(super::serve(listener, tx));
        tokio::spawn(async move {
            let request: Request = rx.recv().await.unwrap();
            assert_eq!(request.verb, Verb::Incref);
            request.ack();
        });

        super::call(&socket, Verb::Incref).await.unwrap();
    }

    #[tokio::test]
    async fn decref_to_zero_replies_before_the_handler_is_told_the_client_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(".xpg.skt");
        let listener = super::bind(&socket).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(super::serve(listener, tx));

        let (disconnected_tx, disconnected_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let request: Request = rx.recv().await.unwrap();
            assert_eq!(request.verb, Verb::Decref);
            let rx = request.ack_shutting_down();
            let _ = disconnected_tx.send(rx.await.is_ok());
        });

        super::call(&socket, Verb::Decref).await.unwrap();
        assert!(disconnected_rx.await.unwrap());
    }
}
