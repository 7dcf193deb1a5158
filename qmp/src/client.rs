use std::{path::{Path, PathBuf}, time::Duration};

use serde_json::Value;
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::UnixStream, time::{Instant, timeout_at}};

use crate::{
    Error, Result,
    types::{CommandResponse, InvokeCommand, Response},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// QMP: greeting and capabilities negotiation before the first command.
    Management,
    /// qemu-ga: commands are accepted right away.
    Agent,
}

/// One-shot client. Every call opens a fresh connection and the whole
/// exchange is bounded by `timeout`, so a hung guest can't stall the caller.
#[derive(Debug, Clone)]
pub struct Client {
    path: PathBuf,
    channel: Channel,
    timeout: Duration,
}

struct Session {
    stream: UnixStream,
    buffer: Vec<u8>,
}

impl Client {
    pub fn management<P: AsRef<Path>>(path: P, timeout: Duration) -> Self {
        Client { path: path.as_ref().to_path_buf(), channel: Channel::Management, timeout }
    }

    pub fn agent<P: AsRef<Path>>(path: P, timeout: Duration) -> Self {
        Client { path: path.as_ref().to_path_buf(), channel: Channel::Agent, timeout }
    }

    pub async fn invoke(&self, command: InvokeCommand) -> Result<Value> {
        let deadline = Instant::now() + self.timeout;
        let mut session = timeout_at(deadline, self.open()).await.map_err(|_| Error::Timeout)??;
        timeout_at(deadline, session.write(&command)).await.map_err(|_| Error::Timeout)??;
        timeout_at(deadline, session.reply()).await.map_err(|_| Error::Timeout)?
    }

    /// For commands the peer may never answer (`guest-shutdown`, `guest-suspend-disk`):
    /// once the command is written, silence until the deadline is `Ok(None)`.
    pub async fn invoke_unacknowledged(&self, command: InvokeCommand) -> Result<Option<Value>> {
        let deadline = Instant::now() + self.timeout;
        let mut session = timeout_at(deadline, self.open()).await.map_err(|_| Error::Timeout)??;
        timeout_at(deadline, session.write(&command)).await.map_err(|_| Error::Timeout)??;
        match timeout_at(deadline, session.reply()).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(Error::ChannelClosed)) | Err(_) => {
                log::debug!("{} sent without reply on {:?}", command.name(), self.path);
                Ok(None)
            },
            Ok(Err(e)) => Err(e),
        }
    }

    async fn open(&self) -> Result<Session> {
        let stream = UnixStream::connect(&self.path).await?;
        let mut session = Session { stream, buffer: Vec::new() };
        if self.channel == Channel::Management {
            session.handshake().await?;
        }
        Ok(session)
    }
}

impl Session {
    async fn handshake(&mut self) -> Result<()> {
        match self.read().await?.into_iter().next() {
            Some(Response::Greeting(_)) => {},
            _ => return Err(Error::HandshakeMissing),
        }
        self.write(&InvokeCommand::capabilities()).await?;
        self.reply().await?;
        Ok(())
    }

    async fn write(&mut self, command: &InvokeCommand) -> Result<()> {
        let line = serde_json::to_string(command)? + "\r\n";
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads until at least one complete object is buffered and returns every complete one.
    async fn read(&mut self) -> Result<Vec<Response>> {
        let mut chunk = [0u8; 4096];
        loop {
            let values = drain(&mut self.buffer)?;
            if !values.is_empty() {
                return values
                    .into_iter()
                    .map(|value| serde_json::from_value(value).map_err(Error::from))
                    .collect();
            }
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(Error::ChannelClosed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn reply(&mut self) -> Result<Value> {
        loop {
            let mut results = Vec::new();
            for response in self.read().await? {
                match response {
                    Response::CommandResponse(CommandResponse { error: Some(error), .. }) => {
                        return Err(Error::Command(error.desc));
                    },
                    Response::CommandResponse(CommandResponse { result: Some(result), .. }) => {
                        results.push(result);
                    },
                    Response::Event(event) => {
                        log::debug!("qmp event: {}", event.event);
                    },
                    Response::Greeting(_) | Response::CommandResponse(_) => {},
                }
            }
            match results.len() {
                0 => continue,
                1 => return Ok(results.remove(0)),
                n => return Err(Error::Protocol(format!("expected one reply, got {}", n))),
            }
        }
    }
}

/// Parses every complete JSON object at the front of `buffer`, leaving a partial tail.
fn drain(buffer: &mut Vec<u8>) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let consumed = {
        let mut stream = serde_json::Deserializer::from_slice(&buffer[..]).into_iter::<Value>();
        loop {
            let offset = stream.byte_offset();
            match stream.next() {
                Some(Ok(value)) => values.push(value),
                Some(Err(e)) if e.is_eof() => break offset,
                Some(Err(e)) => return Err(e.into()),
                None => break stream.byte_offset(),
            }
        }
    };
    buffer.drain(..consumed);
    Ok(values)
}
