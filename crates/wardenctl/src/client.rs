//! Line-framed JSON client for the agent protocol.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use warden_common::{Method, Request, Response, ResponseData};

pub struct AgentClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    token: Option<String>,
    next_id: u64,
}

impl AgentClient {
    pub async fn connect(addr: &str, token: Option<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to agent at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self { reader: BufReader::new(read_half), writer: write_half, token, next_id: 0 })
    }

    /// Send one request frame. `with_token` is false only for follow-up
    /// frames of an established shell session.
    pub async fn send(&mut self, method: Method, with_token: bool) -> Result<u64> {
        self.next_id += 1;
        let request = Request {
            id: self.next_id,
            token: if with_token { self.token.clone() } else { None },
            method,
        };
        let mut frame = serde_json::to_string(&request)?;
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await.context("failed to send request")?;
        Ok(self.next_id)
    }

    /// Read one response frame. `None` means the agent closed the
    /// connection.
    pub async fn recv(&mut self) -> Result<Option<Response>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.context("failed to read response")?;
        if read == 0 {
            return Ok(None);
        }
        let response = serde_json::from_str(line.trim()).context("invalid response frame")?;
        Ok(Some(response))
    }

    /// Unary call: send, read one frame, surface agent errors.
    pub async fn request(&mut self, method: Method) -> Result<ResponseData> {
        self.send(method, true).await?;
        let Some(response) = self.recv().await? else {
            bail!("agent closed the connection");
        };
        match response.result {
            Ok(data) => Ok(data),
            Err(e) => bail!("{e}"),
        }
    }

    /// Next frame of a streaming call, already unwrapped.
    pub async fn next_stream_frame(&mut self) -> Result<Option<ResponseData>> {
        let Some(response) = self.recv().await? else {
            return Ok(None);
        };
        match response.result {
            Ok(ResponseData::StreamEnd) => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(e) => bail!("{e}"),
        }
    }

    /// Split into independently-owned halves so a duplex session can send
    /// and receive concurrently.
    pub fn into_parts(self) -> (ClientReader, ClientWriter) {
        (
            ClientReader { reader: self.reader },
            ClientWriter { writer: self.writer, token: self.token, next_id: self.next_id },
        )
    }
}

pub struct ClientReader {
    reader: BufReader<OwnedReadHalf>,
}

impl ClientReader {
    pub async fn recv(&mut self) -> Result<Option<Response>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.context("failed to read response")?;
        if read == 0 {
            return Ok(None);
        }
        let response = serde_json::from_str(line.trim()).context("invalid response frame")?;
        Ok(Some(response))
    }
}

pub struct ClientWriter {
    writer: OwnedWriteHalf,
    token: Option<String>,
    next_id: u64,
}

impl ClientWriter {
    pub async fn send(&mut self, method: Method, with_token: bool) -> Result<u64> {
        self.next_id += 1;
        let request = Request {
            id: self.next_id,
            token: if with_token { self.token.clone() } else { None },
            method,
        };
        let mut frame = serde_json::to_string(&request)?;
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await.context("failed to send request")?;
        Ok(self.next_id)
    }
}
