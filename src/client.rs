//! Client library
//!
//! ```no_run
//! # async fn demo() -> tris::Result<()> {
//! use tris::client::Client;
//!
//! let mut client = Client::connect("tcp://127.0.0.1:6000", "worker-1").await?;
//! let replies = client.send(&["CREATE words", "SELECT words", "ADD hello"]).await?;
//! for reply in &replies {
//!     print!("{}", reply);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TrisError};
use crate::protocol::{decode_batch, parse_request, Reply};
use crate::transport::{parse_endpoint, read_message, split_envelope, write_message};

pub struct Client {
    stream: TcpStream,
    identity: Vec<u8>,
}

impl Client {
    /// Connect to `endpoint` (`tcp://host:port`). An empty identity lets the
    /// server assign one per connection.
    pub async fn connect(endpoint: &str, identity: impl Into<Vec<u8>>) -> Result<Self> {
        let address = parse_endpoint(endpoint)?;
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        debug!(%address, "connected");
        Ok(Self { stream, identity: identity.into() })
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Send commands as one request and return one reply per command.
    pub async fn send(&mut self, commands: &[&str]) -> Result<Vec<Reply>> {
        let body = commands.join("\n");
        let expected = parse_request(body.as_bytes()).len();

        write_message(&mut self.stream, &[&self.identity, b"", body.as_bytes()]).await?;

        let parts = read_message(&mut self.stream)
            .await?
            .ok_or_else(|| TrisError::Transport("connection closed by server".to_string()))?;
        let (_, reply) = split_envelope(parts)?;
        Ok(decode_batch(&reply, expected)?)
    }

    /// End the session on the server and close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.send(&["EXIT"]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
