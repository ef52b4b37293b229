//! Session opening: request type, authorization token, compression flag.

use std::io;
use std::sync::Arc;

use failover_store::{Inventory, ReceiveGrant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::wire::{expect_reply, read_bool, read_str, write_bool, write_control, write_error, write_str};
use crate::protocol::{ControlCode, RequestType};
use crate::utils::errors::{AgentError, Result};

/// What an accepted session is allowed to do.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub grant: ReceiveGrant,
    pub compress: bool,
}

pub async fn client_handshake<R, W>(reader: &mut R, writer: &mut W, token: &str, compress: bool) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u8(RequestType::FailoverReplication.to_byte()).await?;
    write_str(writer, token).await?;
    write_bool(writer, compress).await?;
    writer.flush().await?;
    expect_reply(reader, ControlCode::Proceed).await
}

/// Accept or refuse a session. A peer that closes before sending anything yields `Ok(None)`.
pub async fn server_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    inventory: Arc<dyn Inventory>,
) -> Result<Option<SessionGrant>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let first = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let result = authorize_request(reader, first, inventory).await;
    match result {
        Ok(session) => {
            write_control(writer, ControlCode::Proceed).await?;
            writer.flush().await?;
            Ok(Some(session))
        }
        Err(e) => {
            if let Err(report) = write_error(writer, &e).await {
                debug!(error = %report, "Could not report handshake failure to client");
            }
            Err(e)
        }
    }
}

async fn authorize_request<R>(reader: &mut R, first: u8, inventory: Arc<dyn Inventory>) -> Result<SessionGrant>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match RequestType::from_byte(first)? {
        RequestType::FailoverReplication => {}
    }
    let token = read_str(reader).await?;
    let compress = read_bool(reader).await?;

    let grant = tokio::task::spawn_blocking(move || inventory.authorize(&token)).await??;
    match grant {
        Some(grant) => Ok(SessionGrant { grant, compress }),
        None => Err(AgentError::Unauthorized("token is unknown, expired or revoked".into())),
    }
}
