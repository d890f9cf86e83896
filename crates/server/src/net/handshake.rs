//! Connection handshake
//!
//! Every fresh connection gets exactly one `OP_REQ_*` exchange: a
//! stateless device listing, or an import that hands the connection over
//! to a [`Session`]. Anything else (unknown code, wrong version, short
//! read) closes the connection without a reply.

use super::session::Session;
use crate::registry::BindingRegistry;
use crate::usb::backend::{DeviceClaim, UsbBackend};
use crate::usb::claims::{ClaimSlot, ClaimTable};
use anyhow::{Context, Result};
use common::usb_types::ClaimError;
use protocol::{OpRepDevlist, OpRepImport, OpRequest, OpStatus};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Shared state a connection handler needs
pub struct ExportContext<B: UsbBackend> {
    pub backend: Arc<B>,
    pub registry: Arc<BindingRegistry>,
    pub claims: ClaimTable,
}

impl<B: UsbBackend> Clone for ExportContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            claims: self.claims.clone(),
        }
    }
}

/// Serve one client connection from handshake to session end
pub async fn handle_connection<B, S>(stream: S, ctx: ExportContext<B>) -> Result<()>
where
    B: UsbBackend,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Malformed or unsupported requests propagate as errors here, which
    // closes the connection without a reply
    let request = protocol::read_op_request(&mut reader)
        .await
        .context("Failed to read handshake request")?;

    match request {
        OpRequest::Devlist => {
            let reply = devlist_reply(&ctx)?;
            info!("Listing {} exported device(s)", reply.devices.len());
            writer.write_all(&reply.to_bytes()?).await?;
            Ok(())
        }
        OpRequest::Import { busid } => {
            debug!("Import request for {}", busid);
            match import(&ctx, &busid) {
                Ok((claim, slot)) => {
                    let mut record = claim.snapshot().record.clone();
                    record.interfaces.clear(); // import blocks carry no interface list
                    let reply = OpRepImport::success(record);
                    writer.write_all(&reply.to_bytes()?).await?;

                    info!("Imported {} for remote client", busid);
                    Session::new(claim, slot).run(reader, writer).await
                }
                Err(status) => {
                    warn!("Import of {} refused (status {})", busid, status.code());
                    let reply = OpRepImport::error(status.code());
                    writer.write_all(&reply.to_bytes()?).await?;
                    Ok(())
                }
            }
        }
    }
}

/// Everything exported and currently present, in enumeration order
fn devlist_reply<B: UsbBackend>(ctx: &ExportContext<B>) -> Result<OpRepDevlist> {
    let devices = ctx
        .backend
        .devices()
        .context("Device enumeration failed")?
        .into_iter()
        .filter(|snapshot| ctx.registry.is_exported(snapshot.busid()))
        .map(|snapshot| snapshot.record)
        .collect();

    Ok(OpRepDevlist {
        status: OpStatus::Ok.code(),
        devices,
    })
}

/// Decide an import request and, on success, take both the claim-table
/// slot and the physical claim
///
/// The slot is acquired first and dropped automatically on any later
/// failure, so a failed import can never leave the bus id reserved.
fn import<B: UsbBackend>(
    ctx: &ExportContext<B>,
    busid: &str,
) -> std::result::Result<(B::Claim, ClaimSlot), OpStatus> {
    if !ctx.registry.is_exported(busid) {
        return Err(OpStatus::Unavailable);
    }

    let Some(slot) = ctx.claims.acquire(busid) else {
        return Err(OpStatus::DeviceBusy);
    };

    match ctx.backend.claim(busid) {
        Ok(claim) => Ok((claim, slot)),
        Err(ClaimError::NotFound(_)) => Err(OpStatus::NoDevice),
        Err(ClaimError::AlreadyClaimed(_)) => Err(OpStatus::DeviceBusy),
        Err(ClaimError::PermissionDenied(_)) => Err(OpStatus::DeviceError),
        Err(ClaimError::Other(reason)) => {
            warn!("Claim of {} failed: {}", busid, reason);
            Err(OpStatus::Error)
        }
    }
}
