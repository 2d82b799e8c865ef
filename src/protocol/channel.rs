//! The protected write side shared by client connections and server associations.
//!
//! Every outgoing fragment is protected and written while the writer lock is
//! held. That keeps the send sequence number in wire order and keeps the
//! fragments of one call together. The receive side has a single reader, so
//! unprotecting happens in arrival order without further coordination.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

use crate::core::codec::PduCodec;
use crate::core::fragment::{fragment_flags, split_body, stub_capacity};
use crate::core::pdu::{AuthTrailer, Pdu, PduBody, PduHeader};
use crate::core::syntax::DataRepresentation;
use crate::error::{constants, ProtocolError, Result};
use crate::security::{AuthLevel, SecurityContext};
use crate::transport::BoxedStream;
use crate::utils::metrics::global_metrics;

pub(crate) type PduReader = FramedRead<ReadHalf<BoxedStream>, PduCodec>;
pub(crate) type PduWriter = FramedWrite<WriteHalf<BoxedStream>, PduCodec>;

/// Split a stream into a fragment reader and writer.
pub(crate) fn split(stream: BoxedStream, max_recv_frag: u16, max_xmit_frag: u16) -> (PduReader, PduWriter) {
    let (rd, wr) = tokio::io::split(stream);
    (
        FramedRead::new(rd, PduCodec::new(max_recv_frag)),
        FramedWrite::new(wr, PduCodec::new(max_xmit_frag)),
    )
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

/// Writer, security context and negotiated send limits of one connection.
pub(crate) struct Channel {
    writer: tokio::sync::Mutex<PduWriter>,
    security: Mutex<Option<SecurityContext>>,
    /// Header label as little-endian bytes; servers switch to the client's.
    drep: AtomicU32,
    max_xmit_frag: AtomicU16,
}

impl Channel {
    pub fn new(writer: PduWriter, drep: DataRepresentation, max_xmit_frag: u16) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            security: Mutex::new(None),
            drep: AtomicU32::new(u32::from_le_bytes(drep.0)),
            max_xmit_frag: AtomicU16::new(max_xmit_frag),
        }
    }

    pub fn drep(&self) -> DataRepresentation {
        DataRepresentation(self.drep.load(Ordering::Relaxed).to_le_bytes())
    }

    pub fn set_drep(&self, drep: DataRepresentation) {
        self.drep.store(u32::from_le_bytes(drep.0), Ordering::Relaxed);
    }

    pub fn max_xmit_frag(&self) -> u16 {
        self.max_xmit_frag.load(Ordering::Relaxed)
    }

    pub fn set_max_xmit_frag(&self, max_xmit_frag: u16) {
        self.max_xmit_frag.store(max_xmit_frag, Ordering::Relaxed);
    }

    pub fn install_security(&self, ctx: SecurityContext) -> Result<()> {
        *lock(&self.security)? = Some(ctx);
        Ok(())
    }

    /// Drop the security context; its key material goes with it.
    pub fn clear_security(&self) {
        if let Ok(mut guard) = self.security.lock() {
            guard.take();
        }
    }

    /// Run `f` against the security context, if there is one.
    pub fn with_security<R>(&self, f: impl FnOnce(Option<&mut SecurityContext>) -> R) -> Result<R> {
        let mut guard = lock(&self.security)?;
        Ok(f(guard.as_mut()))
    }

    /// Negotiated level and mechanism name; `AuthLevel::None` when unauthenticated.
    pub fn security_info(&self) -> (AuthLevel, Option<&'static str>) {
        match self.security.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(ctx) => (ctx.level(), Some(ctx.mechanism_name())),
                None => (AuthLevel::None, None),
            },
            Err(_) => (AuthLevel::None, None),
        }
    }

    /// Placeholder trailer and verifier length once the context protects PDUs.
    fn protection(&self) -> Result<Option<(AuthTrailer, usize)>> {
        let guard = lock(&self.security)?;
        Ok(guard
            .as_ref()
            .filter(|ctx| ctx.is_established())
            .and_then(|ctx| ctx.placeholder_trailer().map(|t| (t, ctx.verifier_len()))))
    }

    fn protect(&self, frag: &mut BytesMut) -> Result<()> {
        let mut guard = lock(&self.security)?;
        match guard.as_mut() {
            Some(ctx) if ctx.is_established() => ctx.protect(frag),
            _ => Ok(()),
        }
    }

    /// Verify or unseal a received fragment in place.
    pub fn unprotect(&self, frag: &mut BytesMut) -> Result<()> {
        let mut guard = lock(&self.security)?;
        match guard.as_mut() {
            Some(ctx) if ctx.is_established() => ctx.unprotect(frag),
            _ => Ok(()),
        }
    }

    /// Write one unfragmented PDU.
    pub async fn send_pdu(&self, mut pdu: Pdu) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if matches!(pdu.body, PduBody::Fault(_)) {
            if let Some((trailer, _)) = self.protection()? {
                pdu.auth = Some(trailer);
            }
        }
        let mut frag = pdu.encode()?;
        self.protect(&mut frag)?;
        self.write(&mut writer, frag.freeze()).await
    }

    /// Fragment `stub` and write every fragment back to back.
    ///
    /// `body` builds the PDU body for one chunk from the allocation hint
    /// (bytes remaining, this chunk included) and the chunk itself.
    pub async fn send_stub<F>(&self, call_id: u32, stub: Bytes, prefix: usize, body: F) -> Result<()>
    where
        F: Fn(u32, Bytes) -> PduBody,
    {
        let mut writer = self.writer.lock().await;
        let protection = self.protection()?;
        let capacity = stub_capacity(
            self.max_xmit_frag(),
            prefix,
            protection.as_ref().map(|(_, len)| *len),
        );
        let drep = self.drep();
        let chunks = split_body(&stub, capacity);
        let total = chunks.len();
        let mut remaining = stub.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let alloc_hint = u32::try_from(remaining).unwrap_or(u32::MAX);
            remaining -= chunk.len();
            let mut pdu = Pdu::new(call_id, drep, body(alloc_hint, chunk))
                .with_flags(fragment_flags(index, total));
            if let Some((trailer, _)) = &protection {
                pdu = pdu.with_auth(trailer.clone());
            }
            let mut frag = pdu.encode()?;
            self.protect(&mut frag)?;
            trace!(call_id, index, total, len = frag.len(), "Sending fragment");
            self.write(&mut writer, frag.freeze()).await?;
        }
        Ok(())
    }

    async fn write(&self, writer: &mut PduWriter, frag: Bytes) -> Result<()> {
        let len = frag.len() as u64;
        writer.send(frag).await?;
        global_metrics().fragment_sent(len);
        Ok(())
    }

    /// Flush and shut down the write half.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = SinkExt::<Bytes>::close(&mut *writer).await;
    }
}

/// Call id of a fragment whose body failed to parse, when the header is intact.
pub(crate) fn header_call_id(frag: &[u8]) -> Option<u32> {
    PduHeader::parse(frag).ok().map(|h| h.call_id)
}
