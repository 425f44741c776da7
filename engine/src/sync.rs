//! Wire protocol: the two update messages replicas exchange.
//!
//! Every update buffer opens with a little-endian `u32` method tag. A state
//! reset carries the sender's clock and a full state-form snapshot; a
//! transaction carries its start clock, the sender's resolve priority, and
//! the framed events. Anything else is rejected.

use crate::codec::{self, ByteReader, ByteWriter};
use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::transaction::TransactionCache;

/// Full snapshot that replaces the receiver's state and clock.
pub const TAG_STATE_RESET: u32 = 1;
/// Incremental transaction, rebased by the receiver when concurrent.
pub const TAG_TRANSACTION: u32 = 2;

/// Encode the document's full state as a reset message. Applying it on
/// another replica replaces that replica's tree and clock wholesale.
pub fn encode_state_as_update(doc: &Doc) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u32(TAG_STATE_RESET);
    w.u32(doc.clock());
    let payload = codec::encode_value(&doc.state_value())?;
    w.bytes(&payload);
    Ok(w.into_bytes())
}

/// Apply an update buffer produced by another replica's `observe_update`
/// subscriber or by [`encode_state_as_update`].
///
/// `origin` is forwarded to this document's own update subscribers when
/// mirror mode relays the update; it never crosses the wire.
pub fn apply_update(doc: &mut Doc, bytes: &[u8], origin: Option<&str>) -> Result<()> {
    let mut r = ByteReader::new(bytes);
    match r.u32()? {
        TAG_STATE_RESET => {
            let clock = r.u32()?;
            let state = codec::decode_value(r.rest())?;
            doc.set_clock_state(clock, state)?;
            if doc.mirror() {
                let relay = encode_state_as_update(doc)?;
                doc.dispatch_update(&relay, origin);
            }
            Ok(())
        }
        TAG_TRANSACTION => {
            let (start_clock, priority, events) = TransactionCache::decode_body(&mut r)?;
            let (effective_start, applied) = doc.apply_transaction(start_clock, priority, events)?;
            if doc.mirror() {
                // Relay the rebased transaction re-stamped with this
                // document's priority, so downstream replicas tick their
                // clocks in step with this one.
                let mut cache = TransactionCache::new(None, effective_start);
                for event in applied {
                    cache.push_event(event);
                }
                let relay = cache.encode(doc.resolve_priority())?;
                doc.dispatch_update(&relay, origin);
            }
            Ok(())
        }
        other => Err(Error::UnknownMessageTag(other)),
    }
}
