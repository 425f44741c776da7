//! Transactions: the unit of atomicity on the wire.
//!
//! A [`TransactionCache`] accumulates the events produced between the start
//! and end of a transaction. On commit it serializes to one update message:
//!
//! ```text
//! [u32 tag = TRANSACTION]
//! [u32 startClock][u32 resolvePriority][u32 eventCount]
//! { [u32 recordLen][event record][pad4] }*
//! ```
//!
//! `startClock` is the producing document's clock when the transaction began;
//! it is the logical timestamp a receiver's rebase compares against. The
//! resolve priority is stamped at serialization time from the producing
//! document. The caller-side `origin` tag never crosses the wire: receivers
//! get whatever origin their transport passes to `apply_update`.

use crate::codec::{ByteReader, ByteWriter};
use crate::error::Result;
use crate::event::Event;
use crate::sync::TAG_TRANSACTION;
use crate::{Clock, Priority};

/// Events of one in-flight transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCache {
    /// Caller-supplied tag used to prevent echo loops; local only.
    pub origin: Option<String>,
    /// Document clock when the transaction began.
    pub start_clock: Clock,
    /// Events in the order produced.
    pub events: Vec<Event>,
}

impl TransactionCache {
    pub fn new(origin: Option<String>, start_clock: Clock) -> Self {
        Self {
            origin,
            start_clock,
            events: Vec::new(),
        }
    }

    /// Append an event. Events keep the order mutations were issued.
    pub fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize the whole transaction message, stamping `priority`.
    pub fn encode(&self, priority: Priority) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        w.u32(TAG_TRANSACTION);
        w.u32(self.start_clock);
        w.u32(priority);
        w.u32(self.events.len() as u32);
        for event in &self.events {
            let record = event.encode()?;
            w.u32(record.len() as u32);
            w.bytes(&record);
            w.pad4();
        }
        Ok(w.into_bytes())
    }

    /// Read the message body following the `TRANSACTION` tag.
    pub(crate) fn decode_body(r: &mut ByteReader<'_>) -> Result<(Clock, Priority, Vec<Event>)> {
        let start_clock = r.u32()?;
        let priority = r.u32()?;
        let count = r.u32()? as usize;
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let record_len = r.u32()? as usize;
            let record = r.bytes(record_len)?;
            r.pad4()?;
            events.push(Event::decode(record)?);
        }
        Ok((start_clock, priority, events))
    }
}
