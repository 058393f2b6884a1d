//! Heap page format.
//!
//! A page is `page_size` bytes laid out as:
//!
//! ```text
//! +-------------------+----------+----------+-----+--------------+---------+
//! | occupancy bitmap  | slot 0   | slot 1   | ... | slot n-1     | padding |
//! | ceil(n / 8) bytes | rec_size | rec_size |     | rec_size     | zeros   |
//! +-------------------+----------+----------+-----+--------------+---------+
//! ```
//!
//! where `n = floor(page_size * 8 / (rec_size * 8 + 1))`: every slot costs
//! its record bytes plus one header bit. Bit `i % 8` of header byte `i / 8`
//! (least significant bit first) is set when slot `i` holds a record.
//! Unused slots are zero-filled, so a page image read back from disk and
//! serialized again is byte-identical.

mod codec;

use crate::{Result, StorageError};
use bytes::{BufMut, BytesMut};
use heapdb_core::{PageId, RecordId, Schema, TransactionId, Tuple};
use std::sync::Arc;

pub struct HeapPage {
    pid: PageId,
    schema: Arc<Schema>,
    page_size: usize,
    header: Vec<u8>,
    slots: Vec<Option<Tuple>>,
    dirtied_by: Option<TransactionId>,
}

impl HeapPage {
    /// Number of record slots a page of `page_size` bytes holds for `schema`.
    pub fn slots_per_page(schema: &Schema, page_size: usize) -> usize {
        (page_size * 8) / (schema.record_size() * 8 + 1)
    }

    /// Size in bytes of the occupancy bitmap for `num_slots` slots.
    pub fn header_size(num_slots: usize) -> usize {
        num_slots.div_ceil(8)
    }

    /// The image of a page with no records: all zeros.
    pub fn empty_page_data(page_size: usize) -> Vec<u8> {
        vec![0; page_size]
    }

    pub fn empty(pid: PageId, schema: Arc<Schema>, page_size: usize) -> Self {
        let num_slots = Self::slots_per_page(&schema, page_size);
        Self {
            pid,
            schema,
            page_size,
            header: vec![0; Self::header_size(num_slots)],
            slots: vec![None; num_slots],
            dirtied_by: None,
        }
    }

    /// Decodes a page image. The page size is the length of `data`.
    pub fn from_bytes(pid: PageId, data: &[u8], schema: Arc<Schema>) -> Result<Self> {
        let page_size = data.len();
        let num_slots = Self::slots_per_page(&schema, page_size);
        let header_size = Self::header_size(num_slots);
        let record_size = schema.record_size();

        let header = data[..header_size].to_vec();
        let mut slots = Vec::with_capacity(num_slots);
        for slot in 0..num_slots {
            if header[slot / 8] & (1 << (slot % 8)) == 0 {
                slots.push(None);
                continue;
            }
            let start = header_size + slot * record_size;
            let values = codec::decode_record(&data[start..start + record_size], &schema)?;
            let tuple = Tuple::new(Arc::clone(&schema), values)
                .with_record_id(RecordId::new(pid, slot));
            slots.push(Some(tuple));
        }

        Ok(Self {
            pid,
            schema,
            page_size,
            header,
            slots,
            dirtied_by: None,
        })
    }

    /// Serializes the page to exactly `page_size` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record_size = self.schema.record_size();
        let mut buf = BytesMut::with_capacity(self.page_size);
        buf.put_slice(&self.header);
        for slot in &self.slots {
            match slot {
                Some(tuple) => codec::encode_record(tuple.values(), &self.schema, &mut buf)?,
                None => buf.put_bytes(0, record_size),
            }
        }
        buf.resize(self.page_size, 0);
        Ok(buf.to_vec())
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_empty_slots(&self) -> usize {
        (0..self.num_slots())
            .filter(|&slot| !self.is_slot_used(slot))
            .count()
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        slot < self.num_slots() && self.header[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn mark_slot_used(&mut self, slot: usize, used: bool) {
        let mask = 1u8 << (slot % 8);
        if used {
            self.header[slot / 8] |= mask;
        } else {
            self.header[slot / 8] &= !mask;
        }
    }

    pub fn get_tuple(&self, slot: usize) -> Option<&Tuple> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Stores `tuple` in the lowest free slot and returns its new location.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> Result<RecordId> {
        if !tuple.schema().same_types(&self.schema) {
            return Err(StorageError::SchemaMismatch(format!(
                "tuple schema {} does not match page schema {}",
                tuple.schema(),
                self.schema
            )));
        }
        self.schema
            .validate_values(tuple.values())
            .map_err(StorageError::SchemaMismatch)?;

        let slot = (0..self.num_slots())
            .find(|&slot| !self.is_slot_used(slot))
            .ok_or_else(|| {
                StorageError::NotFound(format!("page {} has no free slot", self.pid))
            })?;

        let rid = RecordId::new(self.pid, slot);
        tuple.set_record_id(Some(rid));
        self.mark_slot_used(slot, true);
        self.slots[slot] = Some(tuple);
        Ok(rid)
    }

    /// Frees `slot`, returning the record it held.
    pub fn delete_slot(&mut self, slot: usize) -> Result<Tuple> {
        if !self.is_slot_used(slot) {
            return Err(StorageError::NotFound(format!(
                "slot {} on page {} is empty",
                slot, self.pid
            )));
        }
        self.mark_slot_used(slot, false);
        self.slots[slot]
            .take()
            .ok_or_else(|| StorageError::NotFound(format!("slot {} on page {}", slot, self.pid)))
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().flatten()
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirtied_by = tid;
    }

    /// The transaction that last modified this page, if it has not been
    /// flushed since.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirtied_by
    }
}

impl std::fmt::Debug for HeapPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapPage")
            .field("pid", &self.pid)
            .field("slots", &self.num_slots())
            .field("empty", &self.num_empty_slots())
            .field("dirtied_by", &self.dirtied_by)
            .finish()
    }
}
