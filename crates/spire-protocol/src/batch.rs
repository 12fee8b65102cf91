//! The batch-index field: many single-record reads packed into one
//! request.
//!
//! The field data is a `u32` row count, a `u8` allow-inline flag, then one
//! row per key: `u32` index, 20-byte digest and a `u8` repeat flag. A
//! repeat row reuses the namespace, set and bins of the row before it.
//! Any other row continues with `u8` info1, `u16` field count, `u16` op
//! count, the namespace (and set) fields and one read op per bin, laid
//! out like the fields and ops of a record message.
//!
//! The server answers with one message per row, carrying the row's index
//! in the transaction TTL slot and its digest as a field, and ends the
//! stream with a last-message marker.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::header::{read_u16, read_u32, INFO1_GET_ALL, INFO1_READ};
use crate::message::{
    Field, FIELD_BATCH_INDEX, FIELD_BATCH_INDEX_WITH_SET, FIELD_NAMESPACE, FIELD_SET, OP_READ,
};

pub const BATCH_DIGEST_SIZE: usize = 20;

/// One key of a batch read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    /// Position of the key in the caller's batch, echoed in the response.
    pub index: u32,
    pub digest: [u8; BATCH_DIGEST_SIZE],
    pub namespace: String,
    /// Empty when the key has no set.
    pub set: String,
    /// Bins to read; empty reads all of them.
    pub bins: Vec<String>,
}

impl BatchRow {
    fn repeats(&self, prev: &BatchRow) -> bool {
        self.namespace == prev.namespace && self.set == prev.set && self.bins == prev.bins
    }
}

/// Packs `rows` into a batch-index field.
pub fn encode_rows(rows: &[BatchRow]) -> Result<Field, ProtocolError> {
    let count = u32::try_from(rows.len())
        .map_err(|_| ProtocolError::InvalidParticle("too many batch rows".into()))?;
    let mut data = BytesMut::new();
    data.put_u32(count);
    data.put_u8(1);

    let mut prev: Option<&BatchRow> = None;
    for row in rows {
        data.put_u32(row.index);
        data.extend_from_slice(&row.digest);
        if prev.is_some_and(|p| row.repeats(p)) {
            data.put_u8(1);
        } else {
            data.put_u8(0);
            write_row_body(row, &mut data)?;
        }
        prev = Some(row);
    }

    let kind = if rows.iter().any(|r| !r.set.is_empty()) {
        FIELD_BATCH_INDEX_WITH_SET
    } else {
        FIELD_BATCH_INDEX
    };
    Ok(Field::new(kind, data.freeze()))
}

fn write_row_body(row: &BatchRow, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut info1 = INFO1_READ;
    if row.bins.is_empty() {
        info1 |= INFO1_GET_ALL;
    }
    let n_ops = u16::try_from(row.bins.len())
        .map_err(|_| ProtocolError::InvalidParticle("too many bins in batch row".into()))?;
    let has_set = !row.set.is_empty();

    out.put_u8(info1);
    out.put_u16(if has_set { 2 } else { 1 });
    out.put_u16(n_ops);
    put_field(out, FIELD_NAMESPACE, row.namespace.as_bytes());
    if has_set {
        put_field(out, FIELD_SET, row.set.as_bytes());
    }
    for bin in &row.bins {
        let name_len = u8::try_from(bin.len())
            .map_err(|_| ProtocolError::InvalidParticle(format!("bin name too long: {bin}")))?;
        out.put_u32(4 + u32::from(name_len));
        out.put_u8(OP_READ);
        out.put_u8(0);
        out.put_u8(0);
        out.put_u8(name_len);
        out.extend_from_slice(bin.as_bytes());
    }
    Ok(())
}

fn put_field(out: &mut BytesMut, kind: u8, data: &[u8]) {
    out.put_u32(data.len() as u32 + 1);
    out.put_u8(kind);
    out.extend_from_slice(data);
}

/// Unpacks the rows of a batch-index field, expanding repeat rows.
pub fn decode_rows(field: &Field) -> Result<Vec<BatchRow>, ProtocolError> {
    if field.kind != FIELD_BATCH_INDEX && field.kind != FIELD_BATCH_INDEX_WITH_SET {
        return Err(ProtocolError::InvalidParticle(format!(
            "field {} is not a batch index",
            field.kind
        )));
    }
    let mut cur = Cursor {
        buf: &field.data,
        pos: 0,
    };
    let count = read_u32(cur.take(4, "batch count")?) as usize;
    cur.take(1, "batch flags")?;

    let mut rows: Vec<BatchRow> = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let index = read_u32(cur.take(4, "batch index")?);
        let mut digest = [0u8; BATCH_DIGEST_SIZE];
        digest.copy_from_slice(cur.take(BATCH_DIGEST_SIZE, "batch digest")?);
        let repeat = cur.take(1, "batch repeat")?[0] != 0;

        let row = if repeat {
            let prev = rows.last().ok_or(ProtocolError::Truncated {
                what: "batch repeat without a previous row",
                offset: cur.pos,
            })?;
            BatchRow {
                index,
                digest,
                ..prev.clone()
            }
        } else {
            let mut row = BatchRow {
                index,
                digest,
                namespace: String::new(),
                set: String::new(),
                bins: Vec::new(),
            };
            read_row_body(&mut cur, &mut row)?;
            row
        };
        rows.push(row);
    }
    Ok(rows)
}

fn read_row_body(cur: &mut Cursor<'_>, row: &mut BatchRow) -> Result<(), ProtocolError> {
    cur.take(1, "batch info1")?;
    let n_fields = read_u16(cur.take(2, "batch field count")?);
    let n_ops = read_u16(cur.take(2, "batch op count")?);

    for _ in 0..n_fields {
        let size = read_u32(cur.take(4, "batch field")?) as usize;
        if size == 0 {
            return Err(ProtocolError::Truncated {
                what: "batch field",
                offset: cur.pos,
            });
        }
        let kind = cur.take(1, "batch field")?[0];
        let data = utf8(cur.take(size - 1, "batch field")?)?;
        match kind {
            FIELD_NAMESPACE => row.namespace = data,
            FIELD_SET => row.set = data,
            _ => {}
        }
    }
    for _ in 0..n_ops {
        let size = read_u32(cur.take(4, "batch op")?) as usize;
        let header = cur.take(4, "batch op")?;
        let name_len = header[3] as usize;
        if size < 4 + name_len {
            return Err(ProtocolError::Truncated {
                what: "batch op",
                offset: cur.pos,
            });
        }
        row.bins.push(utf8(cur.take(name_len, "batch bin name")?)?);
        cur.take(size - 4 - name_len, "batch op value")?;
    }
    Ok(())
}

fn utf8(raw: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| ProtocolError::InvalidParticle(format!("batch row: {e}")))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated {
                what,
                offset: self.pos,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}
