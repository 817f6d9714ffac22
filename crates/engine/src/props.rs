//! Property value encoding and chain manipulation.
//!
//! Scalars and short strings live inline in the property record's payload
//! field; long strings spill to the string dynamic store, arrays always to
//! the array dynamic store. Freed chains are staged as deletions so the
//! blocks return to their free-lists at commit.

use crate::workspace::TxWorkspace;
use crate::write_path::WritePath;
use trellis_core::{IdKind, PropertyValue, Result, TrellisError, NIL};
use trellis_store::{DynamicRecord, DynamicStoreKind, GraphStore, PropertyPayload, PropertyRecord};

/// Encode a value, allocating dynamic blocks through `path` as needed.
///
/// Newly allocated ids are pushed onto `allocated` so a rollback can
/// return them.
pub fn encode_value(
    ws: &mut TxWorkspace,
    store: &GraphStore,
    path: &dyn WritePath,
    allocated: &mut Vec<(IdKind, u64)>,
    value: &PropertyValue,
) -> Result<(u8, PropertyPayload)> {
    let tag = value.type_tag();
    let payload = match value {
        PropertyValue::Bool(v) => PropertyPayload::Inline {
            bits: *v as u64,
            len: 0,
        },
        PropertyValue::Long(v) => PropertyPayload::Inline {
            bits: *v as u64,
            len: 0,
        },
        PropertyValue::Double(v) => PropertyPayload::Inline {
            bits: v.to_bits(),
            len: 0,
        },
        PropertyValue::String(s) if s.len() <= 8 => {
            let mut bytes = [0u8; 8];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            PropertyPayload::Inline {
                bits: u64::from_le_bytes(bytes),
                len: s.len() as u8,
            }
        }
        PropertyValue::String(s) => PropertyPayload::Dynamic {
            first_block: write_chain(
                ws,
                store,
                path,
                allocated,
                DynamicStoreKind::Strings,
                s.as_bytes(),
            )?,
        },
        PropertyValue::LongArray(values) => {
            let bytes =
                bincode::serialize(values).map_err(TrellisError::serialization)?;
            PropertyPayload::Dynamic {
                first_block: write_chain(
                    ws,
                    store,
                    path,
                    allocated,
                    DynamicStoreKind::Arrays,
                    &bytes,
                )?,
            }
        }
        PropertyValue::StringArray(values) => {
            let bytes =
                bincode::serialize(values).map_err(TrellisError::serialization)?;
            PropertyPayload::Dynamic {
                first_block: write_chain(
                    ws,
                    store,
                    path,
                    allocated,
                    DynamicStoreKind::Arrays,
                    &bytes,
                )?,
            }
        }
    };
    Ok((tag, payload))
}

/// Decode a property record back into its value.
pub fn decode_value(
    ws: &TxWorkspace,
    store: &GraphStore,
    record: &PropertyRecord,
) -> Result<PropertyValue> {
    let value = match (record.type_tag, record.payload) {
        (1, PropertyPayload::Inline { bits, .. }) => PropertyValue::Bool(bits != 0),
        (2, PropertyPayload::Inline { bits, .. }) => PropertyValue::Long(bits as i64),
        (3, PropertyPayload::Inline { bits, .. }) => PropertyValue::Double(f64::from_bits(bits)),
        (4, PropertyPayload::Inline { bits, len }) => {
            let bytes = bits.to_le_bytes();
            let s = std::str::from_utf8(&bytes[..len as usize])
                .map_err(|_| TrellisError::Corruption("inline string is not UTF-8".into()))?;
            PropertyValue::String(s.to_string())
        }
        (4, PropertyPayload::Dynamic { first_block }) => {
            let bytes = ws.read_dynamic_chain(store, DynamicStoreKind::Strings, first_block)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| TrellisError::Corruption("spilled string is not UTF-8".into()))?;
            PropertyValue::String(s)
        }
        (5, PropertyPayload::Dynamic { first_block }) => {
            let bytes = ws.read_dynamic_chain(store, DynamicStoreKind::Arrays, first_block)?;
            PropertyValue::LongArray(
                bincode::deserialize(&bytes).map_err(TrellisError::serialization)?,
            )
        }
        (6, PropertyPayload::Dynamic { first_block }) => {
            let bytes = ws.read_dynamic_chain(store, DynamicStoreKind::Arrays, first_block)?;
            PropertyValue::StringArray(
                bincode::deserialize(&bytes).map_err(TrellisError::serialization)?,
            )
        }
        (tag, _) => {
            return Err(TrellisError::Corruption(format!(
                "property record has malformed type tag {}",
                tag
            )))
        }
    };
    Ok(value)
}

/// Stage a new dynamic chain holding `bytes`; returns the head block.
pub(crate) fn write_chain(
    ws: &mut TxWorkspace,
    store: &GraphStore,
    path: &dyn WritePath,
    allocated: &mut Vec<(IdKind, u64)>,
    kind: DynamicStoreKind,
    bytes: &[u8],
) -> Result<u64> {
    let id_kind = match kind {
        DynamicStoreKind::Strings => IdKind::PropertyString,
        DynamicStoreKind::Arrays => IdKind::PropertyArray,
    };
    let mut ids = Vec::with_capacity(DynamicRecord::blocks_for(bytes.len()));
    for _ in 0..DynamicRecord::blocks_for(bytes.len()) {
        let id = path.next_id(id_kind)?;
        allocated.push((id_kind, id));
        ids.push(id);
    }
    for (id, record) in DynamicRecord::chain_from_bytes(bytes, &ids) {
        *ws.dynamic_mut(store, kind, id)? = record;
    }
    Ok(ids[0])
}

/// Stage the deletion of every block in a chain.
pub fn free_chain(
    ws: &mut TxWorkspace,
    store: &GraphStore,
    kind: DynamicStoreKind,
    first_block: u64,
) -> Result<()> {
    let mut block = first_block;
    while block != NIL {
        let record = ws.dynamic_mut(store, kind, block)?;
        let next = record.next_block;
        *record = DynamicRecord::empty();
        block = next;
    }
    Ok(())
}

/// Stage the deletion of a property's spilled value, if it has one.
pub fn free_value(
    ws: &mut TxWorkspace,
    store: &GraphStore,
    record: &PropertyRecord,
) -> Result<()> {
    if let PropertyPayload::Dynamic { first_block } = record.payload {
        let kind = if record.type_tag == 4 {
            DynamicStoreKind::Strings
        } else {
            DynamicStoreKind::Arrays
        };
        free_chain(ws, store, kind, first_block)?;
    }
    Ok(())
}

/// Walk a property chain looking for `key_id`.
pub fn find_property(
    first_prop: u64,
    key_id: u32,
    mut get: impl FnMut(u64) -> Result<PropertyRecord>,
) -> Result<Option<(u64, PropertyRecord)>> {
    let mut id = first_prop;
    while id != NIL {
        let record = get(id)?;
        if record.in_use && record.key_id == key_id {
            return Ok(Some((id, record)));
        }
        id = record.next_prop;
    }
    Ok(None)
}

/// Collect every `(id, record)` in a property chain.
pub fn collect_properties(
    first_prop: u64,
    mut get: impl FnMut(u64) -> Result<PropertyRecord>,
) -> Result<Vec<(u64, PropertyRecord)>> {
    let mut out = Vec::new();
    let mut id = first_prop;
    while id != NIL {
        let record = get(id)?;
        let next = record.next_prop;
        out.push((id, record));
        id = next;
    }
    Ok(out)
}
