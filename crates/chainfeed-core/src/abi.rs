//! Runtime ABI event decoding.
//!
//! Sources are configured with a standard JSON ABI. At startup the event
//! entries are parsed into [`EventSchema`]s; at decode time topics and data
//! are turned into named JSON arguments via `alloy-dyn-abi`.
//!
//! Argument normalization: `address` → lowercase hex, `uintN`/`intN` →
//! decimal string, `bytesN`/`bytes` → hex string, `bool`, `string`,
//! tuples → nested records, arrays → ordered sequences.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::keccak256;
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::types::CachedLog;

// ─── ParamKind ───────────────────────────────────────────────────────────────

/// An ABI parameter type, as far as event decoding needs to know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Uint(u16),
    Int(u16),
    Bool,
    Address,
    /// `bytes1`..`bytes32`
    FixedBytes(u8),
    Bytes,
    Str,
    /// `T[]`
    Vec(Box<ParamKind>),
    /// `T[N]`
    Array(Box<ParamKind>, usize),
    /// Named components, from the ABI `components` array.
    Tuple(Vec<(String, ParamKind)>),
}

impl ParamKind {
    /// Parse an ABI `type` string (plus `components` for tuples).
    pub fn parse(ty: &str, components: &[AbiInput]) -> Result<Self, EngineError> {
        // Arrays bind tighter from the right: uint8[4][] is a vec of arrays.
        if let Some(base) = ty.strip_suffix("[]") {
            return Ok(Self::Vec(Box::new(Self::parse(base, components)?)));
        }
        if let Some(open) = ty.rfind('[') {
            if ty.ends_with(']') {
                let len: usize = ty[open + 1..ty.len() - 1]
                    .parse()
                    .map_err(|_| EngineError::Config(format!("bad array type `{ty}`")))?;
                return Ok(Self::Array(Box::new(Self::parse(&ty[..open], components)?), len));
            }
        }

        match ty {
            "address" => Ok(Self::Address),
            "bool" => Ok(Self::Bool),
            "string" => Ok(Self::Str),
            "bytes" => Ok(Self::Bytes),
            "tuple" => {
                let fields = components
                    .iter()
                    .map(|c| Ok((c.name.clone(), Self::parse(&c.ty, &c.components)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                Ok(Self::Tuple(fields))
            }
            _ => {
                if let Some(bits) = ty.strip_prefix("uint") {
                    let bits: u16 = if bits.is_empty() { 256 } else { parse_bits(ty, bits)? };
                    return Ok(Self::Uint(bits));
                }
                if let Some(bits) = ty.strip_prefix("int") {
                    let bits: u16 = if bits.is_empty() { 256 } else { parse_bits(ty, bits)? };
                    return Ok(Self::Int(bits));
                }
                if let Some(n) = ty.strip_prefix("bytes") {
                    let n: u8 = n
                        .parse()
                        .map_err(|_| EngineError::Config(format!("bad type `{ty}`")))?;
                    if n == 0 || n > 32 {
                        return Err(EngineError::Config(format!("bad type `{ty}`")));
                    }
                    return Ok(Self::FixedBytes(n));
                }
                Err(EngineError::Config(format!("unsupported ABI type `{ty}`")))
            }
        }
    }

    /// The canonical Solidity name, as used in event signatures.
    pub fn sol_name(&self) -> String {
        match self {
            Self::Uint(bits) => format!("uint{bits}"),
            Self::Int(bits) => format!("int{bits}"),
            Self::Bool => "bool".into(),
            Self::Address => "address".into(),
            Self::FixedBytes(n) => format!("bytes{n}"),
            Self::Bytes => "bytes".into(),
            Self::Str => "string".into(),
            Self::Vec(elem) => format!("{}[]", elem.sol_name()),
            Self::Array(elem, len) => format!("{}[{len}]", elem.sol_name()),
            Self::Tuple(fields) => {
                let inner: Vec<String> = fields.iter().map(|(_, k)| k.sol_name()).collect();
                format!("({})", inner.join(","))
            }
        }
    }

    /// Build the alloy `DynSolType` for this kind.
    pub fn to_dyn(&self) -> DynSolType {
        match self {
            Self::Uint(bits) => DynSolType::Uint(*bits as usize),
            Self::Int(bits) => DynSolType::Int(*bits as usize),
            Self::Bool => DynSolType::Bool,
            Self::Address => DynSolType::Address,
            Self::FixedBytes(n) => DynSolType::FixedBytes(*n as usize),
            Self::Bytes => DynSolType::Bytes,
            Self::Str => DynSolType::String,
            Self::Vec(elem) => DynSolType::Array(Box::new(elem.to_dyn())),
            Self::Array(elem, len) => DynSolType::FixedArray(Box::new(elem.to_dyn()), *len),
            Self::Tuple(fields) => {
                DynSolType::Tuple(fields.iter().map(|(_, k)| k.to_dyn()).collect())
            }
        }
    }

    /// Dynamic types occupy an offset word in the data head and hash their
    /// contents when indexed.
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes | Self::Str | Self::Vec(_) => true,
            Self::Array(elem, _) => elem.is_dynamic(),
            Self::Tuple(fields) => fields.iter().any(|(_, k)| k.is_dynamic()),
            _ => false,
        }
    }
}

fn parse_bits(ty: &str, bits: &str) -> Result<u16, EngineError> {
    let bits: u16 = bits
        .parse()
        .map_err(|_| EngineError::Config(format!("bad type `{ty}`")))?;
    if bits == 0 || bits > 256 || bits % 8 != 0 {
        return Err(EngineError::Config(format!("bad type `{ty}`")));
    }
    Ok(bits)
}

// ─── Child location (factory sources) ────────────────────────────────────────

/// Where a factory's child address lives within the creation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLocation {
    /// An indexed parameter: `topics[n]`, n in 1..=3.
    Topic(usize),
    /// Byte offset of the 20 address bytes within the non-indexed data
    /// (word offset × 32 + 12, so the address is `data[off..off+20]`).
    DataOffset(usize),
}

// ─── Event schema ────────────────────────────────────────────────────────────

/// One input of an event.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub name: String,
    pub kind: ParamKind,
    pub indexed: bool,
}

/// A single parsed event definition.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub name: String,
    pub inputs: Vec<EventInput>,
}

impl EventSchema {
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> String {
        let types: Vec<String> = self.inputs.iter().map(|i| i.kind.sol_name()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// `topics[0]` value for this event: `0x` + keccak256 of the signature.
    pub fn selector(&self) -> String {
        format!("0x{}", hex::encode(keccak256(self.signature().as_bytes())))
    }

    fn indexed_inputs(&self) -> impl Iterator<Item = &EventInput> {
        self.inputs.iter().filter(|i| i.indexed)
    }

    fn data_inputs(&self) -> Vec<&EventInput> {
        self.inputs.iter().filter(|i| !i.indexed).collect()
    }

    /// Decode a log's topics and data into named JSON arguments.
    pub fn decode(&self, log: &CachedLog) -> Result<Value, EngineError> {
        let mut args = serde_json::Map::new();

        // Indexed inputs: one 32-byte topic each, starting at topics[1].
        for (i, input) in self.indexed_inputs().enumerate() {
            let topic = log.topics.get(i + 1).ok_or_else(|| {
                EngineError::Decode(format!(
                    "{}: missing topic {} for `{}`",
                    self.name,
                    i + 1,
                    input.name
                ))
            })?;
            args.insert(input.name.clone(), decode_topic(topic, &input.kind)?);
        }

        // Non-indexed inputs: ABI-encoded sequence in the data payload.
        let data_inputs = self.data_inputs();
        if !data_inputs.is_empty() {
            let raw = decode_hex(&log.data)?;
            let tuple = DynSolType::Tuple(data_inputs.iter().map(|i| i.kind.to_dyn()).collect());
            let decoded = tuple.abi_decode_sequence(&raw).map_err(|e| {
                EngineError::Decode(format!("{}: data decode failed: {e}", self.name))
            })?;
            let values = match decoded {
                DynSolValue::Tuple(vals) => vals,
                other => vec![other],
            };
            if values.len() != data_inputs.len() {
                return Err(EngineError::Decode(format!(
                    "{}: expected {} data fields, decoded {}",
                    self.name,
                    data_inputs.len(),
                    values.len()
                )));
            }
            for (input, value) in data_inputs.iter().zip(values) {
                args.insert(input.name.clone(), normalize(value, &input.kind));
            }
        }

        Ok(Value::Object(args))
    }

    /// Resolve where a parameter (the factory child address) is located.
    ///
    /// Indexed parameters map to their topic slot; non-indexed parameters
    /// map to a byte offset past the preceding inputs' head words. A
    /// dynamic parameter cannot hold an address and is a config error.
    pub fn child_location(&self, parameter: &str) -> Result<ChildLocation, EngineError> {
        if let Some(pos) = self
            .indexed_inputs()
            .position(|i| i.name == parameter)
        {
            return Ok(ChildLocation::Topic(pos + 1));
        }

        let mut offset = 0usize;
        for input in self.data_inputs() {
            if input.name == parameter {
                if input.kind.is_dynamic() {
                    return Err(EngineError::Config(format!(
                        "factory parameter `{parameter}` of {} is dynamic",
                        self.name
                    )));
                }
                // Address bytes are right-aligned within the 32-byte word.
                return Ok(ChildLocation::DataOffset(offset + 12));
            }
            // Every head slot is one word: fixed-size types inline, dynamic
            // types as their offset word.
            offset += 32;
        }

        Err(EngineError::Config(format!(
            "factory parameter `{parameter}` not found on event {}",
            self.name
        )))
    }
}

/// Extract a child address from a creation-event log.
pub fn extract_child_address(
    log: &CachedLog,
    location: ChildLocation,
) -> Result<String, EngineError> {
    let bytes = match location {
        ChildLocation::Topic(n) => {
            let topic = log
                .topics
                .get(n)
                .ok_or_else(|| EngineError::Decode(format!("missing topic {n}")))?;
            let raw = decode_hex(topic)?;
            if raw.len() != 32 {
                return Err(EngineError::Decode(format!("topic {n} is not 32 bytes")));
            }
            raw[12..32].to_vec()
        }
        ChildLocation::DataOffset(off) => {
            let raw = decode_hex(&log.data)?;
            if raw.len() < off + 20 {
                return Err(EngineError::Decode(format!(
                    "log data too short for child address at offset {off}"
                )));
            }
            raw[off..off + 20].to_vec()
        }
    };
    Ok(format!("0x{}", hex::encode(bytes)))
}

// ─── EventAbi ────────────────────────────────────────────────────────────────

/// Raw ABI entry input, as deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiInput {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub components: Vec<AbiInput>,
}

#[derive(Debug, Deserialize)]
struct AbiEntry {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiInput>,
    #[serde(default)]
    anonymous: bool,
}

/// The event set of a source's ABI, with selector lookup.
#[derive(Debug, Clone, Default)]
pub struct EventAbi {
    events: Vec<(String, EventSchema)>,
}

impl EventAbi {
    /// Parse a standard JSON ABI, keeping non-anonymous `event` entries.
    pub fn from_json(abi_json: &Value) -> Result<Self, EngineError> {
        let entries: Vec<AbiEntry> = serde_json::from_value(abi_json.clone())
            .map_err(|e| EngineError::Config(format!("invalid ABI JSON: {e}")))?;

        let mut events = Vec::new();
        for entry in entries {
            if entry.ty != "event" || entry.anonymous {
                continue;
            }
            let inputs = entry
                .inputs
                .iter()
                .map(|i| {
                    Ok(EventInput {
                        name: i.name.clone(),
                        kind: ParamKind::parse(&i.ty, &i.components)?,
                        indexed: i.indexed,
                    })
                })
                .collect::<Result<Vec<_>, EngineError>>()?;
            let schema = EventSchema {
                name: entry.name,
                inputs,
            };
            events.push((schema.selector(), schema));
        }
        Ok(Self { events })
    }

    /// Build from a human-readable event list, e.g.
    /// `["Transfer(address indexed from, address indexed to, uint256 value)"]`.
    /// Convenience for tests and inline configs.
    pub fn from_signatures(signatures: &[&str]) -> Result<Self, EngineError> {
        let mut events = Vec::new();
        for sig in signatures {
            let schema = parse_signature(sig)?;
            events.push((schema.selector(), schema));
        }
        Ok(Self { events })
    }

    pub fn event_by_selector(&self, topic0: &str) -> Option<&EventSchema> {
        self.events
            .iter()
            .find(|(sel, _)| sel.eq_ignore_ascii_case(topic0))
            .map(|(_, schema)| schema)
    }

    pub fn event_by_name(&self, name: &str) -> Option<&EventSchema> {
        self.events
            .iter()
            .find(|(_, schema)| schema.name == name)
            .map(|(_, schema)| schema)
    }

    /// All event selectors, in declaration order. Used for topic0 filters
    /// and source fingerprints.
    pub fn selectors(&self) -> Vec<String> {
        self.events.iter().map(|(sel, _)| sel.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decode a batch of logs in parallel. The result is aligned with the
    /// input; logs whose selector is not in this ABI decode to `None`.
    pub fn decode_batch(
        &self,
        logs: &[CachedLog],
    ) -> Vec<Option<Result<(String, Value), EngineError>>> {
        logs.par_iter()
            .map(|log| {
                let schema = log.topic0().and_then(|t0| self.event_by_selector(t0))?;
                Some(
                    schema
                        .decode(log)
                        .map(|args| (schema.name.clone(), args)),
                )
            })
            .collect()
    }
}

/// Parse one `Name(type [indexed] [name], ...)` signature.
fn parse_signature(sig: &str) -> Result<EventSchema, EngineError> {
    let open = sig
        .find('(')
        .ok_or_else(|| EngineError::Config(format!("bad event signature `{sig}`")))?;
    let close = sig
        .rfind(')')
        .ok_or_else(|| EngineError::Config(format!("bad event signature `{sig}`")))?;
    let name = sig[..open].trim().to_string();
    let params = sig[open + 1..close].trim();

    let mut inputs = Vec::new();
    if !params.is_empty() {
        for (i, param) in params.split(',').enumerate() {
            let parts: Vec<&str> = param.split_whitespace().collect();
            let (ty, indexed, pname) = match parts.as_slice() {
                [ty] => (*ty, false, format!("arg{i}")),
                [ty, "indexed"] => (*ty, true, format!("arg{i}")),
                [ty, name] => (*ty, false, name.to_string()),
                [ty, "indexed", name] => (*ty, true, name.to_string()),
                _ => {
                    return Err(EngineError::Config(format!(
                        "bad event parameter `{param}`"
                    )))
                }
            };
            inputs.push(EventInput {
                name: pname,
                kind: ParamKind::parse(ty, &[])?,
                indexed,
            });
        }
    }
    Ok(EventSchema { name, inputs })
}

// ─── Value normalization ─────────────────────────────────────────────────────

/// Normalize a decoded value to its JSON representation.
fn normalize(value: DynSolValue, kind: &ParamKind) -> Value {
    match (value, kind) {
        (DynSolValue::Address(a), _) => json!(format!("0x{}", hex::encode(a.as_slice()))),
        (DynSolValue::Uint(u, _), _) => json!(u.to_string()),
        (DynSolValue::Int(i, _), _) => json!(i.to_string()),
        (DynSolValue::Bool(b), _) => json!(b),
        (DynSolValue::FixedBytes(word, size), _) => {
            json!(format!("0x{}", hex::encode(&word.as_slice()[..size])))
        }
        (DynSolValue::Bytes(b), _) => json!(format!("0x{}", hex::encode(b))),
        (DynSolValue::String(s), _) => json!(s),
        (DynSolValue::Array(vals), ParamKind::Vec(elem))
        | (DynSolValue::FixedArray(vals), ParamKind::Array(elem, _)) => Value::Array(
            vals.into_iter().map(|v| normalize(v, elem)).collect(),
        ),
        (DynSolValue::Tuple(vals), ParamKind::Tuple(fields)) => {
            let mut obj = serde_json::Map::new();
            for ((name, field_kind), val) in fields.iter().zip(vals) {
                obj.insert(name.clone(), normalize(val, field_kind));
            }
            Value::Object(obj)
        }
        // Shape mismatch between the declared kind and the decoded value;
        // fall back to a debug rendering rather than dropping the field.
        (other, _) => json!(format!("{other:?}")),
    }
}

/// Decode a single indexed topic (always one 32-byte word).
///
/// Value types are ABI-decoded; reference types are stored as the keccak of
/// their encoding, which is unrecoverable; the raw hash is returned.
fn decode_topic(topic: &str, kind: &ParamKind) -> Result<Value, EngineError> {
    let raw = decode_hex(topic)?;
    if kind.is_dynamic() {
        return Ok(json!(format!("0x{}", hex::encode(raw))));
    }
    let decoded = kind
        .to_dyn()
        .abi_decode(&raw)
        .map_err(|e| EngineError::Decode(format!("topic decode: {e}")))?;
    Ok(normalize(decoded, kind))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, EngineError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| EngineError::Decode(format!("invalid hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER_SELECTOR: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn transfer_abi() -> EventAbi {
        EventAbi::from_signatures(&[
            "Transfer(address indexed from, address indexed to, uint256 value)",
        ])
        .unwrap()
    }

    fn transfer_log() -> CachedLog {
        let mut data = vec![0u8; 32];
        data[24..].copy_from_slice(&1_000_000_000_000_000_000u64.to_be_bytes());
        CachedLog {
            chain_id: 1,
            block_hash: "0xb1".into(),
            block_number: 19_000_000,
            log_index: 0,
            address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
            topics: vec![
                TRANSFER_SELECTOR.into(),
                "0x000000000000000000000000d8da6bf26964af9d7eed9e03e53415d37aa96045".into(),
                "0x000000000000000000000000ab5801a7d398351b8be11c439e05c5b3259aec9b".into(),
            ],
            data: format!("0x{}", hex::encode(&data)),
            tx_hash: "0xt1".into(),
            tx_index: 0,
        }
    }

    #[test]
    fn transfer_selector_matches_known_hash() {
        let abi = transfer_abi();
        assert_eq!(abi.selectors(), vec![TRANSFER_SELECTOR.to_string()]);
    }

    #[test]
    fn decode_transfer() {
        let abi = transfer_abi();
        let log = transfer_log();
        let schema = abi.event_by_selector(log.topic0().unwrap()).unwrap();
        let args = schema.decode(&log).unwrap();

        assert_eq!(
            args["from"],
            "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"
        );
        assert_eq!(args["to"], "0xab5801a7d398351b8be11c439e05c5b3259aec9b");
        assert_eq!(args["value"], "1000000000000000000");
    }

    #[test]
    fn decode_batch_skips_unknown_selectors() {
        let abi = transfer_abi();
        let mut unknown = transfer_log();
        unknown.topics[0] = format!("0x{}", "11".repeat(32));

        let results = abi.decode_batch(&[transfer_log(), unknown]);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn abi_json_parses_events_only() {
        let abi_json = json!([
            {"type": "function", "name": "transfer", "inputs": []},
            {"type": "event", "name": "Ping", "inputs": []},
            {"type": "event", "name": "Hidden", "inputs": [], "anonymous": true}
        ]);
        let abi = EventAbi::from_json(&abi_json).unwrap();
        assert!(abi.event_by_name("Ping").is_some());
        assert!(abi.event_by_name("Hidden").is_none());
        assert!(abi.event_by_name("transfer").is_none());
    }

    #[test]
    fn child_location_indexed() {
        let abi =
            EventAbi::from_signatures(&["PairCreated(address indexed token0, address indexed token1, address pair, uint256 index)"])
                .unwrap();
        let schema = abi.event_by_name("PairCreated").unwrap();
        assert_eq!(
            schema.child_location("token1").unwrap(),
            ChildLocation::Topic(2)
        );
        // `pair` is the first non-indexed input: word 0, address at byte 12
        assert_eq!(
            schema.child_location("pair").unwrap(),
            ChildLocation::DataOffset(12)
        );
    }

    #[test]
    fn child_location_skips_preceding_words() {
        let abi = EventAbi::from_signatures(&[
            "ChildCreated(uint256 salt, bytes32 codeHash, address child)",
        ])
        .unwrap();
        let schema = abi.event_by_name("ChildCreated").unwrap();
        // Two preceding 32-byte words, then 12 bytes of padding
        assert_eq!(
            schema.child_location("child").unwrap(),
            ChildLocation::DataOffset(76)
        );
    }

    #[test]
    fn child_location_rejects_dynamic_parameter() {
        let abi =
            EventAbi::from_signatures(&["ChildCreated(bytes initCode, address child)"]).unwrap();
        let schema = abi.event_by_name("ChildCreated").unwrap();
        assert!(matches!(
            schema.child_location("initCode"),
            Err(EngineError::Config(_))
        ));
        // The offset word of `initCode` still counts as one head word.
        assert_eq!(
            schema.child_location("child").unwrap(),
            ChildLocation::DataOffset(44)
        );
    }

    #[test]
    fn extract_child_from_topic() {
        let log = transfer_log();
        let child = extract_child_address(&log, ChildLocation::Topic(1)).unwrap();
        assert_eq!(child, "0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
    }

    #[test]
    fn extract_child_from_data() {
        let mut data = vec![0u8; 32];
        data[12..].copy_from_slice(&[0xc1; 20]);
        let mut log = transfer_log();
        log.data = format!("0x{}", hex::encode(&data));
        let child = extract_child_address(&log, ChildLocation::DataOffset(12)).unwrap();
        assert_eq!(child, format!("0x{}", "c1".repeat(20)));
    }

    #[test]
    fn extract_child_short_data_errors() {
        let mut log = transfer_log();
        log.data = "0x00".into();
        assert!(extract_child_address(&log, ChildLocation::DataOffset(12)).is_err());
    }

    #[test]
    fn dynamic_types_detected() {
        assert!(ParamKind::parse("bytes", &[]).unwrap().is_dynamic());
        assert!(ParamKind::parse("string[]", &[]).unwrap().is_dynamic());
        assert!(!ParamKind::parse("uint8[4]", &[]).unwrap().is_dynamic());
        assert!(!ParamKind::parse("bytes32", &[]).unwrap().is_dynamic());
    }
}
