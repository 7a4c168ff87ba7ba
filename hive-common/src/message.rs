//! # Wire Messages
//!
//! Purpose: Encode and decode every message exchanged between client, host,
//! and manager on top of the length-prefixed framing.
//!
//! ## Payload Layout
//!
//! One opcode byte, a single space, then opcode-specific fields separated by
//! single spaces. Binary blobs travel base64-encoded; everything else is
//! UTF-8 text. Absolute expirations use `yyMMddHHmmss` in the host's
//! wall-clock zone. A zero-length field is a meaningful token: in response
//! slots it marks a miss.
//!
//! ## Host opcodes
//!
//! ```text
//! A key                      GET
//! B k1 k2 ...                GET_MANY
//! C tag                      GET_TAGGED
//! D key blob [flags]         ADD_OR_UPDATE, no expiration
//! E ts key blob [flags]      ADD_OR_UPDATE, absolute expiration
//! F secs key blob [flags]    ADD_OR_UPDATE, sliding expiration
//! G k1 b1 ... [flags]        ADD_OR_UPDATE_MANY, no expiration
//! H ts k1 b1 ... [flags]     ADD_OR_UPDATE_MANY, absolute
//! I secs k1 b1 ... [flags]   ADD_OR_UPDATE_MANY, sliding
//! J tag key blob [flags]     ADD_OR_UPDATE_TAGGED, no expiration
//! K ts tag key blob [flags]  ADD_OR_UPDATE_TAGGED, absolute
//! L secs tag key blob [...]  ADD_OR_UPDATE_TAGGED, sliding
//! M tag k1 b1 ... [flags]    ADD_OR_UPDATE_MANY_TAGGED, no expiration
//! N ts tag k1 b1 ... [...]   ADD_OR_UPDATE_MANY_TAGGED, absolute
//! O secs tag k1 b1 ... [...] ADD_OR_UPDATE_MANY_TAGGED, sliding
//! P key                      REMOVE
//! Q k1 k2 ...                REMOVE_MANY
//! R tag [pattern]            REMOVE_TAGGED
//! S pattern                  KEYS (admin)
//! T                          CLEAR (admin)
//! ```
//!
//! Responses echo the request opcode; `A`/`B`/`C` carry base64 slots in
//! request order, `S` carries key names, everything else is a bare ack.
//!
//! ## Manager opcodes
//!
//! ```text
//! r addr count               REGISTER (host -> manager)
//! d addr                     DEREGISTER (host -> manager)
//! w ordinal addr0 addr1 ...  WELCOME: assigned ordinal + ordered membership
//! h addr ordinal total       REGISTER_HOST fan-out (manager -> host)
//! u addr                     UNREGISTER_HOST fan-out (manager -> host)
//! p                          POLL counters (manager -> host)
//! c addr json                COUNTERS poll reply (host -> manager)
//! m / m N addr...            MEMBERSHIP request / reply (observer <-> manager)
//! s / s json                 SNAPSHOT request / reply (observer <-> manager)
//! ```

use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};

use crate::error::{CacheError, CacheResult};
use crate::perf::{ClusterSnapshot, HostCounters};

/// Wire format for absolute expirations (`yyMMddHHmmss`).
pub const ABSOLUTE_EXPIRY_FORMAT: &str = "%y%m%d%H%M%S";

/// Expiration mode attached to a write, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Entry never expires on its own.
    #[default]
    None,
    /// Entry expires at a wall-clock instant (second precision).
    Absolute(NaiveDateTime),
    /// Entry expires after going unread for the window (second precision).
    Sliding(Duration),
}

impl Expiry {
    /// Builds an absolute expiry from a system clock instant.
    ///
    /// The wire format carries second precision in the local zone.
    pub fn absolute_at(instant: SystemTime) -> Expiry {
        let dt: chrono::DateTime<Local> = instant.into();
        Expiry::Absolute(dt.naive_local())
    }

    /// Builds a sliding expiry; sub-second precision is truncated.
    pub fn sliding(window: Duration) -> Expiry {
        Expiry::Sliding(Duration::from_secs(window.as_secs()))
    }

    /// Interprets a wire timestamp as a system clock instant.
    ///
    /// The timestamp is local wall-clock time; a nonexistent local time
    /// (DST gap) falls back to the UTC reading.
    pub fn to_system_time(ts: NaiveDateTime) -> SystemTime {
        match Local.from_local_datetime(&ts).earliest() {
            Some(dt) => dt.into(),
            None => Utc.from_utc_datetime(&ts).into(),
        }
    }

    /// Opcode offset for the three expiry variants (none/absolute/sliding).
    fn offset(&self) -> u8 {
        match self {
            Expiry::None => 0,
            Expiry::Absolute(_) => 1,
            Expiry::Sliding(_) => 2,
        }
    }

    /// Appends the expiry field, if any, to the payload under construction.
    fn push_field(&self, out: &mut String) {
        match self {
            Expiry::None => {}
            Expiry::Absolute(ts) => {
                out.push(' ');
                out.push_str(&ts.format(ABSOLUTE_EXPIRY_FORMAT).to_string());
            }
            Expiry::Sliding(window) => {
                out.push(' ');
                out.push_str(&window.as_secs().to_string());
            }
        }
    }
}

/// Per-entry storage flags carried alongside a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags {
    /// Entry is exempt from expiration and eviction; removable only explicitly.
    pub interned: bool,
    /// Host emits a removal event when the entry disappears for any reason.
    pub notify_removed: bool,
}

impl EntryFlags {
    /// Returns the wire token for these flags, or `None` when both are unset.
    fn token(&self) -> Option<&'static str> {
        match (self.interned, self.notify_removed) {
            (false, false) => None,
            (true, false) => Some("i"),
            (false, true) => Some("n"),
            (true, true) => Some("in"),
        }
    }

    /// Parses a trailing flags token; `None` when the token is not one.
    fn parse(token: &str) -> Option<EntryFlags> {
        if token.is_empty() || token.len() > 2 {
            return None;
        }
        let mut flags = EntryFlags::default();
        for ch in token.chars() {
            match ch {
                'i' if !flags.interned => flags.interned = true,
                'n' if !flags.notify_removed => flags.notify_removed = true,
                _ => return None,
            }
        }
        Some(flags)
    }
}

/// Requests accepted by a cache host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    Get { key: String },
    GetMany { keys: Vec<String> },
    GetTagged { tag: String },
    AddOrUpdate { key: String, payload: Vec<u8>, expiry: Expiry, flags: EntryFlags },
    AddOrUpdateMany { pairs: Vec<(String, Vec<u8>)>, expiry: Expiry, flags: EntryFlags },
    AddOrUpdateTagged { tag: String, key: String, payload: Vec<u8>, expiry: Expiry, flags: EntryFlags },
    AddOrUpdateManyTagged { tag: String, pairs: Vec<(String, Vec<u8>)>, expiry: Expiry, flags: EntryFlags },
    Remove { key: String },
    RemoveMany { keys: Vec<String> },
    RemoveTagged { tag: String, pattern: Option<String> },
    Keys { pattern: String },
    Clear,
}

impl HostRequest {
    /// Returns the opcode byte this request encodes to.
    pub fn opcode(&self) -> u8 {
        match self {
            HostRequest::Get { .. } => b'A',
            HostRequest::GetMany { .. } => b'B',
            HostRequest::GetTagged { .. } => b'C',
            HostRequest::AddOrUpdate { expiry, .. } => b'D' + expiry.offset(),
            HostRequest::AddOrUpdateMany { expiry, .. } => b'G' + expiry.offset(),
            HostRequest::AddOrUpdateTagged { expiry, .. } => b'J' + expiry.offset(),
            HostRequest::AddOrUpdateManyTagged { expiry, .. } => b'M' + expiry.offset(),
            HostRequest::Remove { .. } => b'P',
            HostRequest::RemoveMany { .. } => b'Q',
            HostRequest::RemoveTagged { .. } => b'R',
            HostRequest::Keys { .. } => b'S',
            HostRequest::Clear => b'T',
        }
    }

    /// Encodes the request into a frame payload.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut out = String::new();
        out.push(self.opcode() as char);

        match self {
            HostRequest::Get { key } => {
                push_atom(&mut out, key, "key")?;
            }
            HostRequest::GetMany { keys } => {
                require_some(keys.len(), "keys")?;
                for key in keys {
                    push_atom(&mut out, key, "key")?;
                }
            }
            HostRequest::GetTagged { tag } => {
                push_atom(&mut out, tag, "tag")?;
            }
            HostRequest::AddOrUpdate { key, payload, expiry, flags } => {
                expiry.push_field(&mut out);
                push_atom(&mut out, key, "key")?;
                push_blob(&mut out, payload);
                push_flags(&mut out, flags);
            }
            HostRequest::AddOrUpdateMany { pairs, expiry, flags } => {
                require_some(pairs.len(), "pairs")?;
                expiry.push_field(&mut out);
                for (key, payload) in pairs {
                    push_atom(&mut out, key, "key")?;
                    push_blob(&mut out, payload);
                }
                push_flags(&mut out, flags);
            }
            HostRequest::AddOrUpdateTagged { tag, key, payload, expiry, flags } => {
                expiry.push_field(&mut out);
                push_atom(&mut out, tag, "tag")?;
                push_atom(&mut out, key, "key")?;
                push_blob(&mut out, payload);
                push_flags(&mut out, flags);
            }
            HostRequest::AddOrUpdateManyTagged { tag, pairs, expiry, flags } => {
                require_some(pairs.len(), "pairs")?;
                expiry.push_field(&mut out);
                push_atom(&mut out, tag, "tag")?;
                for (key, payload) in pairs {
                    push_atom(&mut out, key, "key")?;
                    push_blob(&mut out, payload);
                }
                push_flags(&mut out, flags);
            }
            HostRequest::Remove { key } => {
                push_atom(&mut out, key, "key")?;
            }
            HostRequest::RemoveMany { keys } => {
                require_some(keys.len(), "keys")?;
                for key in keys {
                    push_atom(&mut out, key, "key")?;
                }
            }
            HostRequest::RemoveTagged { tag, pattern } => {
                push_atom(&mut out, tag, "tag")?;
                if let Some(pattern) = pattern {
                    push_atom(&mut out, pattern, "pattern")?;
                }
            }
            HostRequest::Keys { pattern } => {
                push_atom(&mut out, pattern, "pattern")?;
            }
            HostRequest::Clear => {}
        }

        Ok(out.into_bytes())
    }

    /// Decodes a frame payload into a request.
    pub fn decode(payload: &[u8]) -> CacheResult<HostRequest> {
        let (opcode, fields) = split_payload(payload)?;

        match opcode {
            b'A' => Ok(HostRequest::Get { key: one_field(&fields, "key")? }),
            b'B' => Ok(HostRequest::GetMany { keys: atom_list(&fields, "keys")? }),
            b'C' => Ok(HostRequest::GetTagged { tag: one_field(&fields, "tag")? }),
            b'D' | b'E' | b'F' => {
                let (expiry, rest) = take_expiry(opcode - b'D', &fields)?;
                let (rest, flags) = take_flags_fixed(rest, 2)?;
                Ok(HostRequest::AddOrUpdate {
                    key: atom(rest[0], "key")?,
                    payload: blob(rest[1])?,
                    expiry,
                    flags,
                })
            }
            b'G' | b'H' | b'I' => {
                let (expiry, rest) = take_expiry(opcode - b'G', &fields)?;
                let (pairs, flags) = take_pairs(rest)?;
                Ok(HostRequest::AddOrUpdateMany { pairs, expiry, flags })
            }
            b'J' | b'K' | b'L' => {
                let (expiry, rest) = take_expiry(opcode - b'J', &fields)?;
                let (rest, flags) = take_flags_fixed(rest, 3)?;
                Ok(HostRequest::AddOrUpdateTagged {
                    tag: atom(rest[0], "tag")?,
                    key: atom(rest[1], "key")?,
                    payload: blob(rest[2])?,
                    expiry,
                    flags,
                })
            }
            b'M' | b'N' | b'O' => {
                let (expiry, rest) = take_expiry(opcode - b'M', &fields)?;
                if rest.is_empty() {
                    return Err(CacheError::protocol("missing tag"));
                }
                let tag = atom(rest[0], "tag")?;
                let (pairs, flags) = take_pairs(&rest[1..])?;
                Ok(HostRequest::AddOrUpdateManyTagged { tag, pairs, expiry, flags })
            }
            b'P' => Ok(HostRequest::Remove { key: one_field(&fields, "key")? }),
            b'Q' => Ok(HostRequest::RemoveMany { keys: atom_list(&fields, "keys")? }),
            b'R' => match fields.len() {
                1 => Ok(HostRequest::RemoveTagged { tag: atom(fields[0], "tag")?, pattern: None }),
                2 => Ok(HostRequest::RemoveTagged {
                    tag: atom(fields[0], "tag")?,
                    pattern: Some(atom(fields[1], "pattern")?),
                }),
                _ => Err(CacheError::protocol("REMOVE_TAGGED takes a tag and an optional pattern")),
            },
            b'S' => Ok(HostRequest::Keys { pattern: one_field(&fields, "pattern")? }),
            b'T' => {
                if fields.is_empty() {
                    Ok(HostRequest::Clear)
                } else {
                    Err(CacheError::protocol("CLEAR takes no fields"))
                }
            }
            other => Err(CacheError::Protocol(format!("unknown host opcode 0x{other:02x}"))),
        }
    }
}

/// Responses produced by a cache host.
///
/// Every response echoes the request opcode so the caller can detect
/// desynchronized streams immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    /// Payload slots in request order; a zero-length slot is a miss.
    Slots(Vec<Vec<u8>>),
    /// Key names matching an admin KEYS request.
    Keys(Vec<String>),
    /// Bare acknowledgement for writes, removes, and clear.
    Ack,
}

impl HostResponse {
    /// Encodes the response for the given request opcode.
    pub fn encode(&self, opcode: u8) -> Vec<u8> {
        let mut out = String::new();
        out.push(opcode as char);
        match self {
            HostResponse::Slots(slots) => {
                for slot in slots {
                    push_blob(&mut out, slot);
                }
            }
            HostResponse::Keys(keys) => {
                for key in keys {
                    out.push(' ');
                    out.push_str(key);
                }
            }
            HostResponse::Ack => {}
        }
        out.into_bytes()
    }

    /// Decodes a response, verifying it answers the expected opcode.
    pub fn decode(payload: &[u8], expected: u8) -> CacheResult<HostResponse> {
        let (opcode, fields) = split_payload(payload)?;
        if opcode != expected {
            return Err(CacheError::Protocol(format!(
                "response opcode 0x{opcode:02x} does not match request 0x{expected:02x}"
            )));
        }

        match opcode {
            b'A' | b'B' | b'C' => {
                let mut slots = Vec::with_capacity(fields.len());
                for field in &fields {
                    slots.push(blob(field)?);
                }
                Ok(HostResponse::Slots(slots))
            }
            b'S' => Ok(HostResponse::Keys(fields.iter().map(|s| s.to_string()).collect())),
            _ => {
                if fields.is_empty() {
                    Ok(HostResponse::Ack)
                } else {
                    Err(CacheError::protocol("unexpected fields in ack response"))
                }
            }
        }
    }
}

/// Messages exchanged with the manager, both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerFrame {
    /// Host announces itself and its current object count.
    Register { address: String, object_count: u64 },
    /// Host asks to leave the cluster.
    Deregister { address: String },
    /// Registration ack: assigned ordinal plus the full ordered membership.
    Welcome { ordinal: usize, members: Vec<String> },
    /// A new peer joined; update the local ring.
    RegisterHost { address: String, ordinal: usize, total: usize },
    /// A peer departed; update the local ring.
    UnregisterHost { address: String },
    /// Manager requests fresh performance counters.
    Poll,
    /// Host replies to a poll with its counters.
    Counters { address: String, counters: HostCounters },
    /// Observer asks for the ordered membership.
    MembershipRequest,
    /// Ordered membership reply.
    Membership { members: Vec<String> },
    /// Observer asks for the cluster performance snapshot.
    SnapshotRequest,
    /// Cluster performance snapshot reply.
    Snapshot(ClusterSnapshot),
}

impl ManagerFrame {
    /// Encodes the frame into a payload.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut out = String::new();
        match self {
            ManagerFrame::Register { address, object_count } => {
                out.push('r');
                push_atom(&mut out, address, "address")?;
                out.push(' ');
                out.push_str(&object_count.to_string());
            }
            ManagerFrame::Deregister { address } => {
                out.push('d');
                push_atom(&mut out, address, "address")?;
            }
            ManagerFrame::Welcome { ordinal, members } => {
                out.push('w');
                out.push(' ');
                out.push_str(&ordinal.to_string());
                for member in members {
                    push_atom(&mut out, member, "member")?;
                }
            }
            ManagerFrame::RegisterHost { address, ordinal, total } => {
                out.push('h');
                push_atom(&mut out, address, "address")?;
                out.push(' ');
                out.push_str(&ordinal.to_string());
                out.push(' ');
                out.push_str(&total.to_string());
            }
            ManagerFrame::UnregisterHost { address } => {
                out.push('u');
                push_atom(&mut out, address, "address")?;
            }
            ManagerFrame::Poll => out.push('p'),
            ManagerFrame::Counters { address, counters } => {
                out.push('c');
                push_atom(&mut out, address, "address")?;
                out.push(' ');
                out.push_str(
                    &serde_json::to_string(counters)
                        .map_err(|err| CacheError::Protocol(format!("counters encoding: {err}")))?,
                );
            }
            ManagerFrame::MembershipRequest => out.push('m'),
            ManagerFrame::Membership { members } => {
                out.push('m');
                out.push(' ');
                out.push_str(&members.len().to_string());
                for member in members {
                    push_atom(&mut out, member, "member")?;
                }
            }
            ManagerFrame::SnapshotRequest => out.push('s'),
            ManagerFrame::Snapshot(snapshot) => {
                out.push('s');
                out.push(' ');
                out.push_str(
                    &serde_json::to_string(snapshot)
                        .map_err(|err| CacheError::Protocol(format!("snapshot encoding: {err}")))?,
                );
            }
        }
        Ok(out.into_bytes())
    }

    /// Decodes a manager frame payload.
    pub fn decode(payload: &[u8]) -> CacheResult<ManagerFrame> {
        let (opcode, fields) = split_payload(payload)?;
        match opcode {
            b'r' => {
                if fields.len() != 2 {
                    return Err(CacheError::protocol("REGISTER takes address and count"));
                }
                Ok(ManagerFrame::Register {
                    address: atom(fields[0], "address")?,
                    object_count: parse_u64(fields[1])?,
                })
            }
            b'd' => Ok(ManagerFrame::Deregister { address: one_field(&fields, "address")? }),
            b'w' => {
                if fields.is_empty() {
                    return Err(CacheError::protocol("WELCOME missing ordinal"));
                }
                Ok(ManagerFrame::Welcome {
                    ordinal: parse_usize(fields[0])?,
                    members: fields[1..].iter().map(|s| s.to_string()).collect(),
                })
            }
            b'h' => {
                if fields.len() != 3 {
                    return Err(CacheError::protocol("REGISTER_HOST takes address, ordinal, total"));
                }
                Ok(ManagerFrame::RegisterHost {
                    address: atom(fields[0], "address")?,
                    ordinal: parse_usize(fields[1])?,
                    total: parse_usize(fields[2])?,
                })
            }
            b'u' => Ok(ManagerFrame::UnregisterHost { address: one_field(&fields, "address")? }),
            b'p' => {
                if fields.is_empty() {
                    Ok(ManagerFrame::Poll)
                } else {
                    Err(CacheError::protocol("POLL takes no fields"))
                }
            }
            b'c' => {
                if fields.len() < 2 {
                    return Err(CacheError::protocol("COUNTERS takes address and document"));
                }
                // The JSON document is the remainder after the address token.
                let text = payload_text(payload)?;
                let rest = &text[2..];
                let (address, json) = rest
                    .split_once(' ')
                    .ok_or_else(|| CacheError::protocol("COUNTERS missing document"))?;
                let counters: HostCounters = serde_json::from_str(json)
                    .map_err(|err| CacheError::Protocol(format!("counters decoding: {err}")))?;
                Ok(ManagerFrame::Counters { address: atom(address, "address")?, counters })
            }
            b'm' => {
                if fields.is_empty() {
                    return Ok(ManagerFrame::MembershipRequest);
                }
                let count = parse_usize(fields[0])?;
                let members: Vec<String> = fields[1..].iter().map(|s| s.to_string()).collect();
                if members.len() != count {
                    return Err(CacheError::protocol("membership count mismatch"));
                }
                Ok(ManagerFrame::Membership { members })
            }
            b's' => {
                if fields.is_empty() {
                    return Ok(ManagerFrame::SnapshotRequest);
                }
                let text = payload_text(payload)?;
                let snapshot: ClusterSnapshot = serde_json::from_str(&text[2..])
                    .map_err(|err| CacheError::Protocol(format!("snapshot decoding: {err}")))?;
                Ok(ManagerFrame::Snapshot(snapshot))
            }
            other => Err(CacheError::Protocol(format!("unknown manager opcode 0x{other:02x}"))),
        }
    }
}

fn payload_text(payload: &[u8]) -> CacheResult<&str> {
    std::str::from_utf8(payload).map_err(|_| CacheError::protocol("payload is not UTF-8"))
}

/// Splits a payload into its opcode byte and field tokens.
///
/// `split(' ')` preserves empty tokens, which is how zero-length slots
/// survive the trip.
fn split_payload(payload: &[u8]) -> CacheResult<(u8, Vec<&str>)> {
    let text = payload_text(payload)?;
    let mut bytes = text.bytes();
    let opcode = bytes.next().ok_or_else(|| CacheError::protocol("empty payload"))?;
    match bytes.next() {
        None => Ok((opcode, Vec::new())),
        Some(b' ') => Ok((opcode, text[2..].split(' ').collect())),
        Some(_) => Err(CacheError::protocol("missing separator after opcode")),
    }
}

fn push_atom(out: &mut String, value: &str, what: &str) -> CacheResult<()> {
    if value.is_empty() || value.contains(' ') {
        return Err(CacheError::Protocol(format!("{what} must be non-empty and contain no spaces")));
    }
    out.push(' ');
    out.push_str(value);
    Ok(())
}

fn push_blob(out: &mut String, blob: &[u8]) {
    out.push(' ');
    out.push_str(&BASE64.encode(blob));
}

fn push_flags(out: &mut String, flags: &EntryFlags) {
    if let Some(token) = flags.token() {
        out.push(' ');
        out.push_str(token);
    }
}

fn atom(field: &str, what: &str) -> CacheResult<String> {
    if field.is_empty() {
        return Err(CacheError::Protocol(format!("empty {what}")));
    }
    Ok(field.to_string())
}

fn blob(field: &str) -> CacheResult<Vec<u8>> {
    BASE64
        .decode(field)
        .map_err(|_| CacheError::protocol("invalid base64 blob"))
}

fn one_field(fields: &[&str], what: &str) -> CacheResult<String> {
    if fields.len() != 1 {
        return Err(CacheError::Protocol(format!("expected exactly one {what} field")));
    }
    atom(fields[0], what)
}

fn atom_list(fields: &[&str], what: &str) -> CacheResult<Vec<String>> {
    require_some(fields.len(), what)?;
    fields.iter().map(|f| atom(f, what)).collect()
}

fn require_some(len: usize, what: &str) -> CacheResult<()> {
    if len == 0 {
        return Err(CacheError::Protocol(format!("empty {what}")));
    }
    Ok(())
}

fn parse_u64(field: &str) -> CacheResult<u64> {
    field
        .parse::<u64>()
        .map_err(|_| CacheError::protocol("invalid integer field"))
}

fn parse_usize(field: &str) -> CacheResult<usize> {
    field
        .parse::<usize>()
        .map_err(|_| CacheError::protocol("invalid integer field"))
}

/// Consumes the expiry field demanded by the opcode offset.
fn take_expiry<'a>(offset: u8, fields: &'a [&'a str]) -> CacheResult<(Expiry, &'a [&'a str])> {
    match offset {
        0 => Ok((Expiry::None, fields)),
        1 => {
            let field = fields.first().ok_or_else(|| CacheError::protocol("missing expiry field"))?;
            let ts = NaiveDateTime::parse_from_str(field, ABSOLUTE_EXPIRY_FORMAT)
                .map_err(|_| CacheError::protocol("invalid absolute expiry timestamp"))?;
            Ok((Expiry::Absolute(ts), &fields[1..]))
        }
        2 => {
            let field = fields.first().ok_or_else(|| CacheError::protocol("missing expiry field"))?;
            Ok((Expiry::Sliding(Duration::from_secs(parse_u64(field)?)), &fields[1..]))
        }
        _ => Err(CacheError::protocol("bad expiry offset")),
    }
}

/// Splits a fixed-arity field list from its optional trailing flags token.
fn take_flags_fixed<'a>(fields: &'a [&'a str], arity: usize) -> CacheResult<(&'a [&'a str], EntryFlags)> {
    if fields.len() == arity {
        return Ok((fields, EntryFlags::default()));
    }
    if fields.len() == arity + 1 {
        let flags = EntryFlags::parse(fields[arity])
            .ok_or_else(|| CacheError::protocol("invalid flags token"))?;
        return Ok((&fields[..arity], flags));
    }
    Err(CacheError::protocol("wrong number of fields"))
}

/// Parses key/blob pairs with an optional trailing flags token.
///
/// The pair list always has even length, so an odd remainder means the last
/// token is the flags field.
fn take_pairs(fields: &[&str]) -> CacheResult<(Vec<(String, Vec<u8>)>, EntryFlags)> {
    let (pair_fields, flags) = if fields.len() % 2 == 1 {
        let flags = EntryFlags::parse(fields[fields.len() - 1])
            .ok_or_else(|| CacheError::protocol("invalid flags token"))?;
        (&fields[..fields.len() - 1], flags)
    } else {
        (fields, EntryFlags::default())
    };

    require_some(pair_fields.len(), "pairs")?;
    let mut pairs = Vec::with_capacity(pair_fields.len() / 2);
    for chunk in pair_fields.chunks(2) {
        pairs.push((atom(chunk[0], "key")?, blob(chunk[1])?));
    }
    Ok((pairs, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: HostRequest) -> HostRequest {
        let payload = request.encode().unwrap();
        HostRequest::decode(&payload).unwrap()
    }

    #[test]
    fn get_roundtrip() {
        let request = HostRequest::Get { key: "alpha".into() };
        assert_eq!(roundtrip(request.clone()), request);
        assert_eq!(request.opcode(), b'A');
    }

    #[test]
    fn add_with_absolute_expiry_uses_opcode_e() {
        let ts = NaiveDateTime::parse_from_str("250801120000", ABSOLUTE_EXPIRY_FORMAT).unwrap();
        let request = HostRequest::AddOrUpdate {
            key: "alpha".into(),
            payload: b"value".to_vec(),
            expiry: Expiry::Absolute(ts),
            flags: EntryFlags::default(),
        };
        let payload = request.encode().unwrap();
        assert_eq!(payload[0], b'E');
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn add_with_sliding_expiry_uses_opcode_f() {
        let request = HostRequest::AddOrUpdate {
            key: "alpha".into(),
            payload: b"value".to_vec(),
            expiry: Expiry::Sliding(Duration::from_secs(30)),
            flags: EntryFlags { interned: false, notify_removed: true },
        };
        let payload = request.encode().unwrap();
        assert_eq!(payload[0], b'F');
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn interned_flag_survives_many_tagged() {
        let request = HostRequest::AddOrUpdateManyTagged {
            tag: "news".into(),
            pairs: vec![("a".into(), b"1".to_vec()), ("b".into(), b"2".to_vec())],
            expiry: Expiry::None,
            flags: EntryFlags { interned: true, notify_removed: true },
        };
        assert_eq!(request.opcode(), b'M');
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn empty_payload_blob_roundtrips() {
        let request = HostRequest::AddOrUpdate {
            key: "alpha".into(),
            payload: Vec::new(),
            expiry: Expiry::None,
            flags: EntryFlags::default(),
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn key_with_space_is_rejected() {
        let request = HostRequest::Get { key: "has space".into() };
        assert!(matches!(request.encode(), Err(CacheError::Protocol(_))));
    }

    #[test]
    fn remove_tagged_with_pattern() {
        let request = HostRequest::RemoveTagged { tag: "news".into(), pattern: Some("sports:*".into()) };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn miss_slot_is_zero_length() {
        let response = HostResponse::Slots(vec![b"hit".to_vec(), Vec::new(), b"hit2".to_vec()]);
        let payload = response.encode(b'B');
        let decoded = HostResponse::decode(&payload, b'B').unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn empty_tagged_response_roundtrips() {
        let response = HostResponse::Slots(Vec::new());
        let payload = response.encode(b'C');
        assert_eq!(payload, b"C");
        assert_eq!(HostResponse::decode(&payload, b'C').unwrap(), response);
    }

    #[test]
    fn mismatched_response_opcode_is_protocol_error() {
        let payload = HostResponse::Ack.encode(b'P');
        assert!(matches!(
            HostResponse::decode(&payload, b'Q'),
            Err(CacheError::Protocol(_))
        ));
    }

    #[test]
    fn manager_register_roundtrip() {
        let frame = ManagerFrame::Register { address: "10.0.0.1:33333".into(), object_count: 42 };
        let payload = frame.encode().unwrap();
        assert_eq!(ManagerFrame::decode(&payload).unwrap(), frame);
    }

    #[test]
    fn manager_welcome_carries_ordered_members() {
        let frame = ManagerFrame::Welcome {
            ordinal: 1,
            members: vec!["10.0.0.1:33333".into(), "10.0.0.2:33333".into()],
        };
        let payload = frame.encode().unwrap();
        assert_eq!(ManagerFrame::decode(&payload).unwrap(), frame);
    }

    #[test]
    fn membership_request_and_reply_are_distinct() {
        let request = ManagerFrame::MembershipRequest.encode().unwrap();
        assert_eq!(ManagerFrame::decode(&request).unwrap(), ManagerFrame::MembershipRequest);

        let reply = ManagerFrame::Membership { members: Vec::new() }.encode().unwrap();
        assert_eq!(
            ManagerFrame::decode(&reply).unwrap(),
            ManagerFrame::Membership { members: Vec::new() }
        );
    }

    #[test]
    fn counters_roundtrip_with_json_document() {
        let counters = HostCounters {
            cached_objects: 7,
            memory_usage_mb: 1.5,
            memory_usage_percent: 12.0,
            total_rate: 10.0,
            add_rate: 4.0,
            get_rate: 5.0,
            remove_rate: 1.0,
        };
        let frame = ManagerFrame::Counters { address: "10.0.0.1:33333".into(), counters };
        let payload = frame.encode().unwrap();
        assert_eq!(ManagerFrame::decode(&payload).unwrap(), frame);
    }
}
