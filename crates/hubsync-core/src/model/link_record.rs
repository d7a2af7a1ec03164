// ── Link record (one ALL-Link database entry) ──
//
// A record pairs a peer device + group with a controller/responder role
// and three data bytes. Identity-bearing fields are fixed at construction;
// every `with_*` that touches one returns a record with a fresh uid, while
// status-only changes keep the uid.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::{DeviceId, SceneId};
use super::sync_status::SyncStatus;
use crate::error::MalformedRecordError;

/// First memory address of a device link table; records grow downwards.
pub const TABLE_BASE_ADDRESS: u16 = 0x0FFF;
/// On-wire size of one record.
pub const RECORD_SIZE: u16 = 8;

const ALDB_COMMAND: u8 = 0x2F;
const ALDB_READ_RESPONSE: u8 = 0x01;
const ALDB_WRITE_REQUEST: u8 = 0x02;
const ALDB_PAYLOAD_LEN: usize = 14;
const IM_RECORD_LEN: usize = 8;

// ── Record uid ──────────────────────────────────────────────────────

static NEXT_UID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a record instance.
///
/// `RecordUid::NONE` (zero) is never handed out; it marks a record that
/// temporarily has no identity (see `LinkTable::swap_records`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordUid(u32);

impl RecordUid {
    pub const NONE: Self = Self(0);

    pub(crate) fn next() -> Self {
        loop {
            let raw = NEXT_UID.fetch_add(1, Ordering::Relaxed);
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Make sure uids handed out from now on are above `uid`.
    pub(crate) fn reserve_past(uid: Self) {
        NEXT_UID.fetch_max(uid.0.saturating_add(1), Ordering::Relaxed);
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

// ── Flags ───────────────────────────────────────────────────────────

/// Record control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordFlags(u8);

impl RecordFlags {
    pub const IN_USE: u8 = 0x80;
    pub const CONTROLLER: u8 = 0x40;
    pub const USED_BEFORE: u8 = 0x02;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn for_role(role: LinkRole) -> Self {
        let mut bits = Self::IN_USE | Self::USED_BEFORE;
        if role == LinkRole::Controller {
            bits |= Self::CONTROLLER;
        }
        Self(bits)
    }

    pub const fn in_use(self) -> bool {
        self.0 & Self::IN_USE != 0
    }

    pub const fn is_controller(self) -> bool {
        self.0 & Self::CONTROLLER != 0
    }

    pub const fn used_before(self) -> bool {
        self.0 & Self::USED_BEFORE != 0
    }

    pub const fn with_in_use(self, in_use: bool) -> Self {
        if in_use {
            Self(self.0 | Self::IN_USE)
        } else {
            Self(self.0 & !Self::IN_USE)
        }
    }

    pub fn role(self) -> LinkRole {
        if self.is_controller() {
            LinkRole::Controller
        } else {
            LinkRole::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkRole {
    Controller,
    Responder,
}

impl LinkRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Controller => Self::Responder,
            Self::Responder => Self::Controller,
        }
    }
}

// ── LinkRecord ──────────────────────────────────────────────────────

/// One entry of a device link table.
///
/// `PartialEq` is strict: every field including uid and status. Use
/// [`LinkRecord::matches`] for identity and [`LinkRecord::same_content`] to
/// compare against what a device stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    dest: DeviceId,
    group: u8,
    flags: RecordFlags,
    data: [u8; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scene: Option<SceneId>,
    #[serde(default)]
    status: SyncStatus,
    #[serde(default = "RecordUid::next")]
    uid: RecordUid,
}

impl LinkRecord {
    /// Build a record from raw fields. New records start out `Changed`.
    pub fn new(dest: DeviceId, group: u8, flags: RecordFlags, data: [u8; 3]) -> Self {
        Self {
            dest,
            group,
            flags,
            data,
            scene: None,
            status: SyncStatus::Changed,
            uid: RecordUid::next(),
        }
    }

    pub fn controller(dest: DeviceId, group: u8, data: [u8; 3]) -> Self {
        Self::new(dest, group, RecordFlags::for_role(LinkRole::Controller), data)
    }

    pub fn responder(dest: DeviceId, group: u8, data: [u8; 3]) -> Self {
        Self::new(dest, group, RecordFlags::for_role(LinkRole::Responder), data)
    }

    /// The sentinel marking the end of everything a device ever stored.
    pub fn high_water_mark() -> Self {
        Self {
            status: SyncStatus::Synced,
            ..Self::new(DeviceId::ZERO, 0, RecordFlags::from_bits(0), [0; 3])
        }
    }

    /// Filler for slots not yet acquired from a device.
    pub fn placeholder() -> Self {
        Self {
            status: SyncStatus::Unknown,
            ..Self::new(
                DeviceId::ZERO,
                0,
                RecordFlags::from_bits(RecordFlags::USED_BEFORE),
                [0; 3],
            )
        }
    }

    /// A physical record adopted into a logical table.
    pub fn from_physical(physical: &Self) -> Self {
        Self {
            status: SyncStatus::Synced,
            ..Self::new(physical.dest, physical.group, physical.flags, physical.data)
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn dest(&self) -> DeviceId {
        self.dest
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn data(&self) -> [u8; 3] {
        self.data
    }

    pub fn scene(&self) -> Option<SceneId> {
        self.scene
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn uid(&self) -> RecordUid {
        self.uid
    }

    pub fn role(&self) -> LinkRole {
        self.flags.role()
    }

    pub fn is_controller(&self) -> bool {
        self.flags.is_controller()
    }

    pub fn is_responder(&self) -> bool {
        !self.flags.is_controller()
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.in_use()
    }

    pub fn is_high_water_mark(&self) -> bool {
        !self.flags.used_before()
    }

    // ── Derived copies ───────────────────────────────────────────────

    /// Same record (same uid) with another status.
    pub fn with_status(&self, status: SyncStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_in_use(&self, in_use: bool) -> Self {
        self.reidentified(|r| r.flags = r.flags.with_in_use(in_use))
    }

    pub fn with_scene(&self, scene: Option<SceneId>) -> Self {
        self.reidentified(|r| r.scene = scene)
    }

    pub fn with_data(&self, data: [u8; 3]) -> Self {
        self.reidentified(|r| r.data = data)
    }

    pub fn with_group(&self, group: u8) -> Self {
        self.reidentified(|r| r.group = group)
    }

    pub fn with_dest(&self, dest: DeviceId) -> Self {
        self.reidentified(|r| r.dest = dest)
    }

    pub(crate) fn with_uid(&self, uid: RecordUid) -> Self {
        Self {
            uid,
            ..self.clone()
        }
    }

    fn reidentified(&self, edit: impl FnOnce(&mut Self)) -> Self {
        let mut copy = self.clone();
        edit(&mut copy);
        copy.uid = RecordUid::next();
        copy
    }

    /// The opposite-role record that `peer` would hold for this link,
    /// assuming this record lives on `id`.
    pub fn complement_of(&self, id: DeviceId) -> Self {
        let flags = RecordFlags::for_role(self.role().opposite()).with_in_use(self.is_in_use());
        Self {
            scene: self.scene,
            ..Self::new(id, self.group, flags, self.data)
        }
    }

    // ── Comparisons ──────────────────────────────────────────────────

    /// Identity equality: peer, group, role and data bytes. A missing scene
    /// tag on either side matches any scene.
    pub fn matches(&self, other: &Self) -> bool {
        self.dest == other.dest
            && self.group == other.group
            && self.is_controller() == other.is_controller()
            && self.data == other.data
            && match (self.scene, other.scene) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// What a device would store: peer, group, full flags byte and data.
    pub fn same_content(&self, other: &Self) -> bool {
        self.dest == other.dest
            && self.group == other.group
            && self.flags == other.flags
            && self.data == other.data
    }

    /// Key used to correlate hub records, whose table order is meaningless.
    pub fn hub_key(&self) -> (DeviceId, u8, LinkRole) {
        (self.dest, self.group, self.role())
    }

    // ── Wire format ──────────────────────────────────────────────────

    /// Decode the 14-byte extended payload of a link-table read response.
    /// Returns the record's memory address alongside the record.
    pub fn decode_aldb_response(payload: &[u8]) -> Result<(u16, Self), MalformedRecordError> {
        if payload.len() != ALDB_PAYLOAD_LEN {
            return Err(MalformedRecordError::Length {
                expected: ALDB_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        let (body, received) = payload.split_at(ALDB_PAYLOAD_LEN - 1);
        let computed = extended_checksum(ALDB_COMMAND, 0x00, body);
        if received.first() != Some(&computed) {
            return Err(MalformedRecordError::Checksum {
                computed,
                received: received.first().copied().unwrap_or_default(),
            });
        }

        let mut buf = body;
        expect_fixed(1, 0x00, buf.get_u8())?;
        expect_fixed(2, ALDB_READ_RESPONSE, buf.get_u8())?;
        let address = buf.get_u16();
        expect_fixed(5, 0x00, buf.get_u8())?;
        let record = Self::read_fields(&mut buf);
        Ok((address, record))
    }

    /// Encode the 14-byte extended payload that writes this record at `address`.
    pub fn encode_aldb_write(&self, address: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALDB_PAYLOAD_LEN);
        buf.put_u8(0x00);
        buf.put_u8(ALDB_WRITE_REQUEST);
        buf.put_u16(address);
        buf.put_u8(RECORD_SIZE as u8);
        self.write_fields(&mut buf);
        let checksum = extended_checksum(ALDB_COMMAND, 0x00, &buf);
        buf.put_u8(checksum);
        buf.freeze()
    }

    /// Encode the read-response payload a device sends for this record.
    pub fn encode_aldb_response(&self, address: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALDB_PAYLOAD_LEN);
        buf.put_u8(0x00);
        buf.put_u8(ALDB_READ_RESPONSE);
        buf.put_u16(address);
        buf.put_u8(0x00);
        self.write_fields(&mut buf);
        let checksum = extended_checksum(ALDB_COMMAND, 0x00, &buf);
        buf.put_u8(checksum);
        buf.freeze()
    }

    /// Decode a write payload produced by [`Self::encode_aldb_write`].
    pub fn decode_aldb_write(payload: &[u8]) -> Result<(u16, Self), MalformedRecordError> {
        if payload.len() != ALDB_PAYLOAD_LEN {
            return Err(MalformedRecordError::Length {
                expected: ALDB_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        let (body, received) = payload.split_at(ALDB_PAYLOAD_LEN - 1);
        let computed = extended_checksum(ALDB_COMMAND, 0x00, body);
        if received.first() != Some(&computed) {
            return Err(MalformedRecordError::Checksum {
                computed,
                received: received.first().copied().unwrap_or_default(),
            });
        }

        let mut buf = body;
        expect_fixed(1, 0x00, buf.get_u8())?;
        expect_fixed(2, ALDB_WRITE_REQUEST, buf.get_u8())?;
        let address = buf.get_u16();
        expect_fixed(5, RECORD_SIZE as u8, buf.get_u8())?;
        Ok((address, Self::read_fields(&mut buf)))
    }

    /// Decode an 8-byte hub (IM) ALL-Link record.
    pub fn decode_im_record(raw: &[u8]) -> Result<Self, MalformedRecordError> {
        if raw.len() != IM_RECORD_LEN {
            return Err(MalformedRecordError::Length {
                expected: IM_RECORD_LEN,
                actual: raw.len(),
            });
        }
        let mut buf = raw;
        Ok(Self::read_fields(&mut buf))
    }

    /// The 8 on-wire record bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let [a, b, c] = self.dest.as_bytes();
        let [d1, d2, d3] = self.data;
        [self.flags.bits(), self.group, a, b, c, d1, d2, d3]
    }

    fn read_fields(buf: &mut impl Buf) -> Self {
        let flags = RecordFlags::from_bits(buf.get_u8());
        let group = buf.get_u8();
        let dest = DeviceId::new([buf.get_u8(), buf.get_u8(), buf.get_u8()]);
        let data = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
        Self {
            status: SyncStatus::Synced,
            ..Self::new(dest, group, flags, data)
        }
    }

    fn write_fields(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.to_bytes());
    }
}

impl fmt::Display for LinkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_high_water_mark() {
            return write!(f, "<high-water mark>");
        }
        let role = if self.is_controller() { "C" } else { "R" };
        let [d1, d2, d3] = self.data;
        write!(
            f,
            "{role} {} g{} [{d1:02X} {d2:02X} {d3:02X}]{}",
            self.dest,
            self.group,
            if self.is_in_use() { "" } else { " (unused)" }
        )
    }
}

fn expect_fixed(position: usize, expected: u8, actual: u8) -> Result<(), MalformedRecordError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MalformedRecordError::FixedByte {
            position,
            expected,
            actual,
        })
    }
}

/// Two's-complement checksum of an extended message.
pub fn extended_checksum(cmd1: u8, cmd2: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(cmd1.wrapping_add(cmd2), |sum, b| sum.wrapping_add(*b))
        .wrapping_neg()
}

/// Memory address of the record at position `seq`.
pub fn address_for_seq(seq: usize) -> Option<u16> {
    let offset = u16::try_from(seq).ok()?.checked_mul(RECORD_SIZE)?;
    TABLE_BASE_ADDRESS.checked_sub(offset)
}

/// Position of the record stored at memory address `address`.
pub fn seq_for_address(address: u16) -> Result<usize, MalformedRecordError> {
    let offset = TABLE_BASE_ADDRESS
        .checked_sub(address)
        .ok_or(MalformedRecordError::Address { address })?;
    if offset % RECORD_SIZE != 0 {
        return Err(MalformedRecordError::Address { address });
    }
    Ok(usize::from(offset / RECORD_SIZE))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peer() -> DeviceId {
        DeviceId::new([0x11, 0x22, 0x33])
    }

    #[test]
    fn clone_preserves_uid() {
        let rec = LinkRecord::controller(peer(), 1, [3, 0, 1]);
        assert_eq!(rec.clone().uid(), rec.uid());
    }

    #[test]
    fn status_change_keeps_uid() {
        let rec = LinkRecord::controller(peer(), 1, [3, 0, 1]);
        let synced = rec.with_status(SyncStatus::Synced);
        assert_eq!(synced.uid(), rec.uid());
        assert_eq!(synced.status(), SyncStatus::Synced);
    }

    #[test]
    fn identity_change_resets_uid() {
        let rec = LinkRecord::responder(peer(), 1, [0xFF, 0x1F, 1]);
        for changed in [
            rec.with_group(2),
            rec.with_data([0, 0, 0]),
            rec.with_in_use(false),
            rec.with_scene(Some(SceneId::new(4))),
            rec.with_dest(DeviceId::new([1, 2, 3])),
        ] {
            assert_ne!(changed.uid(), rec.uid());
            assert!(!changed.uid().is_none());
        }
    }

    #[test]
    fn scene_tag_is_wildcard_for_identity() {
        let rec = LinkRecord::responder(peer(), 1, [0xFF, 0x1F, 1]);
        let tagged = rec.with_scene(Some(SceneId::new(9)));
        assert!(rec.matches(&tagged));
        assert!(!tagged.matches(&rec.with_scene(Some(SceneId::new(8)))));
        assert!(!rec.matches(&rec.with_group(2)));
        assert_ne!(rec, tagged);
    }

    #[test]
    fn high_water_mark_is_recognised() {
        assert!(LinkRecord::high_water_mark().is_high_water_mark());
        assert!(!LinkRecord::placeholder().is_high_water_mark());
        assert!(!LinkRecord::placeholder().is_in_use());
    }

    #[test]
    fn complement_flips_role_and_peer() {
        let here = DeviceId::new([0xAA, 0xBB, 0xCC]);
        let rec = LinkRecord::controller(peer(), 5, [3, 0, 5]);
        let complement = rec.complement_of(here);
        assert!(complement.is_responder());
        assert_eq!(complement.dest(), here);
        assert_eq!(complement.group(), 5);
    }

    #[test]
    fn aldb_response_and_write_decode() {
        let rec = LinkRecord::controller(peer(), 7, [3, 0, 7]);
        let (address, decoded) =
            LinkRecord::decode_aldb_response(&rec.encode_aldb_response(0x0FF7)).unwrap();
        assert_eq!(address, 0x0FF7);
        assert!(decoded.same_content(&rec));
        assert_eq!(decoded.status(), SyncStatus::Synced);

        let (address, written) = LinkRecord::decode_aldb_write(&rec.encode_aldb_write(0x0FEF)).unwrap();
        assert_eq!(address, 0x0FEF);
        assert!(written.same_content(&rec));
        // A write request is not a read response.
        assert!(LinkRecord::decode_aldb_response(&rec.encode_aldb_write(0x0FEF)).is_err());
    }

    #[test]
    fn aldb_decode_rejects_bad_checksum_and_fixed_bytes() {
        let rec = LinkRecord::responder(peer(), 1, [0xFF, 0x1F, 1]);
        let mut payload = rec.encode_aldb_write(0x0FFF).to_vec();
        payload[1] = ALDB_READ_RESPONSE;
        payload[4] = 0x00;
        payload[13] = 0x00;
        assert!(matches!(
            LinkRecord::decode_aldb_response(&payload),
            Err(MalformedRecordError::Checksum { .. })
        ));

        payload[0] = 0x05;
        payload[13] = extended_checksum(ALDB_COMMAND, 0x00, &payload[..13]);
        assert!(matches!(
            LinkRecord::decode_aldb_response(&payload),
            Err(MalformedRecordError::FixedByte { position: 1, .. })
        ));

        assert!(matches!(
            LinkRecord::decode_aldb_response(&payload[..10]),
            Err(MalformedRecordError::Length { .. })
        ));
    }

    #[test]
    fn im_record_decodes_eight_bytes() {
        let rec = LinkRecord::decode_im_record(&[0xE2, 0x01, 0x11, 0x22, 0x33, 0x01, 0x20, 0x41])
            .unwrap();
        assert!(rec.is_controller());
        assert!(rec.is_in_use());
        assert_eq!(rec.dest(), peer());
        assert_eq!(rec.data(), [0x01, 0x20, 0x41]);
        assert!(LinkRecord::decode_im_record(&[0xE2]).is_err());
    }

    #[test]
    fn addresses_map_to_positions() {
        assert_eq!(address_for_seq(0), Some(0x0FFF));
        assert_eq!(address_for_seq(2), Some(0x0FEF));
        assert_eq!(seq_for_address(0x0FEF).unwrap(), 2);
        assert!(seq_for_address(0x0FEE).is_err());
        assert!(seq_for_address(0x1000).is_err());
    }
}
