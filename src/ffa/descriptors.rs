//! FF-A v1.1 memory transaction descriptors (DEN0077A chapter 10).
//!
//! Wire structs are `#[repr(C, packed)]` and read/written through
//! `zerocopy`. Everything above the wire level works on typed fields:
//! permissions, attributes and region flags each have one encode/decode
//! pair, and every reserved encoding is a variant of its own so a test can
//! ask for it directly.

use core::mem::size_of;

use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use super::{EndpointId, FfaError, Handle, FFA_PAGE_SIZE};

// ── Wire layout ─────────────────────────────────────────────────────

/// FF-A v1.1 Memory Transaction Descriptor (DEN0077A Table 10.20).
///
/// Header of every DONATE/LEND/SHARE descriptor, retrieve request and
/// retrieve response. Size: 48 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MemRegionRaw {
    /// Sender endpoint ID
    pub sender_id: u16,
    /// Memory region attributes (Table 10.18)
    pub attributes: u16,
    /// Flags (Table 10.21 / 10.22)
    pub flags: u32,
    /// Handle (0 on a transfer, assigned by the relayer)
    pub handle: u64,
    /// Tag (sender-defined)
    pub tag: u64,
    /// Size of each endpoint memory access descriptor
    pub access_desc_size: u32,
    /// Number of endpoint memory access descriptors
    pub receiver_count: u32,
    /// Offset from start of this struct to the first access descriptor
    pub receivers_offset: u32,
    /// Reserved (MBZ)
    pub reserved: [u8; 12],
}

/// Endpoint Memory Access Descriptor (DEN0077A Table 10.16). Size: 16 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MemAccessRaw {
    pub receiver_id: u16,
    /// Memory access permissions (Table 10.15)
    pub permissions: u8,
    pub flags: u8,
    /// Offset from start of the transaction descriptor to the composite
    /// descriptor, 0 when absent (retrieve request)
    pub composite_offset: u32,
    pub reserved: u64,
}

/// Composite Memory Region Descriptor header (DEN0077A Table 10.13).
/// Size: 16 bytes, followed by `range_count` constituents.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CompositeRaw {
    pub total_page_count: u32,
    pub range_count: u32,
    pub reserved: u64,
}

/// Constituent Memory Region Descriptor (DEN0077A Table 10.14). Size: 16 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ConstituentRaw {
    /// Base address, 4KB aligned
    pub address: u64,
    /// Number of 4KB pages
    pub page_count: u32,
    pub reserved: u32,
}

/// Memory Relinquish Descriptor header (DEN0077A Table 16.25), followed by
/// `endpoint_count` 16-bit endpoint IDs. Size: 16 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RelinquishRaw {
    pub handle: u64,
    pub flags: u32,
    pub endpoint_count: u32,
}

pub const MEM_REGION_SIZE: usize = size_of::<MemRegionRaw>();
pub const MEM_ACCESS_SIZE: usize = size_of::<MemAccessRaw>();
pub const COMPOSITE_SIZE: usize = size_of::<CompositeRaw>();
pub const CONSTITUENT_SIZE: usize = size_of::<ConstituentRaw>();
pub const RELINQUISH_SIZE: usize = size_of::<RelinquishRaw>();

/// Offset of the composite descriptor when one receiver is described.
pub const COMPOSITE_OFFSET: usize = MEM_REGION_SIZE + MEM_ACCESS_SIZE;
/// Offset of the first constituent when one receiver is described.
pub const CONSTITUENTS_OFFSET: usize = COMPOSITE_OFFSET + COMPOSITE_SIZE;

/// Bounds-checked read of a wire struct at `off`.
fn read_at<T: FromBytes>(buf: &[u8], off: usize) -> Result<T, FfaError> {
    let end = off
        .checked_add(size_of::<T>())
        .ok_or(FfaError::InvalidParameters)?;
    let bytes = buf.get(off..end).ok_or(FfaError::InvalidParameters)?;
    T::read_from_bytes(bytes).map_err(|_| FfaError::InvalidParameters)
}

fn write_at<T: IntoBytes + Immutable>(buf: &mut [u8], off: usize, value: &T) {
    let bytes = value.as_bytes();
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

// ── Access permissions (Table 10.15) ────────────────────────────────

/// Data access permission, bits[1:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccess {
    NotSpecified,
    ReadOnly,
    ReadWrite,
    Reserved,
}

impl DataAccess {
    const SHIFT: usize = 0;
    const MASK: u8 = 0b11;
}

impl From<u8> for DataAccess {
    fn from(perms: u8) -> Self {
        match (perms >> Self::SHIFT) & Self::MASK {
            0b00 => Self::NotSpecified,
            0b01 => Self::ReadOnly,
            0b10 => Self::ReadWrite,
            _ => Self::Reserved,
        }
    }
}

impl From<DataAccess> for u8 {
    fn from(value: DataAccess) -> Self {
        (match value {
            DataAccess::NotSpecified => 0b00,
            DataAccess::ReadOnly => 0b01,
            DataAccess::ReadWrite => 0b10,
            DataAccess::Reserved => 0b11,
        }) << DataAccess::SHIFT
    }
}

/// Instruction access permission, bits[3:2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionAccess {
    NotSpecified,
    NotExecutable,
    Executable,
    Reserved,
}

impl InstructionAccess {
    const SHIFT: usize = 2;
    const MASK: u8 = 0b11;
}

impl From<u8> for InstructionAccess {
    fn from(perms: u8) -> Self {
        match (perms >> Self::SHIFT) & Self::MASK {
            0b00 => Self::NotSpecified,
            0b01 => Self::NotExecutable,
            0b10 => Self::Executable,
            _ => Self::Reserved,
        }
    }
}

impl From<InstructionAccess> for u8 {
    fn from(value: InstructionAccess) -> Self {
        (match value {
            InstructionAccess::NotSpecified => 0b00,
            InstructionAccess::NotExecutable => 0b01,
            InstructionAccess::Executable => 0b10,
            InstructionAccess::Reserved => 0b11,
        }) << InstructionAccess::SHIFT
    }
}

// ── Memory region attributes (Table 10.18) ──────────────────────────

/// Device memory attributes, bits[3:2] when the type is Device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttr {
    NGnRnE,
    NGnRE,
    NGRE,
    GRE,
}

/// Normal memory cacheability, bits[3:2] when the type is Normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    NonCacheable,
    WriteBack,
    /// 0b00 or 0b10
    Reserved(u8),
}

/// Shareability, bits[1:0] when the type is Normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shareability {
    NonShareable,
    Reserved,
    Outer,
    Inner,
}

/// Memory type, bits[5:4], with the type-specific attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    NotSpecified,
    Device(DeviceAttr),
    Normal {
        cacheability: Cacheability,
        shareability: Shareability,
    },
    Reserved,
}

impl MemType {
    /// Normal, write-back, inner shareable: what a plain RAM transfer uses.
    pub const NORMAL_WB: Self = Self::Normal {
        cacheability: Cacheability::WriteBack,
        shareability: Shareability::Inner,
    };

    pub fn is_reserved_encoding(&self) -> bool {
        matches!(
            self,
            Self::Reserved
                | Self::Normal {
                    cacheability: Cacheability::Reserved(_),
                    ..
                }
                | Self::Normal {
                    shareability: Shareability::Reserved,
                    ..
                }
        )
    }
}

/// Full 16-bit attributes field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAttributes {
    pub mem_type: MemType,
    /// Bit 6, set by the relayer in retrieve responses
    pub non_secure: bool,
    /// Bits[15:7] in place, MBZ
    pub reserved: u16,
}

impl MemAttributes {
    const TYPE_SHIFT: usize = 4;
    const ATTR_SHIFT: usize = 2;
    const NS_BIT: u16 = 1 << 6;
    const RESERVED_MASK: u16 = 0xFF80;

    pub const fn new(mem_type: MemType) -> Self {
        Self {
            mem_type,
            non_secure: false,
            reserved: 0,
        }
    }
}

impl Default for MemAttributes {
    fn default() -> Self {
        Self::new(MemType::NotSpecified)
    }
}

impl From<u16> for MemAttributes {
    fn from(raw: u16) -> Self {
        let attr = ((raw >> Self::ATTR_SHIFT) & 0b11) as u8;
        let share = (raw & 0b11) as u8;
        let mem_type = match (raw >> Self::TYPE_SHIFT) & 0b11 {
            0b00 => MemType::NotSpecified,
            0b01 => MemType::Device(match attr {
                0b00 => DeviceAttr::NGnRnE,
                0b01 => DeviceAttr::NGnRE,
                0b10 => DeviceAttr::NGRE,
                _ => DeviceAttr::GRE,
            }),
            0b10 => MemType::Normal {
                cacheability: match attr {
                    0b01 => Cacheability::NonCacheable,
                    0b11 => Cacheability::WriteBack,
                    v => Cacheability::Reserved(v),
                },
                shareability: match share {
                    0b00 => Shareability::NonShareable,
                    0b01 => Shareability::Reserved,
                    0b10 => Shareability::Outer,
                    _ => Shareability::Inner,
                },
            },
            _ => MemType::Reserved,
        };
        Self {
            mem_type,
            non_secure: raw & Self::NS_BIT != 0,
            reserved: raw & Self::RESERVED_MASK,
        }
    }
}

impl From<MemAttributes> for u16 {
    fn from(value: MemAttributes) -> Self {
        let (ty, attr, share): (u16, u16, u16) = match value.mem_type {
            MemType::NotSpecified => (0b00, 0, 0),
            MemType::Device(d) => (
                0b01,
                match d {
                    DeviceAttr::NGnRnE => 0b00,
                    DeviceAttr::NGnRE => 0b01,
                    DeviceAttr::NGRE => 0b10,
                    DeviceAttr::GRE => 0b11,
                },
                0,
            ),
            MemType::Normal {
                cacheability,
                shareability,
            } => (
                0b10,
                match cacheability {
                    Cacheability::NonCacheable => 0b01,
                    Cacheability::WriteBack => 0b11,
                    Cacheability::Reserved(v) => (v & 0b11) as u16,
                },
                match shareability {
                    Shareability::NonShareable => 0b00,
                    Shareability::Reserved => 0b01,
                    Shareability::Outer => 0b10,
                    Shareability::Inner => 0b11,
                },
            ),
            MemType::Reserved => (0b11, 0, 0),
        };
        let mut raw = (ty << MemAttributes::TYPE_SHIFT) | (attr << MemAttributes::ATTR_SHIFT) | share;
        if value.non_secure {
            raw |= MemAttributes::NS_BIT;
        }
        raw | (value.reserved & MemAttributes::RESERVED_MASK)
    }
}

// ── Region flags (Tables 10.21 and 10.22) ───────────────────────────

/// Transaction type, bits[4:3] of a retrieve request's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Unspecified,
    Share,
    Lend,
    Donate,
}

/// Address range alignment hint, bits[9:5] of a retrieve request's flags.
///
/// Bit 9 marks the hint valid and bits[8:5] carry `n`; the relayer must
/// map the region at a 2^n * 4KB boundary, `n == 0` leaving the choice to
/// the relayer. A non-zero `n` without the valid bit is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentHint {
    None,
    Boundary(u8),
    Reserved(u8),
}

impl AlignmentHint {
    const SHIFT: usize = 5;
    const VALID: u32 = 1 << 9;

    /// Required boundary in bytes, if the hint asks for one.
    pub fn boundary_bytes(&self) -> Option<u64> {
        match *self {
            Self::Boundary(n) if n > 0 => Some((FFA_PAGE_SIZE as u64) << n),
            _ => None,
        }
    }

    pub fn is_satisfied_by(&self, addr: u64) -> bool {
        self.boundary_bytes().map_or(true, |b| addr % b == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFlags {
    /// Bit 0: zero memory (transfer) / zero before retrieve (retrieve)
    pub zero_before_retrieve: bool,
    /// Bit 1: operation time slicing
    pub time_slicing: bool,
    /// Bit 2: zero after relinquish (retrieve only)
    pub zero_after_relinquish: bool,
    pub transaction_type: TransactionType,
    pub alignment_hint: AlignmentHint,
    /// Bits[31:10] in place, MBZ
    pub reserved: u32,
}

impl RegionFlags {
    const TYPE_SHIFT: usize = 3;
    pub const RESERVED_MASK: u32 = 0xFFFF_FC00;
    /// Bits a transfer descriptor may set; the rest are MBZ there.
    pub const TRANSFER_MASK: u32 = 0b11;

    pub const fn empty() -> Self {
        Self {
            zero_before_retrieve: false,
            time_slicing: false,
            zero_after_relinquish: false,
            transaction_type: TransactionType::Unspecified,
            alignment_hint: AlignmentHint::None,
            reserved: 0,
        }
    }

    pub const fn with_type(transaction_type: TransactionType) -> Self {
        let mut f = Self::empty();
        f.transaction_type = transaction_type;
        f
    }
}

impl Default for RegionFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<u32> for RegionFlags {
    fn from(raw: u32) -> Self {
        let n = ((raw >> AlignmentHint::SHIFT) & 0xF) as u8;
        let alignment_hint = if raw & AlignmentHint::VALID != 0 {
            AlignmentHint::Boundary(n)
        } else if n != 0 {
            AlignmentHint::Reserved(n)
        } else {
            AlignmentHint::None
        };
        Self {
            zero_before_retrieve: raw & 1 != 0,
            time_slicing: raw & (1 << 1) != 0,
            zero_after_relinquish: raw & (1 << 2) != 0,
            transaction_type: match (raw >> Self::TYPE_SHIFT) & 0b11 {
                0b00 => TransactionType::Unspecified,
                0b01 => TransactionType::Share,
                0b10 => TransactionType::Lend,
                _ => TransactionType::Donate,
            },
            alignment_hint,
            reserved: raw & Self::RESERVED_MASK,
        }
    }
}

impl From<RegionFlags> for u32 {
    fn from(f: RegionFlags) -> Self {
        let mut raw = 0;
        if f.zero_before_retrieve {
            raw |= 1;
        }
        if f.time_slicing {
            raw |= 1 << 1;
        }
        if f.zero_after_relinquish {
            raw |= 1 << 2;
        }
        raw |= (match f.transaction_type {
            TransactionType::Unspecified => 0b00,
            TransactionType::Share => 0b01,
            TransactionType::Lend => 0b10,
            TransactionType::Donate => 0b11,
        }) << RegionFlags::TYPE_SHIFT;
        raw |= match f.alignment_hint {
            AlignmentHint::None => 0,
            AlignmentHint::Boundary(n) => {
                AlignmentHint::VALID | (((n & 0xF) as u32) << AlignmentHint::SHIFT)
            }
            AlignmentHint::Reserved(n) => ((n & 0xF) as u32) << AlignmentHint::SHIFT,
        };
        raw | (f.reserved & RegionFlags::RESERVED_MASK)
    }
}

// ── Semantic intent ─────────────────────────────────────────────────

/// One contiguous run of pages in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constituent {
    pub address: u64,
    pub page_count: u32,
}

impl Constituent {
    pub fn new(address: u64, page_count: u32) -> Self {
        Self {
            address,
            page_count,
        }
    }

    pub fn end(&self) -> u64 {
        self.address + self.page_count as u64 * FFA_PAGE_SIZE as u64
    }
}

/// Every page address covered by `constituents`, in order.
pub fn pages_of(constituents: &[Constituent]) -> impl Iterator<Item = u64> + '_ {
    constituents.iter().flat_map(|c| {
        (0..c.page_count as u64).map(move |i| c.address + i * FFA_PAGE_SIZE as u64)
    })
}

/// Everything a transfer, retrieve request or retrieve response says about
/// a region, before it is laid out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegionIntent {
    pub sender: EndpointId,
    pub receiver: EndpointId,
    pub handle: Handle,
    pub tag: u64,
    pub flags: RegionFlags,
    pub data_access: DataAccess,
    pub instruction_access: InstructionAccess,
    pub attributes: MemAttributes,
    /// Flags byte of the access descriptor
    pub receiver_flags: u8,
    pub constituents: Vec<Constituent>,
}

impl MemRegionIntent {
    /// A one-page region at `page`: read-write, normal write-back memory,
    /// instruction access left to the relayer.
    pub fn single_page(sender: EndpointId, receiver: EndpointId, page: u64) -> Self {
        Self {
            sender,
            receiver,
            handle: Handle(0),
            tag: 0,
            flags: RegionFlags::empty(),
            data_access: DataAccess::ReadWrite,
            instruction_access: InstructionAccess::NotSpecified,
            attributes: MemAttributes::new(MemType::NORMAL_WB),
            receiver_flags: 0,
            constituents: vec![Constituent::new(page, 1)],
        }
    }

    pub fn with_constituents(mut self, constituents: Vec<Constituent>) -> Self {
        self.constituents = constituents;
        self
    }

    pub fn permissions(&self) -> u8 {
        u8::from(self.data_access) | u8::from(self.instruction_access)
    }

    pub fn total_page_count(&self) -> u32 {
        self.constituents
            .iter()
            .fold(0u32, |acc, c| acc.wrapping_add(c.page_count))
    }

    /// Serialized size with or without the composite region.
    pub fn encoded_len(&self, with_composite: bool) -> usize {
        if with_composite {
            CONSTITUENTS_OFFSET + self.constituents.len() * CONSTITUENT_SIZE
        } else {
            COMPOSITE_OFFSET
        }
    }

    /// Lay out the descriptor. Retrieve requests carry no composite.
    pub fn encode(&self, with_composite: bool) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len(with_composite)];

        let mut header = MemRegionRaw::new_zeroed();
        header.sender_id = self.sender;
        header.attributes = self.attributes.into();
        header.flags = self.flags.into();
        header.handle = self.handle.0;
        header.tag = self.tag;
        header.access_desc_size = MEM_ACCESS_SIZE as u32;
        header.receiver_count = 1;
        header.receivers_offset = MEM_REGION_SIZE as u32;
        write_at(&mut buf, 0, &header);

        let mut access = MemAccessRaw::new_zeroed();
        access.receiver_id = self.receiver;
        access.permissions = self.permissions();
        access.flags = self.receiver_flags;
        access.composite_offset = if with_composite {
            COMPOSITE_OFFSET as u32
        } else {
            0
        };
        write_at(&mut buf, MEM_REGION_SIZE, &access);

        if with_composite {
            let mut composite = CompositeRaw::new_zeroed();
            composite.total_page_count = self.total_page_count();
            composite.range_count = self.constituents.len() as u32;
            write_at(&mut buf, COMPOSITE_OFFSET, &composite);

            for (i, c) in self.constituents.iter().enumerate() {
                let mut raw = ConstituentRaw::new_zeroed();
                raw.address = c.address;
                raw.page_count = c.page_count;
                write_at(&mut buf, CONSTITUENTS_OFFSET + i * CONSTITUENT_SIZE, &raw);
            }
        }
        buf
    }
}

// ── Builder ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("descriptor of {needed} bytes exceeds the {available} byte buffer")]
    ExceedsBuffer { needed: usize, available: usize },
}

/// Length arguments of a transfer call (w1 and w2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    pub total: u32,
    pub fragment: u32,
}

fn place(encoded: &[u8], buf: &mut [u8]) -> Result<u32, BuildError> {
    if encoded.len() > buf.len() {
        return Err(BuildError::ExceedsBuffer {
            needed: encoded.len(),
            available: buf.len(),
        });
    }
    buf[..encoded.len()].copy_from_slice(encoded);
    Ok(encoded.len() as u32)
}

/// Write a DONATE/LEND/SHARE descriptor into `buf` (the TX buffer).
///
/// The whole descriptor goes in one fragment, so `fragment == total`.
pub fn build_transfer(intent: &MemRegionIntent, buf: &mut [u8]) -> Result<Lengths, BuildError> {
    let total = place(&intent.encode(true), buf)?;
    Ok(Lengths {
        total,
        fragment: total,
    })
}

/// Write a retrieve request for `intent.handle` into `buf`. Returns its length.
pub fn build_retrieve_request(intent: &MemRegionIntent, buf: &mut [u8]) -> Result<u32, BuildError> {
    place(&intent.encode(false), buf)
}

/// Write a relinquish descriptor into `buf`. Returns its length.
pub fn build_relinquish(
    handle: Handle,
    flags: u32,
    endpoints: &[EndpointId],
    buf: &mut [u8],
) -> Result<u32, BuildError> {
    let mut encoded = vec![0u8; RELINQUISH_SIZE + endpoints.len() * 2];
    let mut raw = RelinquishRaw::new_zeroed();
    raw.handle = handle.0;
    raw.flags = flags;
    raw.endpoint_count = endpoints.len() as u32;
    write_at(&mut encoded, 0, &raw);
    for (i, id) in endpoints.iter().enumerate() {
        write_at(&mut encoded, RELINQUISH_SIZE + i * 2, id);
    }
    place(&encoded, buf)
}

// ── Parser ──────────────────────────────────────────────────────────

/// Decoded transaction descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    /// First receiver's view of the region
    pub region: MemRegionIntent,
    pub receiver_count: u32,
    /// Whether a composite region followed the access descriptor
    pub has_composite: bool,
    /// Raw flags word, for reserved-bit checks
    pub raw_flags: u32,
}

/// Parse a transaction descriptor.
///
/// All offsets and counts are checked against `buf`; anything that points
/// outside it, a non-v1.1 access descriptor size, non-zero reserved header
/// bytes, a misaligned constituent or a composite page count that does not
/// match its constituents is `INVALID_PARAMETERS`.
pub fn parse_transaction(buf: &[u8]) -> Result<ParsedTransaction, FfaError> {
    let header: MemRegionRaw = read_at(buf, 0)?;
    let access_desc_size = header.access_desc_size;
    let receiver_count = header.receiver_count;
    let receivers_offset = header.receivers_offset as usize;

    if access_desc_size as usize != MEM_ACCESS_SIZE
        || receiver_count == 0
        || receivers_offset < MEM_REGION_SIZE
        || header.reserved.iter().any(|&b| b != 0)
    {
        return Err(FfaError::InvalidParameters);
    }
    let access_end = (receiver_count as usize)
        .checked_mul(MEM_ACCESS_SIZE)
        .and_then(|len| len.checked_add(receivers_offset))
        .ok_or(FfaError::InvalidParameters)?;
    if access_end > buf.len() {
        return Err(FfaError::InvalidParameters);
    }

    let access: MemAccessRaw = read_at(buf, receivers_offset)?;
    let composite_offset = access.composite_offset as usize;
    let permissions = access.permissions;

    let mut constituents = Vec::new();
    let has_composite = composite_offset != 0;
    if has_composite {
        if composite_offset < access_end {
            return Err(FfaError::InvalidParameters);
        }
        let composite: CompositeRaw = read_at(buf, composite_offset)?;
        let range_count = composite.range_count as usize;
        let first = composite_offset + COMPOSITE_SIZE;
        let end = range_count
            .checked_mul(CONSTITUENT_SIZE)
            .and_then(|len| len.checked_add(first))
            .ok_or(FfaError::InvalidParameters)?;
        if end > buf.len() {
            return Err(FfaError::InvalidParameters);
        }

        let mut pages: u64 = 0;
        for i in 0..range_count {
            let raw: ConstituentRaw = read_at(buf, first + i * CONSTITUENT_SIZE)?;
            let address = raw.address;
            let page_count = raw.page_count;
            if address % FFA_PAGE_SIZE as u64 != 0 {
                return Err(FfaError::InvalidParameters);
            }
            pages += page_count as u64;
            constituents.push(Constituent::new(address, page_count));
        }
        if pages != composite.total_page_count as u64 {
            return Err(FfaError::InvalidParameters);
        }
    }

    let raw_flags = header.flags;
    Ok(ParsedTransaction {
        region: MemRegionIntent {
            sender: header.sender_id,
            receiver: access.receiver_id,
            handle: Handle(header.handle),
            tag: header.tag,
            flags: RegionFlags::from(raw_flags),
            data_access: DataAccess::from(permissions),
            instruction_access: InstructionAccess::from(permissions),
            attributes: MemAttributes::from(header.attributes),
            receiver_flags: access.flags,
            constituents,
        },
        receiver_count,
        has_composite,
        raw_flags,
    })
}

/// Handle and flags of a transaction descriptor header, without looking
/// past the first 48 bytes.
pub fn peek_header(buf: &[u8]) -> Result<(Handle, RegionFlags), FfaError> {
    let header: MemRegionRaw = read_at(buf, 0)?;
    Ok((Handle(header.handle), RegionFlags::from(header.flags)))
}

/// Parsed relinquish descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relinquish {
    pub handle: Handle,
    pub flags: u32,
    pub endpoints: Vec<EndpointId>,
}

pub fn parse_relinquish(buf: &[u8]) -> Result<Relinquish, FfaError> {
    let raw: RelinquishRaw = read_at(buf, 0)?;
    let count = raw.endpoint_count as usize;
    let mut endpoints = Vec::with_capacity(count.min(64));
    for i in 0..count {
        endpoints.push(read_at::<u16>(buf, RELINQUISH_SIZE + i * 2)?);
    }
    Ok(Relinquish {
        handle: Handle(raw.handle),
        flags: raw.flags,
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(MEM_REGION_SIZE, 48);
        assert_eq!(MEM_ACCESS_SIZE, 16);
        assert_eq!(COMPOSITE_SIZE, 16);
        assert_eq!(CONSTITUENT_SIZE, 16);
        assert_eq!(RELINQUISH_SIZE, 16);
    }

    #[test]
    fn test_single_page_layout() {
        let mut intent = MemRegionIntent::single_page(0x8001, 0x8002, 0x4000_0000);
        intent.tag = 0xAB;
        let mut buf = [0u8; 4096];
        let len = build_transfer(&intent, &mut buf).unwrap();
        assert_eq!(len, Lengths { total: 96, fragment: 96 });

        assert_eq!(&buf[0..2], &0x8001u16.to_le_bytes());
        // Normal, WB, inner shareable
        assert_eq!(&buf[2..4], &0x2Fu16.to_le_bytes());
        assert_eq!(&buf[16..24], &0xABu64.to_le_bytes());
        assert_eq!(&buf[24..28], &16u32.to_le_bytes());
        assert_eq!(&buf[28..32], &1u32.to_le_bytes());
        assert_eq!(&buf[32..36], &48u32.to_le_bytes());
        assert_eq!(&buf[48..50], &0x8002u16.to_le_bytes());
        assert_eq!(buf[50], 0b10);
        assert_eq!(&buf[52..56], &64u32.to_le_bytes());
        assert_eq!(&buf[64..68], &1u32.to_le_bytes());
        assert_eq!(&buf[68..72], &1u32.to_le_bytes());
        assert_eq!(&buf[80..88], &0x4000_0000u64.to_le_bytes());
        assert_eq!(&buf[88..92], &1u32.to_le_bytes());
    }

    #[test]
    fn test_build_refuses_oversized() {
        let intent = MemRegionIntent::single_page(1, 2, 0x1000)
            .with_constituents((0..300).map(|i| Constituent::new(i * 0x2000, 1)).collect());
        let mut buf = [0u8; 4096];
        assert_eq!(
            build_transfer(&intent, &mut buf),
            Err(BuildError::ExceedsBuffer {
                needed: 80 + 300 * 16,
                available: 4096
            })
        );
    }

    #[test]
    fn test_retrieve_request_has_no_composite() {
        let mut intent = MemRegionIntent::single_page(0x8001, 0x8002, 0);
        intent.handle = Handle(7);
        let mut buf = [0u8; 128];
        assert_eq!(build_retrieve_request(&intent, &mut buf), Ok(64));
        let parsed = parse_transaction(&buf[..64]).unwrap();
        assert!(!parsed.has_composite);
        assert_eq!(parsed.region.handle, Handle(7));
        assert!(parsed.region.constituents.is_empty());
    }

    #[test]
    fn test_alignment_hint_encoding() {
        // bits[9:5] = 0x11: valid, n = 1, 8KB boundary
        let f = RegionFlags::from(0x11 << 5);
        assert_eq!(f.alignment_hint, AlignmentHint::Boundary(1));
        assert_eq!(f.alignment_hint.boundary_bytes(), Some(0x2000));
        // bits[9:5] = 0x08: n without the valid bit
        let f = RegionFlags::from(0x08 << 5);
        assert_eq!(f.alignment_hint, AlignmentHint::Reserved(8));
        assert_eq!(u32::from(f), 0x08 << 5);
        assert_eq!(AlignmentHint::Boundary(0).boundary_bytes(), None);
    }

    #[test]
    fn test_permission_bits() {
        assert_eq!(u8::from(DataAccess::ReadWrite) | u8::from(InstructionAccess::NotExecutable), 0b0110);
        assert_eq!(InstructionAccess::from(0b1000), InstructionAccess::Executable);
        assert_eq!(DataAccess::from(0b0011), DataAccess::Reserved);
    }

    #[test]
    fn test_attribute_bits() {
        let nc = MemAttributes::new(MemType::Normal {
            cacheability: Cacheability::NonCacheable,
            shareability: Shareability::Inner,
        });
        assert_eq!(u16::from(nc), 0x27);
        assert_eq!(MemAttributes::from(0x27), nc);
        let dev = MemAttributes::from(0x14);
        assert_eq!(dev.mem_type, MemType::Device(DeviceAttr::NGnRE));
        assert!(MemAttributes::from(0x20).mem_type.is_reserved_encoding());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let intent = MemRegionIntent::single_page(1, 2, 0x1000);
        let bytes = intent.encode(true);
        assert_eq!(
            parse_transaction(&bytes[..bytes.len() - 1]),
            Err(FfaError::InvalidParameters)
        );
        assert_eq!(parse_transaction(&bytes[..40]), Err(FfaError::InvalidParameters));
    }

    #[test]
    fn test_parse_rejects_misaligned_constituent() {
        let intent = MemRegionIntent::single_page(1, 2, 0x1800);
        assert_eq!(
            parse_transaction(&intent.encode(true)),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn test_relinquish_layout() {
        let mut buf = [0u8; 64];
        let len = build_relinquish(Handle(0x1234), 0, &[0x8002], &mut buf).unwrap();
        assert_eq!(len, 18);
        let r = parse_relinquish(&buf[..len as usize]).unwrap();
        assert_eq!(r.handle, Handle(0x1234));
        assert_eq!(r.endpoints, vec![0x8002]);
    }
}
