//! Streaming VCDIFF (RFC 3284) delta decoding.
//!
//! Delta artifacts carry a VCDIFF patch produced against the currently
//! active rootfs. [`apply_patch`] streams such a patch window by window:
//! the source segment of each window is read from the active partition,
//! the decoded target window is written to the inactive partition, and the
//! optional Adler-32 window checksum (the `VCD_ADLER32` extension used by
//! xdelta) is verified before any byte leaves the decoder.
//!
//! A delta window consists of a window header (source segment length and
//! position, delta encoding length, target window length, and the three
//! section lengths), followed by the concatenated data, instruction, and
//! address sections. Instructions are decoded through the code table of
//! [`code_table`]; copy addresses run through the near/same address caches
//! which are reinitialized at the start of every window.
//!
//! Secondary compression of the sections and application-defined code
//! tables are encoder-side extensions outside RFC 3284; both are rejected
//! with a dedicated error so a mismatched server encoder is detected
//! loudly instead of corrupting a partition.

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::debug;

use code_table::{default_table, Instruction, InstructionKind};

pub mod code_table;

const MAGIC: [u8; 3] = [0xD6, 0xC3, 0xC4];
const VERSION: u8 = 0x00;

// Header indicator bits.
const VCD_DECOMPRESS: u8 = 0x01;
const VCD_CODETABLE: u8 = 0x02;
/// Application header (xdelta extension).
const VCD_APPHEADER: u8 = 0x04;

// Window indicator bits.
const VCD_SOURCE: u8 = 0x01;
const VCD_TARGET: u8 = 0x02;
/// Adler-32 window checksum (xdelta extension).
const VCD_ADLER32: u8 = 0x04;

/// Number of near address cache slots of the default code table.
const NEAR_SLOTS: usize = 4;
/// Number of same address cache slots of the default code table.
const SAME_SLOTS: usize = 3;

/// Largest window the decoder accepts. Bounds the decoder's memory use;
/// xdelta's encoder windows stay well below this.
const MAX_WINDOW_SIZE: u64 = 64 * 1024 * 1024;

/// Error decoding a delta patch.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid VCDIFF magic")]
    InvalidMagic,
    #[error("unsupported VCDIFF version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unsupported header indicator {0:#04x}")]
    UnsupportedHeader(u8),
    #[error("patch uses secondary compression")]
    SecondaryCompression,
    #[error("patch uses an application-defined code table")]
    CustomCodeTable,
    #[error("patch window references data from previous target windows")]
    TargetWindow,
    #[error("patch window exceeds the maximum supported size")]
    WindowTooLarge,
    #[error("invalid instruction code {code} in patch window")]
    InvalidInstruction { code: u8 },
    #[error("copy address out of bounds")]
    BadAddress,
    #[error("section of patch window has trailing or missing data")]
    SectionMismatch,
    #[error("decoded window size does not match the declared size")]
    WindowSizeMismatch,
    #[error("target window checksum mismatch (expected {expected:#010x}, found {found:#010x})")]
    ChecksumMismatch { expected: u32, found: u32 },
    #[error("varint overflow in patch")]
    VarintOverflow,
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, DeltaError> {
    let mut byte = [0];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read a big-endian base-128 integer.
fn read_varint<R: Read>(reader: &mut R) -> Result<u64, DeltaError> {
    let mut value: u64 = 0;
    loop {
        let byte = read_u8(reader)?;
        if value > u64::MAX >> 7 {
            return Err(DeltaError::VarintOverflow);
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn read_usize<R: Read>(reader: &mut R, max: u64) -> Result<usize, DeltaError> {
    let value = read_varint(reader)?;
    if value > max {
        return Err(DeltaError::WindowTooLarge);
    }
    Ok(value as usize)
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // Largest number of bytes that can be summed before `b` may overflow.
    const CHUNK: usize = 5552;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(CHUNK) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Near and same address caches (RFC 3284, section 5.1).
struct AddressCache {
    near: [u64; NEAR_SLOTS],
    next_slot: usize,
    same: [u64; SAME_SLOTS * 256],
}

impl AddressCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_SLOTS],
            next_slot: 0,
            same: [0; SAME_SLOTS * 256],
        }
    }

    fn reset(&mut self) {
        self.near = [0; NEAR_SLOTS];
        self.next_slot = 0;
        self.same = [0; SAME_SLOTS * 256];
    }

    fn decode(&mut self, mode: u8, here: u64, addrs: &mut &[u8]) -> Result<u64, DeltaError> {
        let mode = mode as usize;
        let addr = match mode {
            0 => read_varint(addrs)?,
            1 => here
                .checked_sub(read_varint(addrs)?)
                .ok_or(DeltaError::BadAddress)?,
            _ if mode < 2 + NEAR_SLOTS => self.near[mode - 2]
                .checked_add(read_varint(addrs)?)
                .ok_or(DeltaError::BadAddress)?,
            _ if mode < 2 + NEAR_SLOTS + SAME_SLOTS => {
                let index = (mode - 2 - NEAR_SLOTS) * 256 + read_u8(addrs)? as usize;
                self.same[index]
            }
            _ => return Err(DeltaError::BadAddress),
        };
        self.update(addr);
        Ok(addr)
    }

    fn update(&mut self, addr: u64) {
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % NEAR_SLOTS;
        self.same[(addr % (SAME_SLOTS as u64 * 256)) as usize] = addr;
    }
}

/// Apply a VCDIFF patch.
///
/// Streams `patch`, resolving copy instructions against `source`, and
/// writes the decoded target to `output`. Returns the number of target
/// bytes written.
pub fn apply_patch<P, S, W>(mut patch: P, mut source: S, mut output: W) -> Result<u64, DeltaError>
where
    P: Read,
    S: Read + Seek,
    W: Write,
{
    let mut magic = [0; 3];
    patch.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(DeltaError::InvalidMagic);
    }
    let version = read_u8(&mut patch)?;
    if version != VERSION {
        return Err(DeltaError::UnsupportedVersion(version));
    }
    let hdr_indicator = read_u8(&mut patch)?;
    if hdr_indicator & VCD_DECOMPRESS != 0 {
        return Err(DeltaError::SecondaryCompression);
    }
    if hdr_indicator & VCD_CODETABLE != 0 {
        return Err(DeltaError::CustomCodeTable);
    }
    if hdr_indicator & !(VCD_DECOMPRESS | VCD_CODETABLE | VCD_APPHEADER) != 0 {
        return Err(DeltaError::UnsupportedHeader(hdr_indicator));
    }
    if hdr_indicator & VCD_APPHEADER != 0 {
        // The application header carries encoder metadata we do not use.
        let length = read_usize(&mut patch, MAX_WINDOW_SIZE)?;
        io::copy(&mut (&mut patch).take(length as u64), &mut io::sink())?;
    }

    let mut cache = AddressCache::new();
    let mut total_written = 0u64;
    let mut window_index = 0u64;
    loop {
        let mut byte = [0];
        // A clean end of the patch stream terminates the window loop.
        if patch.read(&mut byte)? == 0 {
            break;
        }
        let win_indicator = byte[0];
        let written = decode_window(
            win_indicator,
            &mut patch,
            &mut source,
            &mut output,
            &mut cache,
        )?;
        debug!(
            "decoded delta window {} ({} target bytes)",
            window_index, written
        );
        total_written += written;
        window_index += 1;
    }
    Ok(total_written)
}

fn decode_window<P, S, W>(
    win_indicator: u8,
    patch: &mut P,
    source: &mut S,
    output: &mut W,
    cache: &mut AddressCache,
) -> Result<u64, DeltaError>
where
    P: Read,
    S: Read + Seek,
    W: Write,
{
    if win_indicator & VCD_TARGET != 0 {
        return Err(DeltaError::TargetWindow);
    }
    let (src_len, src_pos) = if win_indicator & VCD_SOURCE != 0 {
        let len = read_usize(patch, MAX_WINDOW_SIZE)?;
        let pos = read_varint(patch)?;
        (len, pos)
    } else {
        (0, 0)
    };
    // The delta encoding length is redundant with the section lengths.
    let _delta_len = read_varint(patch)?;
    let target_len = read_usize(patch, MAX_WINDOW_SIZE)?;
    let delta_indicator = read_u8(patch)?;
    if delta_indicator != 0 {
        return Err(DeltaError::SecondaryCompression);
    }
    let data_len = read_usize(patch, MAX_WINDOW_SIZE)?;
    let inst_len = read_usize(patch, MAX_WINDOW_SIZE)?;
    let addr_len = read_usize(patch, MAX_WINDOW_SIZE)?;
    let checksum = if win_indicator & VCD_ADLER32 != 0 {
        let mut bytes = [0; 4];
        patch.read_exact(&mut bytes)?;
        Some(u32::from_be_bytes(bytes))
    } else {
        None
    };

    let mut src = vec![0; src_len];
    if src_len > 0 {
        source.seek(SeekFrom::Start(src_pos))?;
        source.read_exact(&mut src)?;
    }
    let mut data = vec![0; data_len];
    patch.read_exact(&mut data)?;
    let mut inst = vec![0; inst_len];
    patch.read_exact(&mut inst)?;
    let mut addr = vec![0; addr_len];
    patch.read_exact(&mut addr)?;

    cache.reset();
    let table = default_table();
    let mut target = Vec::with_capacity(target_len);
    let mut data_pos = 0usize;
    let mut insts: &[u8] = &inst;
    let mut addrs: &[u8] = &addr;
    while !insts.is_empty() {
        let code = read_u8(&mut insts)?;
        let entry = table.entry(code);
        for half in [entry.first, entry.second] {
            execute(
                code, half, &mut insts, &mut addrs, &data, &mut data_pos, &src, &mut target, cache,
            )?;
        }
    }

    if target.len() != target_len {
        return Err(DeltaError::WindowSizeMismatch);
    }
    if data_pos != data.len() || !addrs.is_empty() {
        return Err(DeltaError::SectionMismatch);
    }
    if let Some(expected) = checksum {
        let found = adler32(&target);
        if found != expected {
            return Err(DeltaError::ChecksumMismatch { expected, found });
        }
    }
    output.write_all(&target)?;
    Ok(target.len() as u64)
}

#[allow(clippy::too_many_arguments)]
fn execute(
    code: u8,
    instruction: Instruction,
    insts: &mut &[u8],
    addrs: &mut &[u8],
    data: &[u8],
    data_pos: &mut usize,
    src: &[u8],
    target: &mut Vec<u8>,
    cache: &mut AddressCache,
) -> Result<(), DeltaError> {
    let size = match instruction.size {
        0 if instruction.kind != InstructionKind::Noop => {
            read_usize(insts, MAX_WINDOW_SIZE)?
        }
        size => size as usize,
    };
    match instruction.kind {
        InstructionKind::Noop => {}
        InstructionKind::Add => {
            let end = data_pos
                .checked_add(size)
                .filter(|end| *end <= data.len())
                .ok_or(DeltaError::SectionMismatch)?;
            target.extend_from_slice(&data[*data_pos..end]);
            *data_pos = end;
        }
        InstructionKind::Run => {
            if *data_pos >= data.len() {
                return Err(DeltaError::SectionMismatch);
            }
            let byte = data[*data_pos];
            *data_pos += 1;
            target.resize(target.len() + size, byte);
        }
        InstructionKind::Copy => {
            let here = src.len() as u64 + target.len() as u64;
            let addr = cache.decode(instruction.mode, here, addrs)?;
            if addr >= here {
                return Err(DeltaError::BadAddress);
            }
            if size == 0 {
                return Err(DeltaError::InvalidInstruction { code });
            }
            // Copies may overlap their own output; resolve byte by byte
            // against the virtual source-then-target array.
            for offset in 0..size as u64 {
                let position = addr + offset;
                let byte = if (position as usize) < src.len() {
                    src[position as usize]
                } else {
                    target[position as usize - src.len()]
                };
                target.push(byte);
            }
        }
    }
    Ok(())
}
