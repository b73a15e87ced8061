//! Sony PlayStation memory card emulation.
//!
//! Standalone peripheral emulation with no dependencies: the card engine
//! and its slot, nothing else.
//!
//! Models the card end of the console's serial link: one command byte in,
//! one response byte out per transfer, plus an out-of-band ACK line that
//! tells the host whether the card expects another byte in the current
//! transaction. The transport itself (bit timing, /ACK pulse width) is the
//! host's concern; this crate starts at the byte-transfer boundary.
//!
//! # Geometry
//!
//! 128 KiB of storage: 16 blocks x 64 sectors x 128 bytes. The sector is
//! the protocol's unit of read and write.
//!
//! # Wire protocol
//!
//! Every transaction opens with `$81` (memory card address byte) followed
//! by a command byte: `$52` read sector, `$57` write sector, `$53` get
//! card ID. The card answers the command byte with its FLAG register
//! (`$08` after power-on), then walks a fixed per-command sequence:
//!
//! - Read: ID tag `$5A $5D`, address MSB/LSB echo-back gated by a range
//!   check, command-acknowledge tag `$5C $5D`, 128 data bytes, XOR
//!   checksum, end status.
//! - Write: ID tag, address, 128 data bytes, host checksum,
//!   command-acknowledge tag, end status.
//! - Get ID: ID tag, command-acknowledge tag, `$04 $00 $00 $80`.
//!
//! The end status byte is `$47` (good), `$4E` (bad checksum) or `$FF`
//! (bad sector). Addresses above `$03FF` are poisoned to `$FFFF` for the
//! rest of the sequence; a poisoned read terminates at the address
//! echo-back, a poisoned write consumes but discards its data.

mod slot;

pub use slot::MemoryCardSlot;

/// A response or command line that may be left floating.
///
/// `None` is the high-impedance state. Wherever the card needs a concrete
/// value from a floating input it reads `$FF` (a fully pulled-up bus).
pub type TriState = Option<u8>;

/// Bytes in a sector, the protocol's read/write unit.
pub const SECTOR_SIZE: usize = 128;
/// Sectors in a block.
pub const SECTORS_PER_BLOCK: usize = 64;
/// Bytes in a block.
pub const BLOCK_SIZE: usize = SECTOR_SIZE * SECTORS_PER_BLOCK;
/// Blocks on a card.
pub const BLOCK_COUNT: usize = 16;
/// Sectors on a card.
pub const SECTOR_COUNT: usize = SECTORS_PER_BLOCK * BLOCK_COUNT;
/// Total card capacity in bytes.
pub const CARD_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT;

/// Highest addressable sector.
const LAST_SECTOR: u16 = 0x03FF;
/// Sentinel marking an out-of-range sector for the rest of a sequence.
const POISON_ADDRESS: u16 = 0xFFFF;

/// FLAG register value after power-on.
const FLAG_INIT: u8 = 0x08;

/// Address byte that opens a memory-card transaction.
const FRAME_START: u8 = 0x81;
/// Read-sector command.
const CMD_READ: u8 = 0x52;
/// Write-sector command.
const CMD_WRITE: u8 = 0x57;
/// Get-card-ID command.
const CMD_GET_ID: u8 = 0x53;

/// Memory card ID tag, first byte.
pub(crate) const CARD_ID_1: u8 = 0x5A;
/// Memory card ID tag, second byte.
pub(crate) const CARD_ID_2: u8 = 0x5D;
/// Command-acknowledge tag, first byte.
pub(crate) const CMD_ACK_1: u8 = 0x5C;
/// Command-acknowledge tag, second byte.
pub(crate) const CMD_ACK_2: u8 = 0x5D;

/// End status: operation completed.
pub(crate) const STATUS_GOOD: u8 = 0x47;
/// End status: host checksum disagreed with the card's.
const STATUS_BAD_CHECKSUM: u8 = 0x4E;
/// End status: sector address out of range.
const STATUS_BAD_SECTOR: u8 = 0xFF;

/// Get-ID payload after the command-acknowledge tag.
const ID_PAYLOAD: [u8; 4] = [0x04, 0x00, 0x00, 0x80];

/// Top-level protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not in a transaction; waiting for `$81`.
    Idle,
    /// `$81` seen; next byte selects the command.
    AwaitingCommand,
    /// Inside a read-sector sequence.
    Reading(ReadStep),
    /// Inside a write-sector sequence.
    Writing(WriteStep),
    /// Inside a get-ID sequence.
    Identify(IdStep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStep {
    CardId1,
    CardId2,
    AddressMsb,
    AddressLsb,
    CommandAck1,
    CommandAck2,
    ConfirmMsb,
    ConfirmLsb,
    Data,
    Checksum,
    EndByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStep {
    CardId1,
    CardId2,
    AddressMsb,
    AddressLsb,
    Data,
    Checksum,
    CommandAck1,
    CommandAck2,
    EndByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdStep {
    CardId1,
    CardId2,
    CommandAck1,
    CommandAck2,
    Info1,
    Info2,
    Info3,
    Info4,
}

/// A virtual PS1 memory card.
///
/// The card is a passive responder: it never retries, never times out, and
/// holds no notion of elapsed time. Its behaviour on a transfer is a pure
/// function of its state after the previous transfer and the new command
/// byte.
pub struct MemoryCard {
    powered_on: bool,
    /// FLAG status register, sent in response to every command byte.
    flag: u8,
    state: State,
    /// Sector address for the current sequence ($FFFF once poisoned).
    address: u16,
    /// Running XOR over address bytes and sector data.
    checksum: u8,
    /// Data bytes transferred so far in the current sequence.
    byte_counter: u8,
    /// Whether the host's write checksum matched ours.
    checksum_ok: bool,
    bytes: Box<[u8; CARD_SIZE]>,
}

impl MemoryCard {
    /// Create a card with all storage bytes zeroed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            powered_on: false,
            flag: FLAG_INIT,
            state: State::Idle,
            address: 0,
            checksum: 0,
            byte_counter: 0,
            checksum_ok: false,
            bytes: Box::new([0; CARD_SIZE]),
        }
    }

    /// Create a card whose storage is initialised from `data`.
    #[must_use]
    pub fn from_bytes(data: [u8; CARD_SIZE]) -> Self {
        let mut card = Self::new();
        *card.bytes = data;
        card
    }

    /// Power the card up, as happens on insertion into a slot.
    ///
    /// Resets FLAG and the protocol state; storage is preserved. Returns
    /// `false` (and does nothing) if the card is already powered.
    pub fn power_on(&mut self) -> bool {
        if self.powered_on {
            return false;
        }
        self.powered_on = true;
        self.flag = FLAG_INIT;
        self.state = State::Idle;
        true
    }

    /// Power the card down, as happens on removal from a slot.
    ///
    /// Returns `false` if the card is already unpowered.
    pub fn power_off(&mut self) -> bool {
        std::mem::replace(&mut self.powered_on, false)
    }

    /// Whether the card is currently powered.
    #[must_use]
    pub fn powered_on(&self) -> bool {
        self.powered_on
    }

    /// Execute one byte-level exchange.
    ///
    /// Returns `(ack, data)`: `ack` is the out-of-band "another byte
    /// expected" signal, `data` the response line. An unpowered card
    /// returns `(false, None)` unconditionally.
    pub fn transfer(&mut self, command: TriState) -> (bool, TriState) {
        if !self.powered_on {
            return (false, None);
        }
        match self.state {
            State::Idle => {
                if command == Some(FRAME_START) {
                    self.state = State::AwaitingCommand;
                    (true, None)
                } else {
                    // Addressed to some other device on the bus
                    (false, None)
                }
            }
            State::AwaitingCommand => {
                let flag = self.flag;
                match command.unwrap_or(0x00) {
                    CMD_READ => {
                        self.state = State::Reading(ReadStep::CardId1);
                        (true, Some(flag))
                    }
                    CMD_WRITE => {
                        self.state = State::Writing(WriteStep::CardId1);
                        (true, Some(flag))
                    }
                    CMD_GET_ID => {
                        self.state = State::Identify(IdStep::CardId1);
                        (true, Some(flag))
                    }
                    _ => {
                        // Unknown command: answer with FLAG but refuse the
                        // ACK, cleanly ending the transaction
                        self.state = State::Idle;
                        (false, Some(flag))
                    }
                }
            }
            State::Reading(step) => self.read_step(step, command),
            State::Writing(step) => self.write_step(step, command),
            State::Identify(step) => self.identify_step(step),
        }
    }

    /// Borrow a sector of the backing store. `index` must be below
    /// [`SECTOR_COUNT`].
    #[must_use]
    pub fn sector(&self, index: usize) -> &[u8] {
        &self.bytes[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    /// Mutably borrow a sector of the backing store. `index` must be below
    /// [`SECTOR_COUNT`].
    pub fn sector_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.bytes[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    /// Borrow a block of the backing store. `index` must be below
    /// [`BLOCK_COUNT`].
    #[must_use]
    pub fn block(&self, index: usize) -> &[u8] {
        &self.bytes[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    /// Mutably borrow a block of the backing store. `index` must be below
    /// [`BLOCK_COUNT`].
    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.bytes[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    /// Borrow the whole backing store.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Mutably borrow the whole backing store.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn read_step(&mut self, step: ReadStep, command: TriState) -> (bool, TriState) {
        match step {
            ReadStep::CardId1 => {
                self.state = State::Reading(ReadStep::CardId2);
                (true, Some(CARD_ID_1))
            }
            ReadStep::CardId2 => {
                self.state = State::Reading(ReadStep::AddressMsb);
                (true, Some(CARD_ID_2))
            }
            ReadStep::AddressMsb => {
                let msb = command.unwrap_or(0xFF);
                self.checksum = msb;
                self.address = u16::from(msb) << 8;
                self.state = State::Reading(ReadStep::AddressLsb);
                (true, Some(0x00))
            }
            ReadStep::AddressLsb => {
                let lsb = command.unwrap_or(0xFF);
                self.address |= u16::from(lsb);
                self.checksum ^= lsb;
                if self.address > LAST_SECTOR {
                    self.address = POISON_ADDRESS;
                }
                self.state = State::Reading(ReadStep::CommandAck1);
                (true, Some(0x00))
            }
            ReadStep::CommandAck1 => {
                self.state = State::Reading(ReadStep::CommandAck2);
                (true, Some(CMD_ACK_1))
            }
            ReadStep::CommandAck2 => {
                self.state = State::Reading(ReadStep::ConfirmMsb);
                (true, Some(CMD_ACK_2))
            }
            ReadStep::ConfirmMsb => {
                self.state = State::Reading(ReadStep::ConfirmLsb);
                (true, Some((self.address >> 8) as u8))
            }
            ReadStep::ConfirmLsb => {
                let lsb = (self.address & 0x00FF) as u8;
                if self.address == POISON_ADDRESS {
                    // Out of range: echo the poison LSB and end the
                    // transaction here
                    self.state = State::Idle;
                    (false, Some(lsb))
                } else {
                    self.byte_counter = 0;
                    self.state = State::Reading(ReadStep::Data);
                    (true, Some(lsb))
                }
            }
            ReadStep::Data => {
                let offset =
                    self.address as usize * SECTOR_SIZE + self.byte_counter as usize;
                let data = self.bytes[offset];
                self.checksum ^= data;
                self.byte_counter += 1;
                if self.byte_counter as usize == SECTOR_SIZE {
                    self.state = State::Reading(ReadStep::Checksum);
                }
                (true, Some(data))
            }
            ReadStep::Checksum => {
                self.state = State::Reading(ReadStep::EndByte);
                (true, Some(self.checksum))
            }
            ReadStep::EndByte => {
                self.state = State::Idle;
                (false, Some(STATUS_GOOD))
            }
        }
    }

    fn write_step(&mut self, step: WriteStep, command: TriState) -> (bool, TriState) {
        match step {
            WriteStep::CardId1 => {
                self.state = State::Writing(WriteStep::CardId2);
                (true, Some(CARD_ID_1))
            }
            WriteStep::CardId2 => {
                self.state = State::Writing(WriteStep::AddressMsb);
                (true, Some(CARD_ID_2))
            }
            WriteStep::AddressMsb => {
                let msb = command.unwrap_or(0xFF);
                self.checksum = msb;
                self.address = u16::from(msb) << 8;
                self.state = State::Writing(WriteStep::AddressLsb);
                (true, Some(0x00))
            }
            WriteStep::AddressLsb => {
                let lsb = command.unwrap_or(0xFF);
                self.address |= u16::from(lsb);
                self.checksum ^= lsb;
                if self.address > LAST_SECTOR {
                    self.address = POISON_ADDRESS;
                }
                self.byte_counter = 0;
                self.state = State::Writing(WriteStep::Data);
                (true, Some(0x00))
            }
            WriteStep::Data => {
                let value = command.unwrap_or(0xFF);
                // A poisoned sequence still consumes and checksums the
                // data, but nothing is stored
                if self.address != POISON_ADDRESS {
                    let offset =
                        self.address as usize * SECTOR_SIZE + self.byte_counter as usize;
                    self.bytes[offset] = value;
                }
                self.checksum ^= value;
                self.byte_counter += 1;
                if self.byte_counter as usize == SECTOR_SIZE {
                    self.state = State::Writing(WriteStep::Checksum);
                }
                (true, Some(0x00))
            }
            WriteStep::Checksum => {
                // A floating checksum line cannot match
                let sent = command.unwrap_or(!self.checksum);
                self.checksum_ok = sent == self.checksum;
                self.state = State::Writing(WriteStep::CommandAck1);
                (true, Some(0x00))
            }
            WriteStep::CommandAck1 => {
                self.state = State::Writing(WriteStep::CommandAck2);
                (true, Some(CMD_ACK_1))
            }
            WriteStep::CommandAck2 => {
                self.state = State::Writing(WriteStep::EndByte);
                (true, Some(CMD_ACK_2))
            }
            WriteStep::EndByte => {
                // Bad sector takes precedence over bad checksum
                let status = if self.address == POISON_ADDRESS {
                    STATUS_BAD_SECTOR
                } else if !self.checksum_ok {
                    STATUS_BAD_CHECKSUM
                } else {
                    STATUS_GOOD
                };
                self.state = State::Idle;
                (false, Some(status))
            }
        }
    }

    fn identify_step(&mut self, step: IdStep) -> (bool, TriState) {
        match step {
            IdStep::CardId1 => {
                self.state = State::Identify(IdStep::CardId2);
                (true, Some(CARD_ID_1))
            }
            IdStep::CardId2 => {
                self.state = State::Identify(IdStep::CommandAck1);
                (true, Some(CARD_ID_2))
            }
            IdStep::CommandAck1 => {
                self.state = State::Identify(IdStep::CommandAck2);
                (true, Some(CMD_ACK_1))
            }
            IdStep::CommandAck2 => {
                self.state = State::Identify(IdStep::Info1);
                (true, Some(CMD_ACK_2))
            }
            IdStep::Info1 => {
                self.state = State::Identify(IdStep::Info2);
                (true, Some(ID_PAYLOAD[0]))
            }
            IdStep::Info2 => {
                self.state = State::Identify(IdStep::Info3);
                (true, Some(ID_PAYLOAD[1]))
            }
            IdStep::Info3 => {
                self.state = State::Identify(IdStep::Info4);
                (true, Some(ID_PAYLOAD[2]))
            }
            IdStep::Info4 => {
                self.state = State::Idle;
                (false, Some(ID_PAYLOAD[3]))
            }
        }
    }
}

impl Default for MemoryCard {
    fn default() -> Self {
        Self::new()
    }
}
