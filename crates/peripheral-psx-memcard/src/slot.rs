//! Memory card slot: insertion lifecycle and host-side I/O routines.
//!
//! The slot mediates the power lifecycle (an inserted card is powered, a
//! removed card is not) and layers sector/block/card read and write
//! routines on top of the byte protocol, driving the card through complete
//! command sequences and validating every response along the way.

use crate::{
    MemoryCard, TriState, BLOCK_COUNT, BLOCK_SIZE, CARD_ID_1, CARD_ID_2, CARD_SIZE, CMD_ACK_1,
    CMD_ACK_2, SECTORS_PER_BLOCK, SECTOR_SIZE, STATUS_GOOD,
};

/// A slot holding at most one borrowed [`MemoryCard`].
///
/// The card is mutably borrowed for the duration of its insertion, so no
/// other party can touch it while it sits in the slot. Insertion powers
/// the card on; a card that refuses to power on (because something else
/// already did) cannot be inserted, which is what keeps one card out of
/// two slots.
pub struct MemoryCardSlot<'a> {
    card: Option<&'a mut MemoryCard>,
}

impl<'a> MemoryCardSlot<'a> {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self { card: None }
    }

    /// Insert a card, powering it on.
    ///
    /// Fails if the slot is occupied or if the card is already powered.
    pub fn insert_card(&mut self, card: &'a mut MemoryCard) -> bool {
        if self.card.is_some() {
            return false;
        }
        if !card.power_on() {
            return false;
        }
        self.card = Some(card);
        true
    }

    /// Remove the inserted card, powering it off. Fails if the slot is
    /// empty.
    pub fn remove_card(&mut self) -> bool {
        match self.card.take() {
            Some(card) => {
                card.power_off();
                true
            }
            None => false,
        }
    }

    /// Whether a card is currently inserted.
    #[must_use]
    pub fn has_card(&self) -> bool {
        self.card.is_some()
    }

    /// Forward one byte-level exchange to the inserted card.
    ///
    /// An empty slot behaves like an unresponsive peripheral:
    /// `(false, None)` with no side effect.
    pub fn transfer(&mut self, command: TriState) -> (bool, TriState) {
        match self.card.as_mut() {
            Some(card) => card.transfer(command),
            None => (false, None),
        }
    }

    /// Read one sector into `out` by driving a full read command.
    ///
    /// Returns `false` on an empty slot, an out-of-range index, any
    /// missing ACK or wrong response byte, a bad end status, or a
    /// checksum mismatch.
    pub fn read_sector(&mut self, index: usize, out: &mut [u8; SECTOR_SIZE]) -> bool {
        if !self.has_card() || index > usize::from(u16::MAX) {
            return false;
        }
        let msb = (index >> 8) as u8;
        let lsb = index as u8;
        let commands = [0x81, 0x52, 0x00, 0x00, msb, lsb, 0x00, 0x00, 0x00, 0x00];
        // None marks a don't-care position (the flag byte, the address
        // echo padding)
        let expected: [TriState; 10] = [
            None,
            None,
            Some(CARD_ID_1),
            Some(CARD_ID_2),
            None,
            None,
            Some(CMD_ACK_1),
            Some(CMD_ACK_2),
            Some(msb),
            Some(lsb),
        ];
        for (&command, want) in commands.iter().zip(expected) {
            let (ack, data) = self.transfer(Some(command));
            if !ack {
                return false;
            }
            if want.is_some() && data != want {
                return false;
            }
        }

        let mut checksum = msb ^ lsb;
        for slot in out.iter_mut() {
            let (ack, data) = self.transfer(Some(0x00));
            // A concrete data byte is required here
            let Some(value) = data else {
                return false;
            };
            if !ack {
                return false;
            }
            *slot = value;
            checksum ^= value;
        }

        let (ack, card_checksum) = self.transfer(Some(0x00));
        if !ack {
            return false;
        }
        let (end_ack, end) = self.transfer(Some(0x00));
        !end_ack && end == Some(STATUS_GOOD) && card_checksum == Some(checksum)
    }

    /// Write one sector from `data` by driving a full write command.
    ///
    /// Returns `true` iff the card reports a good write.
    pub fn write_sector(&mut self, index: usize, data: &[u8; SECTOR_SIZE]) -> bool {
        if !self.has_card() || index > usize::from(u16::MAX) {
            return false;
        }
        let msb = (index >> 8) as u8;
        let lsb = index as u8;
        let commands = [0x81, 0x57, 0x00, 0x00, msb, lsb];
        let expected: [TriState; 6] = [
            None,
            None,
            Some(CARD_ID_1),
            Some(CARD_ID_2),
            None,
            None,
        ];
        for (&command, want) in commands.iter().zip(expected) {
            let (ack, response) = self.transfer(Some(command));
            if !ack {
                return false;
            }
            if want.is_some() && response != want {
                return false;
            }
        }

        let mut checksum = msb ^ lsb;
        for &value in data {
            let (ack, _) = self.transfer(Some(value));
            if !ack {
                return false;
            }
            checksum ^= value;
        }
        let (ack, _) = self.transfer(Some(checksum));
        if !ack {
            return false;
        }

        // Command-acknowledge tag, then the end status (which must refuse
        // the ACK, closing the transaction)
        let (ack, response) = self.transfer(Some(0x00));
        if !ack || response != Some(CMD_ACK_1) {
            return false;
        }
        let (ack, response) = self.transfer(Some(0x00));
        if !ack || response != Some(CMD_ACK_2) {
            return false;
        }
        let (end_ack, end) = self.transfer(Some(0x00));
        !end_ack && end == Some(STATUS_GOOD)
    }

    /// Read a whole block, sector by sector.
    pub fn read_block(&mut self, index: usize, out: &mut [u8; BLOCK_SIZE]) -> bool {
        let first = index * SECTORS_PER_BLOCK;
        let mut sector = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_BLOCK {
            if !self.read_sector(first + i, &mut sector) {
                return false;
            }
            out[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        true
    }

    /// Write a whole block, sector by sector.
    pub fn write_block(&mut self, index: usize, data: &[u8; BLOCK_SIZE]) -> bool {
        let first = index * SECTORS_PER_BLOCK;
        let mut sector = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_BLOCK {
            sector.copy_from_slice(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            if !self.write_sector(first + i, &sector) {
                return false;
            }
        }
        true
    }

    /// Read the entire card, block by block.
    pub fn read_card(&mut self, out: &mut [u8; CARD_SIZE]) -> bool {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_COUNT {
            if !self.read_block(i, &mut block) {
                return false;
            }
            out[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&block);
        }
        true
    }

    /// Write the entire card, block by block.
    pub fn write_card(&mut self, data: &[u8; CARD_SIZE]) -> bool {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_COUNT {
            block.copy_from_slice(&data[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]);
            if !self.write_block(i, &block) {
                return false;
            }
        }
        true
    }
}

impl Default for MemoryCardSlot<'_> {
    fn default() -> Self {
        Self::new()
    }
}
