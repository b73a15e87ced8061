//! PlayStation memory card image parser.
//!
//! Two container formats are in common circulation:
//!
//! - **Raw** (`.mcr`, `.mcd`, `.bin`): a bare dump of the card's 128 KiB,
//!   16 blocks x 64 sectors x 128 bytes = 131,072 bytes.
//! - **DexDrive** (`.gme`): a 3,904-byte header beginning with the ASCII
//!   magic `123-456-STD`, followed by the raw 128 KiB payload. The header
//!   carries DexDrive comment slots which this crate preserves verbatim
//!   but does not interpret.

use std::fmt;

/// Bytes on a card: 16 blocks x 64 sectors x 128 bytes.
pub const CARD_SIZE: usize = 131_072;
/// Size of the DexDrive header preceding the card payload.
pub const GME_HEADER_SIZE: usize = 3904;

const GME_SIZE: usize = GME_HEADER_SIZE + CARD_SIZE;
const GME_MAGIC: &[u8] = b"123-456-STD";

/// Container format an image was parsed from (or will serialise to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McdFormat {
    /// Bare 131,072-byte dump.
    Raw,
    /// DexDrive dump with its 3,904-byte header.
    Gme,
}

#[derive(Debug)]
pub enum McdError {
    InvalidSize(usize),
    BadMagic,
}

impl fmt::Display for McdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(
                f,
                "invalid card image size: {} bytes (expected {} raw or {} GME)",
                size, CARD_SIZE, GME_SIZE,
            ),
            Self::BadMagic => write!(f, "GME-sized image without 123-456-STD magic"),
        }
    }
}

impl std::error::Error for McdError {}

/// A parsed memory card image.
pub struct McdImage {
    format: McdFormat,
    /// Original GME header, kept for byte-exact round trips. Empty for
    /// raw images.
    header: Vec<u8>,
    data: Box<[u8; CARD_SIZE]>,
}

impl McdImage {
    /// A blank (all-zeros) raw image.
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: McdFormat::Raw,
            header: Vec::new(),
            data: Box::new([0; CARD_SIZE]),
        }
    }

    /// Parse an image, detecting the container by size.
    ///
    /// # Errors
    ///
    /// [`McdError::InvalidSize`] if `data` is neither a raw nor a GME
    /// image; [`McdError::BadMagic`] if a GME-sized image lacks the
    /// DexDrive magic.
    pub fn from_bytes(data: &[u8]) -> Result<Self, McdError> {
        match data.len() {
            CARD_SIZE => {
                let mut image = Self::new();
                image.data.copy_from_slice(data);
                Ok(image)
            }
            GME_SIZE => {
                if &data[..GME_MAGIC.len()] != GME_MAGIC {
                    return Err(McdError::BadMagic);
                }
                let mut image = Self::new();
                image.format = McdFormat::Gme;
                image.header = data[..GME_HEADER_SIZE].to_vec();
                image.data.copy_from_slice(&data[GME_HEADER_SIZE..]);
                Ok(image)
            }
            other => Err(McdError::InvalidSize(other)),
        }
    }

    /// The container format this image was parsed from.
    #[must_use]
    pub fn format(&self) -> McdFormat {
        self.format
    }

    /// Borrow the card payload.
    #[must_use]
    pub fn card_bytes(&self) -> &[u8; CARD_SIZE] {
        &self.data
    }

    /// Mutably borrow the card payload.
    pub fn card_bytes_mut(&mut self) -> &mut [u8; CARD_SIZE] {
        &mut self.data
    }

    /// Consume the image, returning the card payload.
    #[must_use]
    pub fn into_card_bytes(self) -> [u8; CARD_SIZE] {
        *self.data
    }

    /// Serialise as a raw dump.
    #[must_use]
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Serialise as a DexDrive dump.
    ///
    /// An image parsed from GME keeps its original header; otherwise a
    /// minimal header (magic plus zero fill) is synthesised.
    #[must_use]
    pub fn to_gme_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(GME_SIZE);
        if self.header.len() == GME_HEADER_SIZE {
            out.extend_from_slice(&self.header);
        } else {
            out.extend_from_slice(GME_MAGIC);
            out.resize(GME_HEADER_SIZE, 0);
        }
        out.extend_from_slice(&self.data[..]);
        out
    }
}

impl Default for McdImage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gme_fixture() -> Vec<u8> {
        let mut raw = vec![0u8; GME_SIZE];
        raw[..GME_MAGIC.len()].copy_from_slice(GME_MAGIC);
        // Something recognisable in the comment area and the payload
        raw[0x40] = 0xAB;
        raw[GME_HEADER_SIZE] = 0x13;
        raw[GME_SIZE - 1] = 0x37;
        raw
    }

    #[test]
    fn reject_invalid_size() {
        assert!(matches!(
            McdImage::from_bytes(&[0; 100]),
            Err(McdError::InvalidSize(100))
        ));
    }

    #[test]
    fn reject_gme_without_magic() {
        let raw = vec![0u8; GME_SIZE];
        assert!(matches!(
            McdImage::from_bytes(&raw),
            Err(McdError::BadMagic)
        ));
    }

    #[test]
    fn accept_raw_image() {
        let mut raw = vec![0u8; CARD_SIZE];
        raw[0] = 0x55;
        let image = McdImage::from_bytes(&raw).expect("valid raw");
        assert_eq!(image.format(), McdFormat::Raw);
        assert_eq!(image.card_bytes()[0], 0x55);
    }

    #[test]
    fn accept_gme_image() {
        let image = McdImage::from_bytes(&gme_fixture()).expect("valid GME");
        assert_eq!(image.format(), McdFormat::Gme);
        assert_eq!(image.card_bytes()[0], 0x13);
        assert_eq!(image.card_bytes()[CARD_SIZE - 1], 0x37);
    }

    #[test]
    fn raw_round_trip() {
        let raw: Vec<u8> = (0..CARD_SIZE).map(|i| (i % 251) as u8).collect();
        let image = McdImage::from_bytes(&raw).expect("valid raw");
        assert_eq!(image.to_raw_bytes(), raw);
    }

    #[test]
    fn gme_round_trip_preserves_header() {
        let fixture = gme_fixture();
        let image = McdImage::from_bytes(&fixture).expect("valid GME");
        assert_eq!(image.to_gme_bytes(), fixture);
    }

    #[test]
    fn raw_to_gme_synthesises_header() {
        let image = McdImage::new();
        let gme = image.to_gme_bytes();
        assert_eq!(gme.len(), GME_SIZE);
        assert_eq!(&gme[..GME_MAGIC.len()], GME_MAGIC);
        let reparsed = McdImage::from_bytes(&gme).expect("synthesised GME parses");
        assert_eq!(reparsed.format(), McdFormat::Gme);
    }

    #[test]
    fn payload_edits_survive_serialisation() {
        let mut image = McdImage::new();
        image.card_bytes_mut()[128] = 0x99;
        assert_eq!(image.to_raw_bytes()[128], 0x99);
        assert_eq!(image.into_card_bytes()[128], 0x99);
    }
}
