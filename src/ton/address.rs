/// TON account address parsing and canonicalization.
use crate::ton::decode_base64;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use crc::{CRC_16_XMODEM, Crc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const FRIENDLY_LEN: usize = 48;
const FRIENDLY_BYTES: usize = 36;
const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TESTNET: u8 = 0x80;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid workchain: {0}")]
    InvalidWorkchain(String),
    #[error("invalid account hash: {0}")]
    InvalidHash(String),
    #[error("invalid user-friendly address: {0}")]
    InvalidFriendly(String),
    #[error("address checksum mismatch")]
    ChecksumMismatch,
    #[error("unrecognized address format")]
    UnknownFormat,
}

/// Workchain-qualified account address. The user-friendly form carries the
/// workchain as one signed byte, so that is the full range here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl TonAddress {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    /// Parses either the raw `<workchain>:<hex>` form or a 48-character
    /// user-friendly form in the standard or URL-safe base64 alphabet.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.contains(':') {
            Self::parse_raw(input)
        } else if input.len() == FRIENDLY_LEN {
            Self::parse_friendly(input)
        } else {
            Err(AddressError::UnknownFormat)
        }
    }

    fn parse_raw(input: &str) -> Result<Self, AddressError> {
        let (workchain, hash) = input.split_once(':').ok_or(AddressError::UnknownFormat)?;
        let workchain = workchain
            .parse::<i8>()
            .map_err(|_| AddressError::InvalidWorkchain(workchain.to_string()))?;
        if hash.len() != 64 {
            return Err(AddressError::InvalidHash(format!(
                "expected 64 hex characters, got {}",
                hash.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hash, &mut bytes)
            .map_err(|e| AddressError::InvalidHash(e.to_string()))?;
        Ok(Self::new(workchain, bytes))
    }

    fn parse_friendly(input: &str) -> Result<Self, AddressError> {
        let bytes =
            decode_base64(input).map_err(|e| AddressError::InvalidFriendly(e.to_string()))?;
        if bytes.len() != FRIENDLY_BYTES {
            return Err(AddressError::InvalidFriendly(format!(
                "expected {FRIENDLY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let tag = bytes[0] & !TAG_TESTNET;
        if tag != TAG_BOUNCEABLE && tag != TAG_NON_BOUNCEABLE {
            return Err(AddressError::InvalidFriendly(format!(
                "unknown tag {:#04x}",
                bytes[0]
            )));
        }
        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if CRC16.checksum(&bytes[..34]) != expected {
            return Err(AddressError::ChecksumMismatch);
        }
        let workchain = i8::from_be_bytes([bytes[1]]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self::new(workchain, hash))
    }

    /// Canonical `<workchain>:<lowercase hex>` form.
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    /// User-friendly URL-safe form, as wallets display it.
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        self.encode_friendly(bounceable, testnet, true)
    }

    pub fn encode_friendly(&self, bounceable: bool, testnet: bool, url_safe: bool) -> String {
        let mut tag = if bounceable {
            TAG_BOUNCEABLE
        } else {
            TAG_NON_BOUNCEABLE
        };
        if testnet {
            tag |= TAG_TESTNET;
        }
        let mut bytes = Vec::with_capacity(FRIENDLY_BYTES);
        bytes.push(tag);
        bytes.extend_from_slice(&self.workchain.to_be_bytes());
        bytes.extend_from_slice(&self.hash);
        let crc = CRC16.checksum(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        if url_safe {
            URL_SAFE.encode(&bytes)
        } else {
            STANDARD.encode(&bytes)
        }
    }
}

impl FromStr for TonAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

/// Best-effort canonicalization of a wallet-reported address.
///
/// Returns the raw `<workchain>:<hex>` form, or the input unchanged when it
/// cannot be parsed. The backend can still match an unnormalized sender, so a
/// parse failure never aborts the purchase.
pub fn normalize_address(input: &str) -> String {
    match TonAddress::parse(input) {
        Ok(address) => address.to_raw(),
        Err(e) => {
            tracing::warn!(address = %input, error = %e, "could not normalize sender address");
            input.to_string()
        }
    }
}
