//! Protocol layer - wire format and frame handling.
//!
//! This module contains the frame codec:
//!
//! - [`wire_format`] - header layout, protocol constants, encode/decode
//! - [`frame`] - [`Frame`] with full 512-byte block encode/decode

pub mod frame;
pub mod wire_format;

pub use frame::Frame;
pub use wire_format::{
    is_magic_block, publish_reply_header, Header, BLOCK_SIZE, HEADER_SIZE, KNOCK_SEQUENCE,
    MAX_PAYLOAD, REPLY_TAG, REQUEST_TAG, SENTINEL_SECTOR, TAG_SIZE,
};
