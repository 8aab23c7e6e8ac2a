//! In-stream removal of OSC 52 clipboard sequences.
//!
//! Terminal output may carry `ESC ] 52 ; <param> ; <base64> (BEL | ESC \)`
//! to ask the host to set the clipboard. The extractor strips every such
//! sequence from the visible bytes and reports the decoded text as a
//! [`ClipboardEvent`]. Any other byte, including other OSC sequences,
//! passes through untouched.
//!
//! Chunk boundaries carry no meaning: bytes that might begin a sequence are
//! held in [`ExtractorState`] until they either complete the introducer or
//! prove unrelated, so the concatenated visible output is the same for every
//! way of splitting the input.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const ST_FINAL: u8 = b'\\';
const INTRODUCER: &[u8] = b"\x1b]52;";

/// Bodies larger than this are excised but never decoded.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Standard alphabet; emitters disagree on padding, so accept either.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A clipboard-set request recovered from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardEvent {
    pub text: String,
}

/// Output of one [`process`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    pub visible: Vec<u8>,
    pub events: Vec<ClipboardEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Passthrough,
    /// The first `n` bytes of the introducer have been seen and held back.
    Introducer(usize),
    /// Inside the selection parameter, waiting for the `;` before the body.
    Param,
    Body,
    /// An `ESC` arrived inside the sequence; `\` completes the terminator.
    Escape { in_body: bool },
}

/// Per-stream scan context. Create one per stream and never share it.
#[derive(Debug)]
pub struct ExtractorState {
    mode: Mode,
    body: Vec<u8>,
    overflowed: bool,
}

impl Default for ExtractorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorState {
    pub fn new() -> Self {
        Self {
            mode: Mode::Passthrough,
            body: Vec::new(),
            overflowed: false,
        }
    }

    /// Whether a clipboard sequence has started and not yet terminated.
    pub fn in_sequence(&self) -> bool {
        matches!(
            self.mode,
            Mode::Param | Mode::Body | Mode::Escape { .. }
        )
    }

    fn feed(&mut self, byte: u8, out: &mut Extracted) {
        match self.mode {
            Mode::Passthrough => {
                if byte == ESC {
                    self.mode = Mode::Introducer(1);
                } else {
                    out.visible.push(byte);
                }
            }
            Mode::Introducer(matched) => {
                if byte == INTRODUCER[matched] {
                    if matched + 1 == INTRODUCER.len() {
                        self.body.clear();
                        self.overflowed = false;
                        self.mode = Mode::Param;
                    } else {
                        self.mode = Mode::Introducer(matched + 1);
                    }
                } else {
                    // Not ours: release what was held and rescan this byte,
                    // which may itself start a new escape.
                    out.visible.extend_from_slice(&INTRODUCER[..matched]);
                    self.mode = Mode::Passthrough;
                    self.feed(byte, out);
                }
            }
            Mode::Param => match byte {
                b';' => self.mode = Mode::Body,
                BEL => self.finish_sequence(false, out),
                ESC => self.mode = Mode::Escape { in_body: false },
                _ => {}
            },
            Mode::Body => match byte {
                BEL => self.finish_sequence(true, out),
                ESC => self.mode = Mode::Escape { in_body: true },
                _ => self.push_body(byte),
            },
            Mode::Escape { in_body } => {
                if byte == ST_FINAL {
                    self.finish_sequence(in_body, out);
                } else {
                    // A bare ESC aborts the sequence and begins a new escape.
                    debug!(
                        body_len = self.body.len(),
                        "clipboard sequence aborted by escape"
                    );
                    self.reset();
                    self.mode = Mode::Introducer(1);
                    self.feed(byte, out);
                }
            }
        }
    }

    fn push_body(&mut self, byte: u8) {
        if self.body.len() < MAX_BODY_BYTES {
            self.body.push(byte);
        } else {
            self.overflowed = true;
        }
    }

    fn finish_sequence(&mut self, has_body: bool, out: &mut Extracted) {
        if !has_body {
            debug!("clipboard sequence without body dropped");
        } else if self.overflowed {
            debug!(limit = MAX_BODY_BYTES, "oversized clipboard body dropped");
        } else {
            match decode_body(&self.body) {
                Ok(text) => out.events.push(ClipboardEvent { text }),
                Err(e) => debug!(error = %e, "clipboard body dropped"),
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.mode = Mode::Passthrough;
        self.body.clear();
        self.overflowed = false;
    }
}

/// Scan one chunk, returning the bytes to render and any completed
/// clipboard events. Partial sequences carry over in `state`.
pub fn process(chunk: &[u8], state: &mut ExtractorState) -> Extracted {
    let mut out = Extracted {
        visible: Vec::with_capacity(chunk.len()),
        events: Vec::new(),
    };
    for &byte in chunk {
        state.feed(byte, &mut out);
    }
    out
}

/// End the stream.
///
/// Bytes held back as a possible introducer are returned as visible output.
/// A sequence whose terminator never arrived is discarded, never rendered.
pub fn finish(state: &mut ExtractorState) -> Extracted {
    let mut out = Extracted::default();
    match state.mode {
        Mode::Introducer(matched) => out.visible.extend_from_slice(&INTRODUCER[..matched]),
        Mode::Param | Mode::Body | Mode::Escape { .. } => {
            debug!(
                body_len = state.body.len(),
                "unterminated clipboard sequence discarded"
            );
        }
        Mode::Passthrough => {}
    }
    state.reset();
    out
}

fn decode_body(body: &[u8]) -> Result<String> {
    let bytes = BODY_ENGINE
        .decode(body)
        .map_err(|e| BridgeError::Decode(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
}
