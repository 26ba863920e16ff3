//! Incremental frame parser. Bytes arrive in arbitrary slices; the decoder
//! accumulates an 8-byte header, then the body, and yields complete frames.
//! Frames longer than the configured cap poison the decoder (the session must
//! be killed, there is no way to resynchronise).

use bytes::Bytes;

use crate::proto::wire::PacketWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ptype: u32,
    pub data: Vec<u8>,
}

enum DecodeState {
    Header,
    Body { ptype: u32 },
    Poisoned,
}

pub struct FrameDecoder {
    max_packet_size: u32,
    state: DecodeState,
    buf: Vec<u8>,
    need: usize,
}

impl FrameDecoder {
    pub fn new(max_packet_size: u32) -> Self {
        Self {
            max_packet_size,
            state: DecodeState::Header,
            buf: Vec::with_capacity(8),
            need: 8,
        }
    }

    /// True once an oversized frame has been seen.
    pub fn poisoned(&self) -> bool {
        matches!(self.state, DecodeState::Poisoned)
    }

    /// Feeds a slice of received bytes, appending any completed frames to
    /// `out`. Returns `false` if the stream is poisoned.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<Frame>) -> bool {
        while !input.is_empty() {
            match self.state {
                DecodeState::Poisoned => return false,
                DecodeState::Header | DecodeState::Body { .. } => {
                    let want = self.need - self.buf.len();
                    let take = want.min(input.len());
                    self.buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.buf.len() < self.need {
                        return true;
                    }
                    match self.state {
                        DecodeState::Header => {
                            let ptype =
                                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                            let leng =
                                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
                            if leng > self.max_packet_size {
                                self.state = DecodeState::Poisoned;
                                return false;
                            }
                            self.buf.clear();
                            if leng == 0 {
                                out.push(Frame {
                                    ptype,
                                    data: Vec::new(),
                                });
                                self.need = 8;
                            } else {
                                self.state = DecodeState::Body { ptype };
                                self.need = leng as usize;
                            }
                        }
                        DecodeState::Body { ptype } => {
                            out.push(Frame {
                                ptype,
                                data: std::mem::take(&mut self.buf),
                            });
                            self.state = DecodeState::Header;
                            self.need = 8;
                            self.buf.reserve(8);
                        }
                        DecodeState::Poisoned => unreachable!(),
                    }
                }
            }
        }
        true
    }
}

/// Encodes a frame with a raw payload.
pub fn encode_frame(ptype: u32, data: &[u8]) -> Bytes {
    let mut w = PacketWriter::new(ptype, data.len() as u32);
    w.put_bytes(data);
    w.finish()
}

/// The 8-byte keepalive frame.
pub fn nop_frame() -> Bytes {
    encode_frame(crate::proto::ANTOAN_NOP, &[])
}
