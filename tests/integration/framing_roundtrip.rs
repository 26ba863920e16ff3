use proptest::prelude::*;

use chunkmaster::proto::framing::{encode_frame, Frame, FrameDecoder};

proptest! {
    /// Any frame survives serialisation and re-parsing regardless of how the
    /// byte stream is sliced on the way in.
    #[test]
    fn roundtrip_under_arbitrary_chunking(
        ptype in any::<u32>(),
        body in proptest::collection::vec(any::<u8>(), 0..2048),
        cuts in proptest::collection::vec(1usize..64, 0..128),
    ) {
        let encoded = encode_frame(ptype, &body);
        let mut dec = FrameDecoder::new(4096);
        let mut out: Vec<Frame> = Vec::new();
        let mut pos = 0usize;
        let mut cut_iter = cuts.iter().copied().cycle();
        while pos < encoded.len() {
            let step = cut_iter.next().unwrap_or(1).min(encoded.len() - pos);
            prop_assert!(dec.feed(&encoded[pos..pos + step], &mut out));
            pos += step;
        }
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(out[0].ptype, ptype);
        prop_assert_eq!(&out[0].data, &body);
    }

    /// Back-to-back frames come out in order with their payloads intact.
    #[test]
    fn stream_of_frames_preserves_order(
        frames in proptest::collection::vec(
            (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..256)),
            1..16,
        ),
    ) {
        let mut stream = Vec::new();
        for (ptype, body) in &frames {
            stream.extend_from_slice(&encode_frame(*ptype, body));
        }
        let mut dec = FrameDecoder::new(4096);
        let mut out = Vec::new();
        prop_assert!(dec.feed(&stream, &mut out));
        prop_assert_eq!(out.len(), frames.len());
        for (got, (ptype, body)) in out.iter().zip(frames.iter()) {
            prop_assert_eq!(got.ptype, *ptype);
            prop_assert_eq!(&got.data, body);
        }
    }
}

#[test]
fn oversized_frame_is_fatal_for_the_stream() {
    let frame = encode_frame(1, &vec![0u8; 5000]);
    let mut dec = FrameDecoder::new(4096);
    let mut out = Vec::new();
    assert!(!dec.feed(&frame, &mut out));
    assert!(dec.poisoned());
}
