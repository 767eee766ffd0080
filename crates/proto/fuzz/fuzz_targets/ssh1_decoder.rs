//! Fuzz target for SSH-1 packet decoding.
//!
//! Feeds arbitrary bytes to the decoder in two uneven chunks and checks
//! that every decoded packet survives a re-encode.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh1_decoder -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tern_proto::ssh1::codec::{Decoded, PacketDecoder, PacketEncoder};

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut decoder = PacketDecoder::new();
    decoder.feed(&data[..split]);
    decoder.feed(&data[split..]);

    while let Ok(Decoded::Complete(packet)) = decoder.next() {
        let mut encoder = PacketEncoder::new();
        let wire = encoder.encode(&packet).expect("decoded packets must re-encode");

        let mut again = PacketDecoder::new();
        again.feed(&wire);
        match again.next() {
            Ok(Decoded::Complete(reparsed)) => {
                assert_eq!(packet.msg_type(), reparsed.msg_type());
                assert_eq!(packet.payload(), reparsed.payload());
            }
            other => panic!("re-encoded packet did not decode: {:?}", other.map(|_| ())),
        }
    }
});
