use std::io::{self, Read};

use pgpcache_core::KeyId;
use pgpcache_packet::{
    read_header, write_packet, write_partial_packet, CaptureReader, PacketDecoder, PacketTag,
};

struct NoKeys;

impl PacketDecoder for NoKeys {
    fn private_key_id(&self, _tag: PacketTag, _body: &mut dyn Read) -> io::Result<Option<KeyId>> {
        Ok(None)
    }
}

fn make_stream(size: usize) -> Vec<u8> {
    let body: Vec<u8> = (0..size).map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8).collect();
    let mut out = Vec::with_capacity(size + 64);
    for chunk in body.chunks(4096) {
        write_packet(&mut out, PacketTag::SIGNATURE, chunk).unwrap();
    }
    out
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn frame_headers(bencher: divan::Bencher, size: usize) {
    let stream = make_stream(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut r = divan::black_box(&stream[..]);
            while let Some(h) = read_header(&mut r).unwrap() {
                io::copy(&mut h.body(&mut r), &mut io::sink()).unwrap();
            }
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn capture_replay(bencher: divan::Bencher, size: usize) {
    let stream = make_stream(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut reader = CaptureReader::new(divan::black_box(&stream[..]), NoKeys);
            io::copy(&mut reader, &mut io::sink()).unwrap()
        });
}

#[divan::bench(args = [65536, 1048576])]
fn partial_reassembly(bencher: divan::Bencher, size: usize) {
    let body = vec![0x5au8; size];
    let mut packet = Vec::new();
    write_partial_packet(&mut packet, PacketTag::LITERAL_DATA, &body, &[12; 256]).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut r = divan::black_box(&packet[..]);
            let h = read_header(&mut r).unwrap().unwrap();
            io::copy(&mut h.body(&mut r), &mut io::sink()).unwrap()
        });
}

fn main() {
    divan::main();
}
