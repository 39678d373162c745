//! Benchmarks for newline-delimited framing
//!
//! Measures encoding/decoding for:
//! - Small requests and replies
//! - Device list replies of realistic size
//! - Decoding from many small reads

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{DeviceList, FrameDecoder, Request, encode_frame};
use serde_json::{Value, json};

fn device_list_reply(count: usize) -> Value {
    let devices: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "device_node": format!("/dev/bus/usb/001/{:03}", i),
                "product_name": format!("Test_Device_{}", i),
                "vendor_id": "046d",
                "product_id": "c52b",
                "allowed_vms": ["chrome-vm", "business-vm", "comms-vm"],
                "vm": if i % 2 == 0 { Value::Null } else { json!("chrome-vm") },
            })
        })
        .collect();

    json!({"result": "ok", "usb_devices": devices})
}

fn benchmark_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("requests");

    let attach = Request::UsbAttach {
        device_node: "/dev/bus/usb/001/004".to_string(),
        vm: "chrome-vm".to_string(),
    };

    group.bench_function("encode_attach", |b| {
        b.iter(|| encode_frame(black_box(&attach)))
    });

    let reply = b"{\"result\":\"ok\"}\n";
    group.bench_function("decode_ok_reply", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.feed(black_box(reply));
            decoder.next_frame()
        })
    });

    group.finish();
}

fn benchmark_device_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_list");

    for count in [1usize, 10, 100] {
        let bytes = encode_frame(&device_list_reply(count)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.feed(black_box(bytes));
                let frame = decoder.next_frame().unwrap().unwrap();
                DeviceList::from_frame(&frame).unwrap()
            })
        });
    }

    group.finish();
}

fn benchmark_chunked_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_reads");

    let bytes = encode_frame(&device_list_reply(20)).unwrap();

    for chunk in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut frames = 0;
                for piece in bytes.chunks(chunk) {
                    decoder.feed(piece);
                    while let Some(frame) = decoder.next_frame() {
                        black_box(frame.unwrap());
                        frames += 1;
                    }
                }
                frames
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_requests,
    benchmark_device_list,
    benchmark_chunked_reads
);
criterion_main!(benches);
