use ocl::{Buffer, Queue};

use crate::tests::{device_context, require_device};
use crate::types::{BaseType, Type};
use crate::{Error, Scan, ScanProblem};

fn make_buffer(queue: &Queue, data: &[u32]) -> Buffer<u32> {
    Buffer::builder()
        .queue(queue.clone())
        .len(data.len())
        .copy_host_slice(data)
        .build()
        .expect("create buffer")
}

fn uint_scan(queue: &Queue) -> Scan {
    let (_, device) = crate::tests::first_device().unwrap();
    let problem = ScanProblem::new(Type::new(BaseType::Uint, 1).unwrap()).unwrap();
    Scan::new(&queue.context(), &device, &problem).expect("construct scan")
}

fn reference_scan(input: &[u32], offset: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(input.len());
    let mut sum = offset;
    for &v in input {
        out.push(sum);
        sum = sum.wrapping_add(v);
    }
    out
}

#[test]
fn sanity() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    let input = make_buffer(&queue, &[3, 1, 4, 1, 5, 9, 2, 6]);
    let output = make_buffer(&queue, &[0; 8]);
    let event = scan
        .enqueue(&queue, &input, &output, 8, None, None)
        .expect("enqueue scan");
    event.wait_for().unwrap();

    let mut result = vec![0u32; 8];
    output.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![0, 3, 4, 8, 9, 14, 23, 25]);
}

#[test]
fn host_offset() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    let input = make_buffer(&queue, &[1, 2, 3, 4]);
    let output = make_buffer(&queue, &[0; 4]);
    let event = scan
        .enqueue(&queue, &input, &output, 4, Some(100u32), None)
        .unwrap();
    event.wait_for().unwrap();

    let mut result = vec![0u32; 4];
    output.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![100, 101, 103, 106]);
}

#[test]
fn buffer_offset() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    let input = make_buffer(&queue, &[10, 10, 10, 10]);
    let output = make_buffer(&queue, &[0; 4]);
    let offsets = make_buffer(&queue, &[999, 7]);
    let event = scan
        .enqueue_with_offset_buffer(&queue, &input, &output, 4, &offsets, 1, None)
        .unwrap();
    event.wait_for().unwrap();

    let mut result = vec![0u32; 4];
    output.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![7, 17, 27, 37]);
}

#[test]
fn offset_cell_aliasing_the_output() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    // The seed lives inside the buffer being scanned in place; it must be
    // read before the scan overwrites it.
    let data: Vec<u32> = vec![5, 1, 1, 1];
    let buffer = make_buffer(&queue, &data);
    let event = scan
        .enqueue_with_offset_buffer(&queue, &buffer, &buffer, 4, &buffer, 0, None)
        .unwrap();
    event.wait_for().unwrap();

    let mut result = vec![0u32; 4];
    buffer.read(&mut result).enq().unwrap();
    assert_eq!(result, reference_scan(&data, 5));
}

#[test]
fn in_place_matches_out_of_place_at_boundary_sizes() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    // Powers of two, their neighbours and a large prime.
    for &n in &[1usize, 2, 3, 255, 256, 257, 4095, 4096, 4097, 65536, 65537, 99991] {
        let input: Vec<u32> = (0..n as u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
        let expected = reference_scan(&input, 0);

        let in_buffer = make_buffer(&queue, &input);
        let out_buffer = make_buffer(&queue, &vec![0u32; n]);
        let event = scan.enqueue(&queue, &in_buffer, &out_buffer, n, None, None).unwrap();
        event.wait_for().unwrap();
        let mut out_of_place = vec![0u32; n];
        out_buffer.read(&mut out_of_place).enq().unwrap();
        assert_eq!(out_of_place, expected, "out of place, n={}", n);

        let buffer = make_buffer(&queue, &input);
        let event = scan.enqueue(&queue, &buffer, &buffer, n, None, None).unwrap();
        event.wait_for().unwrap();
        let mut in_place = vec![0u32; n];
        buffer.read(&mut in_place).enq().unwrap();
        assert_eq!(in_place, expected, "in place, n={}", n);
    }
}

#[test]
fn validation_errors() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut scan = uint_scan(&queue);

    let small = make_buffer(&queue, &[1, 2, 3, 4]);
    let output = make_buffer(&queue, &[0; 4]);

    // Zero elements.
    match scan.enqueue(&queue, &small, &output, 0, None, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    // Range exceeds the buffers.
    match scan.enqueue(&queue, &small, &output, 5, None, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    // Offset index out of bounds.
    match scan.enqueue_with_offset_buffer(&queue, &small, &output, 4, &small, 4, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    // Mismatched element size.
    let bytes = Buffer::<u8>::builder()
        .queue(queue.clone())
        .len(16)
        .fill_val(0u8)
        .build()
        .unwrap();
    match scan.enqueue(&queue, &bytes, &bytes, 4, None, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn rejects_unsupported_types_at_construction() {
    let (_, device) = require_device!();
    let (context, _queue) = device_context(&device);

    // Floats cannot be scanned at all; the problem constructor already
    // rejects them.
    assert!(ScanProblem::new(Type::new(BaseType::Float, 1).unwrap()).is_err());

    // A valid problem still constructs.
    let problem = ScanProblem::new(Type::new(BaseType::Int, 1).unwrap()).unwrap();
    assert!(Scan::new(&context, &device, &problem).is_ok());
}
