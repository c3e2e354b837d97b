use ocl::{Buffer, Queue};

use crate::tests::{device_context, require_device};
use crate::types::{BaseType, Type};
use crate::{Error, Reduce, ReduceProblem};

fn engine_for(queue: &Queue, ty: Type) -> Reduce {
    let (_, device) = crate::tests::first_device().unwrap();
    let problem = ReduceProblem::new(ty).unwrap();
    Reduce::new(&queue.context(), &device, &problem).expect("construct reduce")
}

#[test]
fn small_signed() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut reduce = engine_for(&queue, Type::new(BaseType::Short, 1).unwrap());

    let input: Vec<i16> = vec![-1, 2, -3, 4];
    let buffer = Buffer::<i16>::builder()
        .queue(queue.clone())
        .len(4)
        .copy_host_slice(&input)
        .build()
        .unwrap();
    let result: i16 = reduce.enqueue_to_host(&queue, &buffer, 0, 4, None).unwrap();
    assert_eq!(result, 2);
}

#[test]
fn device_to_device_at_position() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut reduce = engine_for(&queue, Type::new(BaseType::Uint, 1).unwrap());

    let input: Vec<u32> = (1..=100).collect();
    let in_buffer = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(input.len())
        .copy_host_slice(&input)
        .build()
        .unwrap();
    let out_buffer = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(4)
        .fill_val(0u32)
        .build()
        .unwrap();

    let event = reduce
        .enqueue(&queue, &in_buffer, &out_buffer, 0, input.len(), 2, None)
        .unwrap();
    event.wait_for().unwrap();

    let mut result = vec![0u32; 4];
    out_buffer.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![0, 0, 5050, 0]);
}

#[test]
fn first_offset_restricts_the_range() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut reduce = engine_for(&queue, Type::new(BaseType::Uint, 1).unwrap());

    let input: Vec<u32> = vec![100, 1, 2, 3, 200];
    let buffer = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(input.len())
        .copy_host_slice(&input)
        .build()
        .unwrap();
    let result: u32 = reduce.enqueue_to_host(&queue, &buffer, 1, 3, None).unwrap();
    assert_eq!(result, 6);
}

#[test]
fn wrapping_sum_property() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut reduce = engine_for(&queue, Type::new(BaseType::Uint, 1).unwrap());

    for &n in &[1usize, 255, 256, 65537, 99991] {
        let input: Vec<u32> = (0..n as u32).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
        let expected = input.iter().fold(0u32, |acc, &v| acc.wrapping_add(v));
        let buffer = Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(n)
            .copy_host_slice(&input)
            .build()
            .unwrap();
        let result: u32 = reduce.enqueue_to_host(&queue, &buffer, 0, n, None).unwrap();
        assert_eq!(result, expected, "n={}", n);
    }
}

#[test]
fn validation_errors() {
    let (_, device) = require_device!();
    let (_context, queue) = device_context(&device);
    let mut reduce = engine_for(&queue, Type::new(BaseType::Uint, 1).unwrap());

    let buffer = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(8)
        .fill_val(1u32)
        .build()
        .unwrap();

    // Zero elements.
    match reduce.enqueue_to_host::<u32>(&queue, &buffer, 0, 0, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    // Input range overflow.
    match reduce.enqueue_to_host::<u32>(&queue, &buffer, 4, 5, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    // Output position out of bounds.
    match reduce.enqueue(&queue, &buffer, &buffer, 0, 8, 8, None) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
}
