use crossbeam::channel;
use cuda_worker::{
    emulated::{self, EmulatedDevice},
    utils::{from_bytes, to_bytes},
    Backend, DeviceContext, Error, FunctionId, KernelDescriptor, LaunchDim, Side,
};
use std::sync::Arc;

fn setup() -> (Arc<EmulatedDevice>, FunctionId) {
    let device = EmulatedDevice::new();
    let double = device.register_function("double", |dim, args| {
        let data = args[0].as_buffer().ok_or("expected buffer")?;
        let n = (dim.threads() as usize).min(data.len() / 4);
        for chunk in data.chunks_exact_mut(4).take(n) {
            let x = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            chunk.copy_from_slice(&(x * 2).to_ne_bytes());
        }
        Ok(())
    });
    (Arc::new(device), double)
}

fn read_device(device: &EmulatedDevice, worker: &cuda_worker::Worker<'_>, index: usize) -> Vec<u8> {
    let buffer = worker.get_device_copies_dx(index).unwrap();
    let mut out = vec![0u8; buffer.len()];
    device.copy_to_host(&mut out, buffer.ptr()).unwrap();
    out
}

#[test]
fn test_fill_with_ones_scenario() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(2048).unwrap();
    worker.host_init(0).unwrap();
    worker.device_init(0).unwrap();
    worker
        .transform_idx(0, |bytes| bytes.iter_mut().for_each(|b| *b = 1))
        .unwrap();
    worker.copy_host_to_device(0).unwrap();
    let on_device = read_device(&device, &worker, 0);
    assert_eq!(on_device.len(), 2048);
    assert!(on_device.iter().all(|&b| b == 1));
}

#[test]
fn test_copy_is_byte_identical() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(37).unwrap();
    worker.host_init(0).unwrap();
    worker.device_init(0).unwrap();
    worker
        .transform_idx(0, |bytes| {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = (i * 7) as u8;
            }
        })
        .unwrap();
    worker.copy_host_to_device(0).unwrap();
    let expected = worker.get_host_copies_dx(0).unwrap().to_vec();
    assert_eq!(read_device(&device, &worker, 0), expected);
}

#[test]
fn test_swap_twice_restores() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(8).unwrap();
    worker.host_init(0).unwrap();
    worker.device_init(0).unwrap();
    worker
        .transform_idx(0, |bytes| bytes.copy_from_slice(b"hostdata"))
        .unwrap();
    let ptr = worker.get_device_copies_dx(0).unwrap().ptr();
    device.copy_to_device(ptr, b"devicexx").unwrap();

    worker.swap_idx(0).unwrap();
    assert_eq!(worker.get_host_copies_dx(0).unwrap().as_slice(), b"devicexx");
    assert_eq!(read_device(&device, &worker, 0), b"hostdata");
    worker.swap_idx(0).unwrap();
    assert_eq!(worker.get_host_copies_dx(0).unwrap().as_slice(), b"hostdata");
    assert_eq!(read_device(&device, &worker, 0), b"devicexx");
}

#[test]
fn test_cleanup_idempotent() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(64).unwrap();
    for index in 0..3 {
        worker.host_init(index).unwrap();
        worker.device_init(index).unwrap();
    }
    assert_eq!(device.allocation_count(), 3);
    worker.cleanup();
    worker.cleanup();
    assert_eq!(device.allocation_count(), 0);
    assert!(worker.is_empty());
    for index in 0..3 {
        assert!(matches!(
            worker.get_host_copies_dx(index),
            Err(Error::IndexOutOfRange(i)) if i == index
        ));
        assert!(matches!(
            worker.get_device_copies_dx(index),
            Err(Error::IndexOutOfRange(i)) if i == index
        ));
    }
    // the size survives cleanup
    worker.host_init(0).unwrap();
    assert_eq!(worker.get_host_copies_dx(0).unwrap().len(), 64);
}

#[test]
fn test_device_init_without_size() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    assert!(matches!(worker.device_init(0), Err(Error::UninitializedSize)));
    assert_eq!(device.allocation_count(), 0);
    assert!(matches!(
        worker.get_device_copies_dx(0),
        Err(Error::IndexOutOfRange(0))
    ));
}

#[test]
fn test_device_capacity_surfaces() {
    let device = Arc::new(emulated::Builder::new().capacity(4096).build());
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(2048).unwrap();
    worker.device_init(0).unwrap();
    worker.device_init(1).unwrap();
    match worker.device_init(2) {
        Err(Error::DeviceAllocation { size, .. }) => assert_eq!(size, 2048),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(worker.len(), 2);
    assert!(matches!(
        worker.get_device_copies_dx(2),
        Err(Error::IndexOutOfRange(2))
    ));
}

#[test]
fn test_copy_requires_both_sides() {
    let (device, _) = setup();
    let context = DeviceContext::new(device);
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    worker.host_init(0).unwrap();
    assert!(matches!(
        worker.copy_host_to_device(0),
        Err(Error::BufferNotAllocated {
            index: 0,
            side: Side::Device
        })
    ));
    worker.device_init(1).unwrap();
    assert!(matches!(
        worker.copy_device_to_host(1),
        Err(Error::BufferNotAllocated {
            index: 1,
            side: Side::Host
        })
    ));
}

#[test]
fn test_launch_round_trip() {
    let (device, double) = setup();
    let context = DeviceContext::new(device);
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(4 * 8).unwrap();
    worker.host_init(0).unwrap();
    worker.device_init(0).unwrap();
    worker
        .transform_idx_as::<i32, _>(0, |xs| {
            for (i, x) in xs.iter_mut().enumerate() {
                *x = i as i32;
            }
        })
        .unwrap();
    worker.copy_host_to_device(0).unwrap();
    worker.set_dim(LaunchDim::new(1, 6));
    worker
        .launch(&KernelDescriptor::new(double).buffer(0))
        .unwrap();
    worker.copy_device_to_host(0).unwrap();
    let host = worker.get_host_copies_dx(0).unwrap();
    assert_eq!(from_bytes::<i32>(host), vec![0, 2, 4, 6, 8, 10, 6, 7]);
}

#[test]
fn test_launch_rejects_block_over_limit() {
    let (device, double) = setup();
    let context = DeviceContext::new(device);
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    worker.device_init(0).unwrap();
    let limit = context.limits().max_threads_per_block;
    worker.set_dim(LaunchDim::new(1, limit + 1));
    assert!(matches!(
        worker.launch(&KernelDescriptor::new(double).buffer(0)),
        Err(Error::Launch(_))
    ));
}

#[test]
fn test_kernel_fault_reported() {
    let (device, _) = setup();
    let fault = device.register_function("fault", |_, _| Err("misaligned address".to_string()));
    let context = DeviceContext::new(device);
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    worker.device_init(0).unwrap();
    worker.set_dim(LaunchDim::new(1, 1));
    match worker.launch(&KernelDescriptor::new(fault).buffer(0)) {
        Err(Error::KernelFault(msg)) => assert!(msg.contains("misaligned address")),
        other => panic!("unexpected {:?}", other),
    }
    let handle = worker
        .launch_async(&KernelDescriptor::new(fault).buffer(0))
        .unwrap();
    assert!(matches!(worker.wait(handle), Err(Error::KernelFault(_))));
    // a faulted launch frees its buffers
    assert!(worker.device_init(0).is_ok());
}

#[test]
fn test_async_launch_holds_buffers() {
    let (device, _) = setup();
    let (gate_tx, gate_rx) = channel::bounded::<()>(0);
    let gated = device.register_function("gated_fill", move |_, args| {
        gate_rx.recv().map_err(|e| e.to_string())?;
        let data = args[0].as_buffer().ok_or("expected buffer")?;
        data.iter_mut().for_each(|b| *b = 0xab);
        Ok(())
    });
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    for index in 0..2 {
        worker.host_init(index).unwrap();
        worker.device_init(index).unwrap();
    }
    worker.set_dim(LaunchDim::new(1, 16));
    let handle = worker
        .launch_async(&KernelDescriptor::new(gated).buffer(0))
        .unwrap();
    assert_eq!(handle.indices(), &[0]);
    assert_eq!(context.subscribers()[0].1.in_flight, 1);

    assert!(matches!(worker.copy_host_to_device(0), Err(Error::BufferBusy(0))));
    assert!(matches!(worker.swap_idx(0), Err(Error::BufferBusy(0))));
    assert!(matches!(worker.device_init(0), Err(Error::BufferBusy(0))));
    assert!(matches!(worker.host_init(0), Err(Error::BufferBusy(0))));
    assert!(matches!(
        worker.transform_idx(0, |_| {}),
        Err(Error::BufferBusy(0))
    ));
    assert!(matches!(
        worker.launch_async(&KernelDescriptor::new(gated).buffer(0)),
        Err(Error::BufferBusy(0))
    ));
    // other indices stay usable
    worker.copy_host_to_device(1).unwrap();
    assert!(worker.get_device_copies_dx(0).is_ok());

    gate_tx.send(()).unwrap();
    worker.wait(handle).unwrap();
    assert_eq!(context.subscribers()[0].1.in_flight, 0);
    worker.copy_device_to_host(0).unwrap();
    assert!(worker
        .get_host_copies_dx(0)
        .unwrap()
        .iter()
        .all(|&b| b == 0xab));
}

#[test]
fn test_cleanup_waits_for_launches() {
    let (device, double) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(32).unwrap();
    worker.device_init(0).unwrap();
    worker.set_dim(LaunchDim::new(1, 8));
    let handle = worker
        .launch_async(&KernelDescriptor::new(double).buffer(0))
        .unwrap();
    worker.cleanup();
    assert_eq!(device.allocation_count(), 0);
    assert_eq!(context.subscribers()[0].1.in_flight, 0);
    // already observed by cleanup
    worker.wait(handle).unwrap();
}

#[test]
fn test_workers_are_independent() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut a = context.new_subscriber().unwrap();
    let mut b = context.new_subscriber().unwrap();
    a.size_init(4).unwrap();
    b.size_init(4).unwrap();
    for worker in [&mut a, &mut b].iter_mut() {
        worker.host_init(0).unwrap();
        worker.device_init(0).unwrap();
    }
    a.transform_idx(0, |bytes| bytes.copy_from_slice(&to_bytes(&[1u32])))
        .unwrap();
    b.transform_idx(0, |bytes| bytes.copy_from_slice(&to_bytes(&[2u32])))
        .unwrap();
    a.copy_host_to_device(0).unwrap();
    b.copy_host_to_device(0).unwrap();
    assert_eq!(from_bytes::<u32>(&read_device(&device, &a, 0)), vec![1]);
    assert_eq!(from_bytes::<u32>(&read_device(&device, &b, 0)), vec![2]);
    a.cleanup();
    assert_eq!(context.device_bytes_in_use(), 4);
    assert!(b.get_device_copies_dx(0).is_ok());
}

#[test]
fn test_largest_size_reports_allocation() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    worker.device_init(0).unwrap();
    worker.size_init(usize::MAX).unwrap();
    assert!(matches!(
        worker.host_init(1),
        Err(Error::Allocation(size)) if size == usize::MAX
    ));
    match worker.device_init(1) {
        Err(Error::DeviceAllocation { size, .. }) => assert_eq!(size, usize::MAX),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(worker.len(), 1);
    assert_eq!(device.used_bytes(), 16);
    drop(worker);
    assert_eq!(device.used_bytes(), 0);
    assert!(device.allocate(16).is_ok());
}

#[test]
fn test_huge_index_reports_allocation() {
    let (device, _) = setup();
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(8).unwrap();
    for &index in &[usize::MAX, usize::MAX / 2] {
        assert!(matches!(worker.host_init(index), Err(Error::Allocation(_))));
        assert!(matches!(worker.device_init(index), Err(Error::Allocation(_))));
    }
    assert!(worker.is_empty());
    assert_eq!(device.allocation_count(), 0);
    worker.host_init(0).unwrap();
    assert_eq!(worker.len(), 1);
}

#[test]
fn test_wait_rejects_other_workers_handle() {
    let (device, double) = setup();
    let fault = device.register_function("fault", |_, _| Err("trap".to_string()));
    let context = DeviceContext::new(device);
    let mut a = context.new_subscriber().unwrap();
    let mut b = context.new_subscriber().unwrap();
    for worker in [&mut a, &mut b].iter_mut() {
        worker.size_init(16).unwrap();
        worker.device_init(0).unwrap();
        worker.set_dim(LaunchDim::new(1, 4));
    }
    let ha = a
        .launch_async(&KernelDescriptor::new(double).buffer(0))
        .unwrap();
    let hb = b
        .launch_async(&KernelDescriptor::new(fault).buffer(0))
        .unwrap();
    assert_eq!(ha.id(), hb.id());
    assert_eq!(ha.worker(), a.id());

    assert!(matches!(b.wait(ha), Err(Error::ForeignLaunch { .. })));
    assert!(matches!(b.wait(hb), Err(Error::KernelFault(_))));
    // a's launch is untouched and still holds its buffer until cleanup
    assert!(matches!(a.device_init(0), Err(Error::BufferBusy(0))));
    a.cleanup();
    assert!(a.is_empty());
}

#[test]
fn test_wait_after_cleanup_reports_fault() {
    let (device, _) = setup();
    let fault = device.register_function("fault", |_, _| Err("trap".to_string()));
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber().unwrap();
    worker.size_init(16).unwrap();
    worker.device_init(0).unwrap();
    worker.set_dim(LaunchDim::new(1, 1));
    let handle = worker
        .launch_async(&KernelDescriptor::new(fault).buffer(0))
        .unwrap();
    worker.cleanup();
    assert_eq!(device.allocation_count(), 0);
    assert!(!handle.is_finished());
    match worker.wait(handle) {
        Err(Error::KernelFault(msg)) => assert!(msg.contains("trap")),
        other => panic!("unexpected {:?}", other),
    }
}
