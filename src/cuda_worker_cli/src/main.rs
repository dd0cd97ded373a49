use clap::{App, Arg, ArgMatches};
use cuda_worker::{
    emulated::{self, EmulatedDevice},
    Backend, DeviceContext, Error, KernelDescriptor, LaunchDim,
};
use std::{process, str::FromStr, sync::Arc};

fn parse<T: FromStr>(matches: &ArgMatches<'_>, name: &str) -> T {
    let value = matches.value_of(name).unwrap_or_default();
    match value.parse() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("Can't parse {} for --{}", value, name);
            process::exit(2);
        }
    }
}

/// Byte size with optional K/M/G suffix, e.g. 2K.
fn parse_bytes(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 10),
        'M' | 'm' => (&s[..s.len() - 1], 20),
        'G' | 'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(1usize << shift))
}

fn bytes_arg(matches: &ArgMatches<'_>, name: &str) -> usize {
    let value = matches.value_of(name).unwrap_or_default();
    parse_bytes(value).unwrap_or_else(|| {
        eprintln!("Can't parse {} as byte size for --{}", value, name);
        process::exit(2);
    })
}

fn backend(matches: &ArgMatches<'_>) -> Arc<EmulatedDevice> {
    let device = emulated::Builder::new()
        .capacity(bytes_arg(matches, "capacity"))
        .max_threads_per_block(parse(matches, "max_block"))
        .build();
    device.register_function("add", |dim, args| {
        let value = args[1].as_scalar().ok_or("value must be a scalar")? as u8;
        let data = args[0].as_buffer().ok_or("data must be a buffer")?;
        let threads = dim.threads() as usize;
        for byte in data.iter_mut().take(threads) {
            *byte = byte.wrapping_add(value);
        }
        Ok(())
    });
    Arc::new(device)
}

fn run(matches: &ArgMatches<'_>) -> Result<(), Error> {
    let size = bytes_arg(matches, "size");
    let pairs: usize = parse(matches, "pairs");
    let fill: u8 = parse(matches, "fill");
    let add: u64 = parse(matches, "add");
    let dim = LaunchDim::new(parse(matches, "grid"), parse(matches, "block"))
        .with_shared_mem(parse(matches, "shared_mem"));
    let asynchronous = matches.is_present("async");

    let device = backend(matches);
    let add_fn = device
        .get_function("add")
        .ok_or_else(|| Error::Launch("add kernel missing".to_string()))?;
    let context = DeviceContext::new(device.clone());
    let mut worker = context.new_subscriber()?;
    worker.size_init(size)?;
    for index in 0..pairs {
        worker.host_init(index)?;
        worker.device_init(index)?;
        worker.transform_idx(index, |bytes| bytes.iter_mut().for_each(|b| *b = fill))?;
        worker.copy_host_to_device(index)?;
    }
    worker.set_dim(dim);

    let kernels = (0..pairs)
        .map(|index| KernelDescriptor::new(add_fn).buffer(index).scalar(add))
        .collect::<Vec<_>>();
    if asynchronous {
        let handles = kernels
            .iter()
            .map(|kernel| worker.launch_async(kernel))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("{} launches in flight", handles.len());
        for handle in handles {
            worker.wait(handle)?;
        }
    } else {
        for kernel in &kernels {
            worker.launch(kernel)?;
        }
    }

    let expected = fill.wrapping_add(add as u8);
    let threads = dim.threads() as usize;
    for index in 0..pairs {
        worker.swap_idx(index)?;
        let host = worker.get_host_copies_dx(index)?;
        let updated = host.iter().take(threads).all(|&b| b == expected);
        let untouched = host.iter().skip(threads).all(|&b| b == fill);
        println!(
            "[{}] {} bytes, first byte {}, {}",
            index,
            host.len(),
            host.first().copied().unwrap_or_default(),
            if updated && untouched { "ok" } else { "MISMATCH" }
        );
    }
    println!("{}", worker.get_info());
    println!(
        "{}: {} of {} bytes in use",
        device.name(),
        context.device_bytes_in_use(),
        device.capacity()
    );
    worker.cleanup();
    Ok(())
}

fn main() {
    let matches = App::new("cuda-worker")
        .about("Fill, copy and launch over host/device buffer pairs on an emulated device")
        .arg(
            Arg::with_name("size")
                .short("s")
                .help("Bytes per buffer, use value[K|M|G], e.g. 2K")
                .default_value("2048")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("pairs")
                .short("p")
                .help("How many buffer pairs the worker allocates")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fill")
                .short("f")
                .help("Byte written into every host buffer before the copy")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("add")
                .short("a")
                .help("Value the kernel adds to each byte it covers")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("grid")
                .short("g")
                .help("Blocks per launch")
                .default_value("8")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("block")
                .short("b")
                .help("Threads per block")
                .default_value("256")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("shared_mem")
                .short("m")
                .help("Shared memory per block in bytes")
                .default_value("0")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("capacity")
                .short("c")
                .help("Emulated device memory, use value[K|M|G]")
                .default_value("256M")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_block")
                .short("B")
                .help("Largest block size the emulated device accepts")
                .default_value("1024")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("async")
                .short("A")
                .help("Issue launches asynchronously and wait on their handles"),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();
    if let Err(e) = run(&matches) {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
