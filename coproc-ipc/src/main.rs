use clap::{Parser, Subcommand};
use coproc_ipc::config::default_host_interface;
use coproc_ipc::firmware::{self, ImageBuilder};
use coproc_ipc::sim::{CoprocessorModel, RegionKind, ServiceSpec, SimBootControl};
use coproc_ipc::{
    Direction, FirmwareImage, LinkState, Mailbox, ServiceDescriptor, ServiceDriver,
    StreamPosition, Transport, TransportConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Coprocessor IPC transport tools", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a firmware image without booting it
    Inspect {
        /// Path to the firmware image
        image: PathBuf,
    },

    /// Boot a simulated coprocessor and exercise its services
    Simulate {
        /// Firmware image to load (a generated image is used if omitted)
        #[arg(long)]
        image: Option<PathBuf>,

        /// Write a bincode snapshot of the link to this path on exit
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Number of loopback messages to exchange
        #[arg(long, default_value_t = 4)]
        messages: u32,

        /// Use small shared windows
        #[arg(long)]
        compact: bool,
    },
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

/// Consumer that just reports what it is offered.
struct LoggingDriver;

impl ServiceDriver for LoggingDriver {
    fn attach(&self, service: &ServiceDescriptor) -> Result<(), String> {
        print_status(&format!("Consumer attach: {}", service.name), "BOUND", true);
        Ok(())
    }

    fn detach(&self, service: &ServiceDescriptor) {
        print_status(&format!("Consumer detach: {}", service.name), "RELEASED", true);
    }
}

fn inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    print_section("FIRMWARE IMAGE");
    print_info("Path", &path.display().to_string());
    let bytes = firmware::load_image(path)?;
    let image = match FirmwareImage::parse(&bytes) {
        Ok(image) => image,
        Err(e) => {
            print_status("Structure", "MALFORMED", false);
            return Err(e.into());
        }
    };
    let h = &image.header;
    print_info("Size", &format!("{} bytes ({:.2} KiB)", bytes.len(), bytes.len() as f64 / 1024.0));
    print_info("Header version", &h.header_version.to_string());
    print_info("Firmware version", &format!("0x{:08X}", h.fw_version));
    print_info("Bootloader", &format!("0x{:X} (+0x{:X})", h.bootloader_offset, h.bootloader_size));
    print_info("Signature table", &format!("0x{:X} (+0x{:X})", h.sig_table_offset, h.sig_table_size));
    print_info("Sections", &format!("{} x {} bytes at 0x{:X}", h.section_count, h.section_entry_size, h.section_table_offset));
    for (core, (offset, size)) in h.core_data.iter().enumerate() {
        print_info(&format!("Core {} data", core), &format!("0x{:X} (+0x{:X})", offset, size));
    }
    print_info("SHA-256", &image.sha256_hex());
    print_status("Structure", "VALID", true);

    print_section("EXPORTED SYMBOLS");
    for sym in image.symbols() {
        print_info(&sym.name, &format!("0x{:08X}", sym.signature));
    }
    match image.check_interface(&default_host_interface()) {
        Ok(()) => print_status("Host interface", "COMPATIBLE", true),
        Err(e) => {
            print_status("Host interface", &e.to_string(), false);
            return Err(e.into());
        }
    }
    Ok(())
}

fn demo_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::new("echo")
            .up(RegionKind::Messages { slots: 8, slot_size: 124 })
            .down(RegionKind::Messages { slots: 8, slot_size: 124 }),
        ServiceSpec::new("audio_output_control")
            .up(RegionKind::Messages { slots: 4, slot_size: 60 })
            .down(RegionKind::Messages { slots: 4, slot_size: 60 }),
        ServiceSpec::new("audio_pcm").down(RegionKind::Ring { size: 4096 }),
    ]
}

fn simulate(
    image: Option<PathBuf>,
    dump: Option<PathBuf>,
    messages: u32,
    compact: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = if compact {
        TransportConfig::compact()
    } else {
        TransportConfig::default()
    };

    // ─── SHARED MEMORY ────────────────────────────────────────────────────────
    print_section("SHARED MEMORY");
    print_info("Fast window", &format!("{} bytes", config.fast_size));
    print_info("Bulk window", &format!("{} KiB", config.bulk_size / 1024));
    print_info("Device base", &format!("0x{:08X}", config.bulk_device_base));
    print_info("Control block", &format!("bulk+0x{:X}", config.control_block_offset));

    let mailbox = Arc::new(Mailbox::new());
    let transport = Transport::new(config.clone(), mailbox.clone(), Box::new(SimBootControl::new()))?;
    let mut device = CoprocessorModel::new(transport.bulk_region().clone(), config.control_block_offset);
    print_status("Windows", "MAPPED", true);

    // ─── FIRMWARE ─────────────────────────────────────────────────────────────
    print_section("FIRMWARE LOADING");
    let bytes = match image {
        Some(path) => {
            print_info("Source", &path.display().to_string());
            firmware::load_image(&path)?
        }
        None => {
            print_info("Source", "generated");
            ImageBuilder::new(0x0001_0000)
                .symbols(&default_host_interface())
                .payload(&[0u8; 256])
                .build()
        }
    };
    let entry = transport.load_and_boot(&bytes)?;
    print_info("Entry", &format!("0x{:08X}", entry));
    print_status("Reset sequence", "RELEASED", true);

    // ─── SERVICE DISCOVERY ────────────────────────────────────────────────────
    print_section("SERVICE DISCOVERY");
    transport.register_consumer("audio_*", Arc::new(LoggingDriver))?;
    device.bring_up(0x0001_0000, 0x0000_0003, &demo_services())?;
    let state = transport.notify()?;
    if state != LinkState::Online {
        print_status("Link", &format!("{:?}", state), false);
        return Err("coprocessor did not come online".into());
    }
    print_status("Link", "ONLINE", true);
    print_info("Services", &transport.service_count().to_string());
    for info in transport.registry().services() {
        let d = &info.descriptor;
        print_info(
            &d.name,
            &format!(
                "up {}x{}{}  down {}x{}{}",
                d.up.slots,
                d.up.slot_size,
                if d.up.is_ring { " ring" } else { "" },
                d.down.slots,
                d.down.slot_size,
                if d.down.is_ring { " ring" } else { "" },
            ),
        );
    }

    // ─── LOOPBACK ─────────────────────────────────────────────────────────────
    print_section("LOOPBACK");
    let echo = transport.acquire("echo")?;
    let mut buf = vec![0u8; 124];
    for i in 0..messages {
        let msg = format!("ping {}", i);
        transport.write(&echo, msg.as_bytes(), true)?;
        if let Some(received) = device.pop_down("echo")? {
            let mut reply = received.clone();
            reply.reverse();
            device.push_up("echo", &reply)?;
        }
        transport.notify()?;
        let n = transport.read(&echo, &mut buf, true)?;
        print_info(&msg, &String::from_utf8_lossy(&buf[..n]));
    }
    print_info("Doorbell rings", &mailbox.rings().to_string());
    transport.release(&echo)?;
    print_status("Echo service", "OK", true);

    // ─── STREAMING ────────────────────────────────────────────────────────────
    print_section("STREAMING");
    let pcm = transport.acquire("audio_pcm")?;
    let start = transport.ring_counter(&pcm, Direction::Down)?;
    let mut position = StreamPosition::open(start, 4096);
    let chunk = [0x55u8; 1000];
    for _ in 0..6 {
        let written = match transport.write(&pcm, &chunk, false) {
            Ok(n) => n,
            Err(coproc_ipc::IoError::ShortWrite(n)) => n,
            Err(e) => return Err(e.into()),
        };
        let consumed = device.ring_pop("audio_pcm", 700)?.len();
        let raw = transport.ring_counter(&pcm, Direction::Down)?;
        print_info(
            &format!("wrote {} / played {}", written, consumed),
            &format!(
                "position {} (consumed {} bytes)",
                position.advance(raw),
                position.consumed_bytes()
            ),
        );
    }
    transport.release(&pcm)?;
    print_status("PCM ring", "OK", true);

    // ─── SNAPSHOT ─────────────────────────────────────────────────────────────
    if let Some(path) = dump {
        print_section("SNAPSHOT");
        let snapshot = transport.snapshot(true);
        snapshot.save_to_path(&path)?;
        print_info("Path", &path.display().to_string());
        for region in &snapshot.memory {
            print_info(&format!("{} sha256", region.name), &region.hash);
        }
        print_status("Snapshot", "WRITTEN", true);
    }

    // ─── SHUTDOWN ─────────────────────────────────────────────────────────────
    print_section("SHUTDOWN");
    device.crash()?;
    let state = transport.notify()?;
    print_status("Link", &format!("{:?}", state), state == LinkState::Offline);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Inspect { image } => inspect(&image),
        Command::Simulate {
            image,
            dump,
            messages,
            compact,
        } => simulate(image, dump, messages, compact),
    }
}
