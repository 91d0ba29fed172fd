//! Host side of the coprocessor link.
//!
//! `Transport` owns the two shared windows, the link state machine and the
//! service registry. The coprocessor's single payload-free notification is
//! delivered through [`Transport::notify`]; everything else is re-read from
//! shared memory.

use crate::channel::{CancelToken, IoError, ServiceChannel};
use crate::config::{ConfigError, TransportConfig};
use crate::control::{ControlBlock, ControlMonitor, LinkState};
use crate::doorbell::Doorbell;
use crate::firmware::{self, BootControl, FirmwareError};
use crate::region::SharedRegion;
use crate::registry::{
    AcquireError, ConsumerId, RegisterError, Registry, ReleaseError, ServiceDriver, ServiceHandle,
};
use crate::snapshot::{MemRegionSnapshot, SNAPSHOT_VERSION, ServiceSnapshot, TransportSnapshot};
use crate::table::{self, Direction, DiscoveryError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct Transport {
    config: TransportConfig,
    fast: Arc<SharedRegion>,
    bulk: Arc<SharedRegion>,
    control: ControlMonitor,
    registry: Registry,
    doorbell: Arc<dyn Doorbell>,
    boot: Box<dyn BootControl>,
    /// Serializes boot, notification handling and teardown.
    lifecycle: Mutex<()>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        doorbell: Arc<dyn Doorbell>,
        boot: Box<dyn BootControl>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        log::debug!(
            "transport: fast={:#x} bulk={:#x} control block at bulk+{:#x}",
            config.fast_size,
            config.bulk_size,
            config.control_block_offset
        );
        Ok(Self {
            fast: Arc::new(SharedRegion::new("fast", config.fast_size)),
            bulk: Arc::new(SharedRegion::new("bulk", config.bulk_size)),
            control: ControlMonitor::new(config.control_block_offset),
            registry: Registry::new(),
            doorbell,
            boot,
            lifecycle: Mutex::new(()),
            config,
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn fast_region(&self) -> &Arc<SharedRegion> {
        &self.fast
    }

    pub fn bulk_region(&self) -> &Arc<SharedRegion> {
        &self.bulk
    }

    // ========== LINK LIFECYCLE ==========

    /// Validate and copy `image`, install the trampoline and release the
    /// coprocessor from reset. Moves the link `Offline -> Booting`; the link
    /// only becomes `Online` on a later notification.
    pub fn load_and_boot(&self, image: &[u8]) -> Result<u32, FirmwareError> {
        let _guard = self.lock_lifecycle();
        self.control.begin_boot().map_err(FirmwareError::Busy)?;
        match firmware::load_and_boot(image, &self.config, &self.fast, &self.bulk, &*self.boot) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                log::error!("firmware load failed: {}", e);
                if let Err(state) = self.control.abort_boot() {
                    log::error!("link moved to {:?} during firmware load", state);
                }
                Err(e)
            }
        }
    }

    /// Handle a notification from the coprocessor.
    ///
    /// * `Booting`: if the control block is valid, discover the service
    ///   table and go `Online`. A notification without the magic is ignored.
    ///   A table that fails validation leaves the link `Booting`.
    /// * `Online`: wake every blocked reader and writer so they re-check. If
    ///   the magic has disappeared the coprocessor has crashed and the link
    ///   is torn down.
    /// * `Offline`: ignored.
    pub fn notify(&self) -> Result<LinkState, DiscoveryError> {
        let _guard = self.lock_lifecycle();
        match self.control.state() {
            LinkState::Offline => {
                log::debug!("notification while offline ignored");
                Ok(LinkState::Offline)
            }
            LinkState::Booting => self.complete_boot(),
            LinkState::Online => {
                if !self.refresh_control().is_valid() {
                    log::warn!("control block magic lost, coprocessor crashed");
                    self.teardown();
                    return Ok(LinkState::Offline);
                }
                for channel in self.registry.channels() {
                    channel.notify();
                }
                Ok(LinkState::Online)
            }
        }
    }

    fn refresh_control(&self) -> ControlBlock {
        self.control.refresh(&self.bulk).unwrap_or_else(|e| {
            log::error!("control block unreadable: {}", e);
            ControlBlock::default()
        })
    }

    fn complete_boot(&self) -> Result<LinkState, DiscoveryError> {
        let block = self.refresh_control();
        if !block.is_valid() {
            log::debug!("spurious notification during boot (magic {:#010x})", block.magic);
            return Ok(LinkState::Booting);
        }
        let services = table::discover(&self.bulk, &block).map_err(|e| {
            log::error!("service table rejected: {}", e);
            e
        })?;
        let channels = services
            .into_iter()
            .map(|desc| Arc::new(ServiceChannel::new(desc, self.bulk.clone(), self.doorbell.clone())))
            .collect();
        self.registry.publish(channels);
        if let Err(state) = self.control.mark_online() {
            log::error!("link moved to {:?} during discovery", state);
            return Ok(state);
        }
        log::info!(
            "coprocessor online: fw={:#x} hw={:#x}, {} services",
            block.fw_version,
            block.hw_version,
            self.registry.service_count()
        );
        Ok(LinkState::Online)
    }

    fn teardown(&self) {
        self.registry.retract_all();
        self.control.force_offline();
    }

    /// Explicit teardown: retract every service, fail blocked callers and
    /// report `Offline`. Also used when the notification channel is lost.
    pub fn go_offline(&self) {
        let _guard = self.lock_lifecycle();
        self.teardown();
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.control.is_online()
    }

    pub fn state(&self) -> LinkState {
        self.control.state()
    }

    /// Firmware version reported by the running coprocessor.
    pub fn firmware_version(&self) -> Option<u32> {
        self.is_online().then(|| self.control.observed().fw_version)
    }

    pub fn hardware_version(&self) -> Option<u32> {
        self.is_online().then(|| self.control.observed().hw_version)
    }

    // ========== SERVICES ==========

    /// Number of discovered services; 0 unless online.
    pub fn service_count(&self) -> usize {
        if self.is_online() {
            self.registry.service_count()
        } else {
            0
        }
    }

    pub fn register_consumer(
        &self,
        pattern: &str,
        driver: Arc<dyn ServiceDriver>,
    ) -> Result<ConsumerId, RegisterError> {
        self.registry.register_consumer(pattern, driver)
    }

    pub fn unregister_consumer(&self, id: ConsumerId) {
        self.registry.unregister_consumer(id)
    }

    pub fn acquire(&self, name: &str) -> Result<ServiceHandle, AcquireError> {
        self.registry.acquire(name)
    }

    pub fn release(&self, handle: &ServiceHandle) -> Result<(), ReleaseError> {
        self.registry.release(handle)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ========== I/O ==========

    fn channel<'a>(&self, handle: &'a ServiceHandle) -> Result<&'a Arc<ServiceChannel>, IoError> {
        if handle.generation() != self.registry.generation() {
            return Err(IoError::Disconnected);
        }
        Ok(handle.channel())
    }

    pub fn read(&self, handle: &ServiceHandle, buf: &mut [u8], block: bool) -> Result<usize, IoError> {
        self.channel(handle)?.read(buf, block)
    }

    pub fn write(&self, handle: &ServiceHandle, buf: &[u8], block: bool) -> Result<usize, IoError> {
        self.channel(handle)?.write(buf, block)
    }

    pub fn read_cancellable(
        &self,
        handle: &ServiceHandle,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, IoError> {
        self.channel(handle)?.read_cancellable(buf, cancel)
    }

    pub fn write_cancellable(
        &self,
        handle: &ServiceHandle,
        buf: &[u8],
        cancel: &CancelToken,
    ) -> Result<usize, IoError> {
        self.channel(handle)?.write_cancellable(buf, cancel)
    }

    pub fn readable(&self, handle: &ServiceHandle) -> Result<u32, IoError> {
        self.channel(handle)?.readable()
    }

    pub fn writable(&self, handle: &ServiceHandle) -> Result<u32, IoError> {
        self.channel(handle)?.writable()
    }

    pub fn flush_read(&self, handle: &ServiceHandle) -> Result<u32, IoError> {
        self.channel(handle)?.flush_read()
    }

    /// Raw counter the coprocessor advances in direction `dir`: `tx` for
    /// data it produces, `rx` for data it consumes. Feed it to
    /// [`StreamPosition`](crate::position::StreamPosition).
    pub fn ring_counter(&self, handle: &ServiceHandle, dir: Direction) -> Result<u32, IoError> {
        let (tx, rx) = self.channel(handle)?.counters(dir)?;
        Ok(match dir {
            Direction::Up => tx,
            Direction::Down => rx,
        })
    }

    // ========== DEBUGGING ==========

    /// Capture the link state. Window contents are included only when
    /// `with_data` is set; digests always are.
    pub fn snapshot(&self, with_data: bool) -> TransportSnapshot {
        let channels = self.registry.channels();
        let services = self
            .registry
            .services()
            .into_iter()
            .map(|info| {
                let channel = channels.iter().find(|c| c.index() == info.descriptor.index);
                let counters = |dir| {
                    channel
                        .and_then(|c| c.counters(dir).ok())
                        .unwrap_or_default()
                };
                let (up, down) = (counters(Direction::Up), counters(Direction::Down));
                ServiceSnapshot { info, up, down }
            })
            .collect();
        TransportSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            state: self.control.state(),
            control: self.control.observed(),
            generation: self.registry.generation(),
            services,
            memory: vec![
                MemRegionSnapshot::capture(&self.fast, with_data),
                MemRegionSnapshot::capture(&self.bulk, with_data),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_host_interface;
    use crate::doorbell::Mailbox;
    use crate::firmware::ImageBuilder;
    use crate::layout::{CONTROL_MAGIC, TRAMPOLINE_JUMP};
    use crate::position::StreamPosition;
    use crate::sim::{CoprocessorModel, RegionKind, ServiceSpec, SimBootControl};
    use crate::table::ServiceDescriptor;
    use std::thread;
    use std::time::Duration;

    struct Rig {
        transport: Arc<Transport>,
        sim: CoprocessorModel,
        mailbox: Arc<Mailbox>,
        boot: Arc<SimBootControl>,
    }

    fn rig() -> Rig {
        let mailbox = Arc::new(Mailbox::new());
        let boot = Arc::new(SimBootControl::new());
        let config = TransportConfig::compact();
        let transport =
            Transport::new(config.clone(), mailbox.clone(), Box::new(boot.clone())).unwrap();
        let sim =
            CoprocessorModel::new(transport.bulk_region().clone(), config.control_block_offset);
        Rig {
            transport: Arc::new(transport),
            sim,
            mailbox,
            boot,
        }
    }

    fn image() -> Vec<u8> {
        ImageBuilder::new(0x0207)
            .symbols(&default_host_interface())
            .payload(&[0x5A; 64])
            .build()
    }

    fn standard_services() -> Vec<ServiceSpec> {
        vec![
            ServiceSpec::new("echo")
                .up(RegionKind::Messages { slots: 4, slot_size: 60 })
                .down(RegionKind::Messages { slots: 4, slot_size: 60 }),
            ServiceSpec::new("audio_output_control")
                .up(RegionKind::Messages { slots: 2, slot_size: 28 })
                .down(RegionKind::Messages { slots: 2, slot_size: 28 }),
            ServiceSpec::new("audio_pcm").down(RegionKind::Ring { size: 256 }),
            ServiceSpec::new("mic").up(RegionKind::Ring { size: 128 }),
        ]
    }

    fn online(rig: &mut Rig) {
        rig.transport.load_and_boot(&image()).unwrap();
        rig.sim.bring_up(0x0207, 0x11, &standard_services()).unwrap();
        assert_eq!(rig.transport.notify(), Ok(LinkState::Online));
    }

    #[test]
    fn test_boot_to_online() {
        let mut rig = rig();
        assert_eq!(rig.transport.state(), LinkState::Offline);
        assert_eq!(rig.transport.acquire("echo").unwrap_err(), AcquireError::NotYetOnline);

        rig.transport.load_and_boot(&image()).unwrap();
        assert_eq!(rig.transport.state(), LinkState::Booting);
        assert_eq!(rig.boot.resets(), 1);
        assert_eq!(rig.transport.fast_region().load_32(0).unwrap(), TRAMPOLINE_JUMP);

        // Notification before the coprocessor published anything.
        assert_eq!(rig.transport.notify(), Ok(LinkState::Booting));
        assert!(!rig.transport.is_online());

        rig.sim.bring_up(0x0207, 0x11, &standard_services()).unwrap();
        assert_eq!(rig.transport.notify(), Ok(LinkState::Online));
        assert!(rig.transport.is_online());
        assert_eq!(rig.transport.service_count(), 4);
        assert_eq!(rig.transport.firmware_version(), Some(0x0207));
        assert_eq!(rig.transport.hardware_version(), Some(0x11));
    }

    #[test]
    fn test_boot_rejected_while_not_offline() {
        let mut rig = rig();
        online(&mut rig);
        assert!(matches!(
            rig.transport.load_and_boot(&image()),
            Err(FirmwareError::Busy(LinkState::Online))
        ));
    }

    #[test]
    fn test_failed_boot_returns_offline() {
        let rig = rig();
        assert!(matches!(
            rig.transport.load_and_boot(&[0u8; 8]),
            Err(FirmwareError::Malformed(_))
        ));
        assert_eq!(rig.transport.state(), LinkState::Offline);

        rig.boot.set_failing(true);
        assert!(matches!(
            rig.transport.load_and_boot(&image()),
            Err(FirmwareError::ResetFailed(_))
        ));
        assert_eq!(rig.transport.state(), LinkState::Offline);
    }

    #[test]
    fn test_invalid_table_registers_nothing() {
        let mut rig = rig();
        rig.transport.load_and_boot(&image()).unwrap();
        rig.sim
            .bring_up(
                1,
                1,
                &[
                    ServiceSpec::new("a").up(RegionKind::Ring { size: 16 }),
                    ServiceSpec::new("b"),
                    ServiceSpec::new("c").down(RegionKind::Ring { size: 16 }),
                ],
            )
            .unwrap();
        assert_eq!(rig.transport.notify(), Err(DiscoveryError::Unusable(1)));
        assert_eq!(rig.transport.state(), LinkState::Booting);
        assert_eq!(rig.transport.service_count(), 0);
        assert_eq!(rig.transport.acquire("a").unwrap_err(), AcquireError::NotYetOnline);
    }

    #[test]
    fn test_empty_table_rejected() {
        let mut rig = rig();
        rig.transport.load_and_boot(&image()).unwrap();
        rig.sim.bring_up(1, 1, &[]).unwrap();
        assert_eq!(rig.transport.notify(), Err(DiscoveryError::Empty));
    }

    #[test]
    fn test_message_exchange_and_doorbell() {
        let mut rig = rig();
        online(&mut rig);
        let echo = rig.transport.acquire("echo").unwrap();

        assert_eq!(rig.transport.write(&echo, b"hello", false), Ok(5));
        assert_eq!(rig.mailbox.take_pending(), 1 << echo.index());
        assert_eq!(rig.sim.pop_down("echo").unwrap().as_deref(), Some(&b"hello"[..]));

        let mut buf = [0u8; 60];
        assert_eq!(rig.transport.read(&echo, &mut buf, false), Err(IoError::WouldBlock));
        assert!(rig.sim.push_up("echo", b"olleh").unwrap());
        rig.transport.notify().unwrap();
        assert_eq!(rig.transport.readable(&echo), Ok(1));
        assert_eq!(rig.transport.read(&echo, &mut buf, false), Ok(5));
        assert_eq!(&buf[..5], b"olleh");
        rig.transport.release(&echo).unwrap();
    }

    #[test]
    fn test_acquire_release_acquire() {
        let mut rig = rig();
        online(&mut rig);
        let handle = rig.transport.acquire("echo").unwrap();
        assert_eq!(
            rig.transport.acquire("echo").unwrap_err(),
            AcquireError::AlreadyClaimed("echo".into())
        );
        rig.transport.release(&handle).unwrap();
        assert!(rig.transport.acquire("echo").is_ok());
        assert_eq!(
            rig.transport.acquire("gps").unwrap_err(),
            AcquireError::NotFound("gps".into())
        );
    }

    #[test]
    fn test_blocking_read_woken_by_notification() {
        let mut rig = rig();
        online(&mut rig);
        let echo = rig.transport.acquire("echo").unwrap();
        let reader = {
            let transport = rig.transport.clone();
            let echo = echo.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 60];
                let n = transport.read(&echo, &mut buf, true)?;
                Ok::<_, IoError>(buf[..n].to_vec())
            })
        };
        thread::sleep(Duration::from_millis(20));
        rig.sim.push_up("echo", b"wake").unwrap();
        rig.transport.notify().unwrap();
        assert_eq!(reader.join().unwrap(), Ok(b"wake".to_vec()));
    }

    #[test]
    fn test_blocking_read_during_teardown_is_disconnected() {
        let mut rig = rig();
        online(&mut rig);
        let echo = rig.transport.acquire("echo").unwrap();
        let reader = {
            let transport = rig.transport.clone();
            let echo = echo.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 60];
                transport.read(&echo, &mut buf, true)
            })
        };
        thread::sleep(Duration::from_millis(20));
        rig.transport.go_offline();
        assert_eq!(reader.join().unwrap(), Err(IoError::Disconnected));
        assert_eq!(rig.transport.state(), LinkState::Offline);
        assert_eq!(rig.transport.service_count(), 0);
        assert_eq!(rig.transport.release(&echo), Err(ReleaseError::Stale("echo".into())));
    }

    #[test]
    fn test_crash_detected_on_notification() {
        let mut rig = rig();
        online(&mut rig);
        let echo = rig.transport.acquire("echo").unwrap();
        rig.sim.crash().unwrap();
        assert_eq!(rig.transport.notify(), Ok(LinkState::Offline));
        assert!(!rig.transport.is_online());
        assert_eq!(rig.transport.write(&echo, b"x", false), Err(IoError::Disconnected));
        assert_eq!(rig.transport.acquire("echo").unwrap_err(), AcquireError::NotYetOnline);
        assert_eq!(rig.transport.firmware_version(), None);
    }

    #[test]
    fn test_reboot_after_crash() {
        let mut rig = rig();
        online(&mut rig);
        rig.sim.crash().unwrap();
        rig.transport.notify().unwrap();
        rig.transport.load_and_boot(&image()).unwrap();
        // The previous table must not satisfy the new boot.
        let stale = ControlBlock::read_from(
            rig.transport.bulk_region(),
            rig.transport.config().control_block_offset,
        )
        .unwrap();
        assert_ne!(stale.magic, CONTROL_MAGIC);
        assert_eq!(rig.transport.notify(), Ok(LinkState::Booting));
        rig.sim.bring_up(0x0208, 0x11, &standard_services()).unwrap();
        assert_eq!(rig.transport.notify(), Ok(LinkState::Online));
        assert_eq!(rig.transport.firmware_version(), Some(0x0208));
    }

    #[test]
    fn test_cancelled_write() {
        let mut rig = rig();
        online(&mut rig);
        let ctl = rig.transport.acquire("audio_output_control").unwrap();
        rig.transport.write(&ctl, b"1", false).unwrap();
        rig.transport.write(&ctl, b"2", false).unwrap();
        let token = CancelToken::new();
        let writer = {
            let transport = rig.transport.clone();
            let token = token.clone();
            thread::spawn(move || transport.write_cancellable(&ctl, b"3", &token))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(writer.join().unwrap(), Err(IoError::Interrupted));
    }

    fn fill_control(rig: &Rig) -> ServiceHandle {
        let ctl = rig.transport.acquire("audio_output_control").unwrap();
        rig.transport.write(&ctl, b"1", false).unwrap();
        rig.transport.write(&ctl, b"2", false).unwrap();
        assert_eq!(rig.transport.write(&ctl, b"3", false), Err(IoError::WouldBlock));
        ctl
    }

    #[test]
    fn test_blocking_write_woken_when_slot_frees() {
        let mut rig = rig();
        online(&mut rig);
        let ctl = fill_control(&rig);
        let writer = {
            let transport = rig.transport.clone();
            let ctl = ctl.clone();
            thread::spawn(move || transport.write(&ctl, b"3", true))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            rig.sim.pop_down("audio_output_control").unwrap().as_deref(),
            Some(&b"1"[..])
        );
        rig.transport.notify().unwrap();
        assert_eq!(writer.join().unwrap(), Ok(1));
        assert_eq!(
            rig.sim.pop_down("audio_output_control").unwrap().as_deref(),
            Some(&b"2"[..])
        );
        assert_eq!(
            rig.sim.pop_down("audio_output_control").unwrap().as_deref(),
            Some(&b"3"[..])
        );
    }

    #[test]
    fn test_blocking_write_during_teardown_is_disconnected() {
        let mut rig = rig();
        online(&mut rig);
        let ctl = fill_control(&rig);
        let writer = {
            let transport = rig.transport.clone();
            let ctl = ctl.clone();
            thread::spawn(move || transport.write(&ctl, b"3", true))
        };
        thread::sleep(Duration::from_millis(20));
        rig.transport.go_offline();
        assert_eq!(writer.join().unwrap(), Err(IoError::Disconnected));
        assert_eq!(rig.transport.write(&ctl, b"4", false), Err(IoError::Disconnected));
    }

    #[test]
    fn test_ring_stream_position() {
        let mut rig = rig();
        online(&mut rig);
        let pcm = rig.transport.acquire("audio_pcm").unwrap();
        let start = rig.transport.ring_counter(&pcm, Direction::Down).unwrap();
        let mut pos = StreamPosition::open(start, 256);

        assert_eq!(rig.transport.writable(&pcm), Ok(256));
        assert_eq!(rig.transport.write(&pcm, &[7u8; 200], false), Ok(200));
        assert_eq!(
            rig.transport.write(&pcm, &[8u8; 100], false),
            Err(IoError::ShortWrite(56))
        );
        assert_eq!(rig.sim.ring_pop("audio_pcm", 100).unwrap().len(), 100);
        let raw = rig.transport.ring_counter(&pcm, Direction::Down).unwrap();
        assert_eq!(pos.poll(raw), Some(100));
        assert_eq!(pos.poll(raw), None);
    }

    #[test]
    fn test_ring_read_and_flush() {
        let mut rig = rig();
        online(&mut rig);
        let mic = rig.transport.acquire("mic").unwrap();
        rig.sim.ring_push("mic", b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(rig.transport.read(&mic, &mut buf, false), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(rig.transport.flush_read(&mic), Ok(2));
        assert_eq!(rig.transport.read(&mic, &mut buf, false), Err(IoError::WouldBlock));
        assert_eq!(
            rig.transport.write(&mic, b"x", false),
            Err(IoError::DirectionUnsupported)
        );
    }

    struct Recorder {
        tag: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ServiceDriver for Recorder {
        fn attach(&self, service: &ServiceDescriptor) -> Result<(), String> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}+{}", self.tag, service.name));
            Ok(())
        }

        fn detach(&self, service: &ServiceDescriptor) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}-{}", self.tag, service.name));
        }
    }

    #[test]
    fn test_exact_consumer_beats_glob() {
        let mut rig = rig();
        let events = Arc::new(Mutex::new(Vec::new()));
        rig.transport
            .register_consumer(
                "audio_*",
                Arc::new(Recorder {
                    tag: "glob",
                    events: events.clone(),
                }),
            )
            .unwrap();
        rig.transport
            .register_consumer(
                "audio_output_control",
                Arc::new(Recorder {
                    tag: "exact",
                    events: events.clone(),
                }),
            )
            .unwrap();
        online(&mut rig);
        let seen = events.lock().unwrap().clone();
        assert!(seen.contains(&"exact+audio_output_control".to_string()));
        assert!(!seen.contains(&"glob+audio_output_control".to_string()));
        assert!(seen.contains(&"glob+audio_pcm".to_string()));

        rig.transport.go_offline();
        let seen = events.lock().unwrap().clone();
        assert!(seen.contains(&"exact-audio_output_control".to_string()));
        assert!(seen.contains(&"glob-audio_pcm".to_string()));
    }

    #[test]
    fn test_snapshot_reflects_services() {
        let mut rig = rig();
        online(&mut rig);
        let echo = rig.transport.acquire("echo").unwrap();
        rig.transport.write(&echo, b"snap", false).unwrap();
        let snap = rig.transport.snapshot(false);
        assert_eq!(snap.state, LinkState::Online);
        assert_eq!(snap.services.len(), 4);
        assert_eq!(snap.services[0].info.claim_count, 1);
        assert_eq!(snap.services[0].down, (1, 0));
        assert_eq!(snap.memory.len(), 2);
        assert!(snap.memory.iter().all(|m| m.data.is_none()));
    }
}
