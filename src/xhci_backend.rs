//! The vfio-user hosting glue: region dispatch, guest-memory mapping and
//! interrupt plumbing for the virtual xHCI controller.

use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use nusb::MaybeFuture;
use tracing::{debug, info, trace, warn};

use vfio_bindings::bindings::vfio::{
    vfio_region_info, VFIO_PCI_BAR0_REGION_INDEX, VFIO_PCI_BAR1_REGION_INDEX,
    VFIO_PCI_BAR2_REGION_INDEX, VFIO_PCI_BAR3_REGION_INDEX, VFIO_PCI_BAR4_REGION_INDEX,
    VFIO_PCI_BAR5_REGION_INDEX, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_MSI_IRQ_INDEX,
    VFIO_PCI_NUM_IRQS, VFIO_PCI_NUM_REGIONS, VFIO_REGION_INFO_FLAG_READ,
    VFIO_REGION_INFO_FLAG_WRITE,
};
use vfio_user::{IrqInfo, ServerBackend};

use crate::cli::{CapProfile, Cli};
use crate::device::{
    bus::{BusDeviceRef, Request, RequestSize},
    interrupt_line::{DummyInterruptLine, InterruptLine},
    pci::traits::PciDevice,
    pci::xhci::{
        BackendFactory, ExcapProfile, ExtendedCaps, FileRoleSwitch, RoleSwitchSink, XhciDevice,
    },
    usb::passthrough::PassthroughDevice,
    usb::tablet::UsbTablet,
    usb::{DevicePath, NativeDeviceInfo, NativeKind, UsbSpeed},
};

use crate::{dynamic_bus::DynamicBus, memory_segment::MemorySegment};

/// Physical devices opened at startup, keyed by their configured path.
type NativeRegistry = Arc<Mutex<Vec<(DevicePath, nusb::Device)>>>;

/// The vfio-user server backend wrapping one [`XhciDevice`].
pub struct XhciBackend {
    dma_bus: Arc<DynamicBus>,
    device: XhciDevice,
    registry: NativeRegistry,
}

impl std::fmt::Debug for XhciBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XhciBackend")
            .field("device", &self.device)
            .field("native_devices", &self.registry.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct InterruptEventFd {
    /// Writes to the eventfd are one-shot and safe from any thread; the
    /// mutex only provides the interior mutability the trait asks for.
    fd: Mutex<File>,
}

impl InterruptLine for InterruptEventFd {
    fn interrupt(&self) {
        if let Err(error) = self.fd.lock().unwrap().write(&1u64.to_le_bytes()) {
            warn!("failed to signal interrupt eventfd: {error}");
        }
    }
}

impl XhciBackend {
    /// Create a virtual xHCI controller from the command line
    /// configuration.
    pub fn new(args: &Cli) -> Result<Self> {
        let dma_bus = Arc::new(DynamicBus::new());

        let sink: Option<Box<dyn RoleSwitchSink>> = args
            .drd_switch
            .as_ref()
            .map(|path| Box::new(FileRoleSwitch::new(path.clone())) as Box<dyn RoleSwitchSink>);
        let excaps = match args.cap {
            CapProfile::Default => ExtendedCaps::new(ExcapProfile::Default, None),
            CapProfile::Drd => ExtendedCaps::new(ExcapProfile::Drd, sink),
        };

        let registry: NativeRegistry = Arc::new(Mutex::new(vec![]));
        let factory = Self::backend_factory(registry.clone());

        let device = XhciDevice::new(dma_bus.clone() as BusDeviceRef, excaps, factory);

        let backend = Self {
            dma_bus,
            device,
            registry,
        };

        for name in &args.devices {
            backend.add_emulated_device(name)?;
        }
        for spec in &args.passthrough {
            backend.add_native_device_from_spec(spec)?;
        }

        Ok(backend)
    }

    /// The factory the controller uses to instantiate a pass-through
    /// backend when the guest addresses a physical device.
    fn backend_factory(registry: NativeRegistry) -> BackendFactory {
        Box::new(move |di| {
            let device = registry
                .lock()
                .unwrap()
                .iter()
                .find(|(path, _)| *path == di.path)
                .map(|(_, device)| device.clone())
                .with_context(|| format!("no opened native device for {}", di.path))?;

            Ok(Box::new(PassthroughDevice::new(device, *di)?))
        })
    }

    fn add_emulated_device(&self, name: &str) -> Result<()> {
        match name {
            "tablet" => {
                // The input-injection handle would go to a UI; the daemon
                // has none, the device simply enumerates and idles.
                let (tablet, _handle) = UsbTablet::new();
                let port = self.device.attach_device(Box::new(tablet))?;
                info!("emulated tablet attached to port {port}");
                Ok(())
            }
            other => bail!("unknown emulated device type: {other}"),
        }
    }

    /// Whitelist and announce a physical device given as
    /// `BUS-PORT=/dev/bus/usb/...`.
    fn add_native_device_from_spec(&self, spec: &str) -> Result<()> {
        let (place, file) = spec
            .split_once('=')
            .context("expected BUS-PORT=PATH for --passthrough")?;
        let (bus, port) = place
            .split_once('-')
            .context("expected BUS-PORT for --passthrough")?;
        let bus: u8 = bus.parse().context("invalid bus number")?;
        let port: u8 = port.parse().context("invalid port number")?;

        self.add_native_device(DevicePath::new(bus, &[port]), file)
    }

    /// Open a USB device file and announce it on the given physical
    /// path.
    pub fn add_native_device(&self, path: DevicePath, file: impl AsRef<Path>) -> Result<()> {
        let file: &Path = file.as_ref();
        let handle = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(file)
            .with_context(|| format!("Failed to open USB device file: {}", file.display()))?;

        let device = nusb::Device::from_fd(handle.into())
            .wait()
            .with_context(|| format!("Failed to open USB device: {}", file.display()))?;

        // Querying the configuration doubles as a check that the file
        // actually is a USB device we can talk to.
        let configuration = device
            .active_configuration()
            .context("Failed to query active configuration")?;
        debug!("device configuration: {configuration:?}");

        let speed = device
            .speed()
            .map(Into::into)
            .unwrap_or(UsbSpeed::High);
        let info = NativeDeviceInfo {
            path,
            speed,
            vid: 0,
            pid: 0,
            bcd: speed.usb_version(),
            kind: NativeKind::Device,
        };

        self.registry.lock().unwrap().push((path, device));

        if !self.device.assign_native_port(info) {
            bail!("no free native port entry for {path}");
        }
        self.device.on_connect(&info);

        info!("native device {} announced", path);
        Ok(())
    }

    /// Return a list of regions for [`vfio_user::Server::new`].
    pub fn regions(&self) -> Vec<vfio_region_info> {
        (0..VFIO_PCI_NUM_REGIONS)
            .map(|i| {
                let empty_region = vfio_region_info {
                    argsz: size_of::<vfio_region_info>() as u32,
                    index: i,
                    ..Default::default()
                };

                match i {
                    VFIO_PCI_CONFIG_REGION_INDEX => {
                        debug!("Client queried config space region");

                        vfio_region_info {
                            argsz: size_of::<vfio_region_info>() as u32,
                            index: i,
                            size: 256,
                            flags: VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
                            ..Default::default()
                        }
                    }

                    VFIO_PCI_BAR0_REGION_INDEX
                    | VFIO_PCI_BAR1_REGION_INDEX
                    | VFIO_PCI_BAR2_REGION_INDEX
                    | VFIO_PCI_BAR3_REGION_INDEX
                    | VFIO_PCI_BAR4_REGION_INDEX
                    | VFIO_PCI_BAR5_REGION_INDEX => {
                        let bar_no = i - VFIO_PCI_BAR0_REGION_INDEX;

                        if let Some(bar_info) = u8::try_from(bar_no)
                            .ok()
                            .and_then(|bar_no| self.device.bar(bar_no))
                        {
                            debug!("Client queried BAR{bar_no} region: {:?}", bar_info);
                            vfio_region_info {
                                argsz: size_of::<vfio_region_info>() as u32,
                                index: i,
                                size: bar_info.size.into(),
                                flags: VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
                                ..Default::default()
                            }
                        } else {
                            debug!("Client queried BAR{bar_no} region: (empty)");
                            empty_region
                        }
                    }

                    unknown => {
                        debug!("Client queried unknown VFIO region: {unknown}");
                        empty_region
                    }
                }
            })
            .collect()
    }

    /// Return a list of IRQs for [`vfio_user::Server::new`].
    pub fn irqs(&self) -> Vec<IrqInfo> {
        (0..VFIO_PCI_NUM_IRQS)
            .map(|index| IrqInfo {
                index,
                count: match index {
                    VFIO_PCI_MSI_IRQ_INDEX => 1,
                    _ => 0,
                },
                flags: 0,
            })
            .collect()
    }

    fn value_from_bytes(data: &[u8]) -> u64 {
        match data.len() {
            1 => data[0].into(),
            2 => u16::from_le_bytes(data.try_into().unwrap()).into(),
            4 => u32::from_le_bytes(data.try_into().unwrap()).into(),
            8 => u64::from_le_bytes(data.try_into().unwrap()),
            invalid => {
                warn!("unsupported access width {invalid}, dropping write");
                0
            }
        }
    }
}

impl ServerBackend for XhciBackend {
    fn region_read(
        &mut self,
        region: u32,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), std::io::Error> {
        trace!("read  region {region} offset {offset:#x}+{}", data.len());

        let Ok(size) = RequestSize::try_from(data.len() as u64) else {
            data.fill(0xFF);
            return Ok(());
        };

        let value: u64 = match region {
            VFIO_PCI_CONFIG_REGION_INDEX => self.device.read_cfg(Request::new(offset, size)),
            0 => self.device.read_io(0, Request::new(offset, size)),
            _ => !0u64,
        };

        data.copy_from_slice(&value.to_le_bytes()[0..data.len()]);

        Ok(())
    }

    fn region_write(
        &mut self,
        region: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<(), std::io::Error> {
        trace!(
            "write region {region} offset {offset:#x}+{} val {:?}",
            data.len(),
            data
        );

        let Ok(size) = RequestSize::try_from(data.len() as u64) else {
            warn!("dropping write with unsupported width {}", data.len());
            return Ok(());
        };
        let value = Self::value_from_bytes(data);

        match region {
            VFIO_PCI_CONFIG_REGION_INDEX => {
                self.device.write_cfg(Request::new(offset, size), value);
            }
            0 => self.device.write_io(0, Request::new(offset, size), value),
            other => debug!("ignoring write to unmapped region {other}"),
        }

        Ok(())
    }

    fn dma_map(
        &mut self,
        flags: vfio_user::DmaMapFlags,
        offset: u64,
        address: u64,
        size: u64,
        fd: Option<File>,
    ) -> Result<(), std::io::Error> {
        info!("dma_map flags = {flags:?} offset = {offset} address = {address} size = {size} fd = {fd:?}");

        if let Some(fd) = fd {
            let mseg = MemorySegment::new_from_fd(
                &fd,
                offset,
                size,
                // We want to know when this happens, so bail out eagerly
                // here.
                flags.try_into().expect("Failed to convert flags"),
            )?;

            self.dma_bus.add(address, Arc::new(mseg)).map_err(|error| {
                std::io::Error::other(format!("cannot map DMA region: {error}"))
            })?;
        } else {
            warn!("ignoring DMA region without file descriptor");
        }

        Ok(())
    }

    fn dma_unmap(
        &mut self,
        _flags: vfio_user::DmaUnmapFlags,
        address: u64,
        size: u64,
    ) -> Result<(), std::io::Error> {
        // The segment table only grows; an unmapped region keeps its
        // slot but the client will not issue DMA to it anymore.
        warn!("leaving DMA region {address:#x}+{size:#x} mapped");
        Ok(())
    }

    fn reset(&mut self) -> Result<(), std::io::Error> {
        debug!("client requested device reset");
        self.device.reset();
        Ok(())
    }

    fn set_irqs(
        &mut self,
        index: u32,
        flags: u32,
        start: u32,
        count: u32,
        fds: Vec<File>,
    ) -> Result<(), std::io::Error> {
        debug!(
            "set IRQs: {index} flags: {flags:#x} start: {start:#x} count: {count:#x} #fds: {}",
            fds.len()
        );
        assert_eq!(
            index, VFIO_PCI_MSI_IRQ_INDEX,
            "Only MSI interrupts are supported"
        );
        assert!(count <= 1, "Only a single interrupt is supported");

        let irq: Arc<dyn InterruptLine> = match fds.into_iter().next() {
            Some(file) => Arc::new(InterruptEventFd {
                fd: Mutex::new(file),
            }),
            None => Arc::new(DummyInterruptLine::default()),
        };

        self.device.connect_irq(irq);

        Ok(())
    }
}
