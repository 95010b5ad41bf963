//! Virtualization.framework backend.
//!
//! The framework requires every `VZVirtualMachine` call to happen on the
//! dispatch queue the machine was created with. The backend owns a serial
//! queue for that purpose and hops onto it synchronously for each
//! operation. Asynchronous completion handlers fire on the same queue and
//! report back through a channel, so the calling worker blocks without
//! holding the queue.

use crate::error::{Error, Result};
use crate::vm::{
    console, emit, ConsoleInput, DirectoryShare, EventSink, Hypervisor, MachineSpec, ResourceLimits,
    RosettaAvailability, ShareSource, VmEvent,
};
use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchRetained};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::{define_class, msg_send, AllocAnyThread, DefinedClass};
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSObject, NSObjectProtocol, NSString, NSURL};
use objc2_virtualization::{
    VZDirectorySharingDeviceConfiguration, VZDiskImageStorageDeviceAttachment,
    VZEntropyDeviceConfiguration, VZFileHandleSerialPortAttachment, VZLinuxBootLoader,
    VZLinuxRosettaAvailability, VZLinuxRosettaDirectoryShare, VZMACAddress,
    VZNATNetworkDeviceAttachment, VZNetworkDeviceConfiguration, VZSerialPortConfiguration,
    VZSharedDirectory, VZSingleDirectoryShare, VZStorageDeviceConfiguration,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioFileSystemDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
    VZVirtualMachineDelegate,
};
use std::os::fd::IntoRawFd;
use std::path::Path;
use std::sync::mpsc;

const QUEUE_LABEL: &str = "com.darwin-vz-nix.vm";

/// Holds a framework object that is only touched on the VM queue.
struct QueueBound<T>(T);

// SAFETY: the machine and its delegate are only dereferenced through
// `QueueBound::get`, whose callers run on the VM's serial dispatch queue.
unsafe impl Send for QueueBound<Retained<VZVirtualMachine>> {}
unsafe impl Sync for QueueBound<Retained<VZVirtualMachine>> {}
unsafe impl Send for QueueBound<Retained<VmDelegate>> {}
unsafe impl Sync for QueueBound<Retained<VmDelegate>> {}

impl<T> QueueBound<T> {
    /// # Safety
    ///
    /// Must only be called on the VM's dispatch queue.
    unsafe fn get(&self) -> &T {
        &self.0
    }
}

struct DelegateIvars {
    events: EventSink,
}

define_class!(
    #[unsafe(super = NSObject)]
    #[name = "DarwinVzNixDelegate"]
    #[ivars = DelegateIvars]
    struct VmDelegate;

    unsafe impl NSObjectProtocol for VmDelegate {}

    unsafe impl VZVirtualMachineDelegate for VmDelegate {
        #[unsafe(method(guestDidStopVirtualMachine:))]
        fn guest_did_stop_virtual_machine(&self, _: &VZVirtualMachine) {
            emit(&self.ivars().events, VmEvent::GuestStopped);
        }

        #[unsafe(method(virtualMachine:didStopWithError:))]
        fn virtual_machine_did_stop_with_error(&self, _: &VZVirtualMachine, err: &NSError) {
            emit(
                &self.ivars().events,
                VmEvent::StoppedWithError(err.localizedDescription().to_string()),
            );
        }
    }
);

impl VmDelegate {
    fn new(events: EventSink) -> Retained<Self> {
        let this = Self::alloc().set_ivars(DelegateIvars { events });
        unsafe { msg_send![super(this), init] }
    }
}

/// Hypervisor backed by Apple's Virtualization.framework.
pub struct VirtualizationBackend {
    queue: DispatchRetained<DispatchQueue>,
    machine: Option<QueueBound<Retained<VZVirtualMachine>>>,
    delegate: Option<QueueBound<Retained<VmDelegate>>>,
}

impl VirtualizationBackend {
    /// Create a backend if the host supports virtualization.
    pub fn new() -> Result<Self> {
        if !unsafe { VZVirtualMachine::isSupported() } {
            return Err(Error::HypervisorUnavailable(
                "virtualization is not supported on this Mac".into(),
            ));
        }

        Ok(Self {
            queue: DispatchQueue::new(QUEUE_LABEL, None),
            machine: None,
            delegate: None,
        })
    }

    fn machine(&self) -> Result<&QueueBound<Retained<VZVirtualMachine>>> {
        self.machine
            .as_ref()
            .ok_or_else(|| Error::invalid_state("created", "no machine"))
    }
}

impl Hypervisor for VirtualizationBackend {
    fn limits(&self) -> ResourceLimits {
        unsafe {
            ResourceLimits {
                min_cpus: VZVirtualMachineConfiguration::minimumAllowedCPUCount() as u32,
                max_cpus: VZVirtualMachineConfiguration::maximumAllowedCPUCount() as u32,
                min_memory_bytes: VZVirtualMachineConfiguration::minimumAllowedMemorySize(),
                max_memory_bytes: VZVirtualMachineConfiguration::maximumAllowedMemorySize(),
            }
        }
    }

    fn rosetta_availability(&self) -> RosettaAvailability {
        let availability = unsafe { VZLinuxRosettaDirectoryShare::availability() };
        if availability == VZLinuxRosettaAvailability::Installed {
            RosettaAvailability::Installed
        } else if availability == VZLinuxRosettaAvailability::NotInstalled {
            RosettaAvailability::NotInstalled
        } else {
            RosettaAvailability::NotSupported
        }
    }

    fn create(&mut self, spec: &MachineSpec, events: EventSink) -> Result<()> {
        if self.machine.is_some() {
            return Err(Error::invalid_state("no machine", "machine exists"));
        }

        let configuration = machine_configuration(spec)?;
        unsafe { configuration.validateWithError() }.map_err(|e| {
            Error::hypervisor(format!(
                "invalid VM configuration: {}",
                e.localizedDescription()
            ))
        })?;

        let machine = unsafe {
            VZVirtualMachine::initWithConfiguration_queue(
                VZVirtualMachine::alloc(),
                &configuration,
                &self.queue,
            )
        };
        let machine = QueueBound(machine);
        let delegate = QueueBound(VmDelegate::new(events));

        self.queue.exec_sync(|| {
            let (vm, delegate) = unsafe { (machine.get(), delegate.get()) };
            let proto = ProtocolObject::<dyn VZVirtualMachineDelegate>::from_ref(&**delegate);
            unsafe { vm.setDelegate(Some(proto)) };
        });

        self.machine = Some(machine);
        self.delegate = Some(delegate);
        tracing::debug!("virtual machine created");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let machine = self.machine()?;
        let (tx, rx) = mpsc::channel::<std::result::Result<(), String>>();

        self.queue.exec_sync(|| {
            let tx = tx.clone();
            let handler = RcBlock::new(move |err: *mut NSError| {
                let result = if err.is_null() {
                    Ok(())
                } else {
                    Err(unsafe { (*err).localizedDescription() }.to_string())
                };
                let _ = tx.send(result);
            });
            unsafe { machine.get().startWithCompletionHandler(&handler) };
        });

        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(Error::hypervisor(format!("failed to start VM: {}", reason))),
            Err(_) => Err(Error::hypervisor("start completion handler dropped")),
        }
    }

    fn request_stop(&mut self) -> Result<()> {
        let machine = self.machine()?;
        let mut outcome: std::result::Result<(), String> = Ok(());

        self.queue.exec_sync(|| {
            let vm = unsafe { machine.get() };
            outcome = unsafe {
                if !vm.canRequestStop() {
                    Err("the VM cannot accept a stop request in its current state".to_string())
                } else {
                    vm.requestStopWithError()
                        .map_err(|e| e.localizedDescription().to_string())
                }
            };
        });

        outcome.map_err(|reason| Error::hypervisor(format!("failed to stop VM: {}", reason)))
    }

    fn release(&mut self) {
        let machine = self.machine.take();
        let delegate = self.delegate.take();
        if machine.is_none() {
            return;
        }
        // Final release must also happen on the VM queue.
        self.queue.exec_sync(move || {
            drop(machine);
            drop(delegate);
        });
        tracing::debug!("virtual machine released");
    }
}

fn machine_configuration(spec: &MachineSpec) -> Result<Retained<VZVirtualMachineConfiguration>> {
    unsafe {
        let config = VZVirtualMachineConfiguration::new();

        config.setBootLoader(Some(&boot_loader(spec)));
        config.setCPUCount(spec.cpus as usize);
        config.setMemorySize(spec.memory_bytes);

        config.setStorageDevices(&NSArray::from_retained_slice(&[storage_device(
            &spec.disk_image,
        )?]));
        config.setNetworkDevices(&NSArray::from_retained_slice(&[network_device(
            &spec.mac_address,
        )?]));
        if spec.entropy {
            let entropy: Retained<VZEntropyDeviceConfiguration> =
                Retained::into_super(VZVirtioEntropyDeviceConfiguration::new());
            config.setEntropyDevices(&NSArray::from_retained_slice(&[entropy]));
        }
        config.setSerialPorts(&NSArray::from_retained_slice(&[console_port(spec)?]));

        let shares = spec
            .shares
            .iter()
            .map(share_device)
            .collect::<Result<Vec<_>>>()?;
        config.setDirectorySharingDevices(&NSArray::from_retained_slice(&shares));

        Ok(config)
    }
}

fn boot_loader(spec: &MachineSpec) -> Retained<VZLinuxBootLoader> {
    unsafe {
        let loader =
            VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &file_url(&spec.boot.kernel));
        loader.setInitialRamdiskURL(Some(&file_url(&spec.boot.initrd)));
        loader.setCommandLine(&NSString::from_str(&spec.boot.command_line));
        loader
    }
}

fn storage_device(disk: &Path) -> Result<Retained<VZStorageDeviceConfiguration>> {
    unsafe {
        let attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &file_url(disk),
            false,
        )
        .map_err(|e| {
            Error::hypervisor(format!(
                "failed to attach disk image {}: {}",
                disk.display(),
                e.localizedDescription()
            ))
        })?;
        let block = VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &attachment,
        );
        Ok(Retained::into_super(block))
    }
}

fn network_device(mac: &str) -> Result<Retained<VZNetworkDeviceConfiguration>> {
    unsafe {
        let device = VZVirtioNetworkDeviceConfiguration::new();
        device.setAttachment(Some(&VZNATNetworkDeviceAttachment::new()));
        let address = VZMACAddress::initWithString(VZMACAddress::alloc(), &NSString::from_str(mac))
            .ok_or_else(|| Error::hypervisor(format!("invalid MAC address: {}", mac)))?;
        device.setMACAddress(&address);
        Ok(Retained::into_super(device))
    }
}

fn console_port(spec: &MachineSpec) -> Result<Retained<VZSerialPortConfiguration>> {
    std::fs::File::create(&spec.console.log)?;

    unsafe {
        let writer = if spec.console.mirror_to_stderr {
            let (read_end, write_end) = console::console_pipe()?;
            console::spawn_mirror(read_end, &spec.console.log)?;
            NSFileHandle::initWithFileDescriptor_closeOnDealloc(
                NSFileHandle::alloc(),
                write_end.into_raw_fd(),
                true,
            )
        } else {
            let log = path_string(&spec.console.log);
            NSFileHandle::fileHandleForWritingAtPath(&log).ok_or_else(|| {
                Error::hypervisor(format!(
                    "failed to open console log {}",
                    spec.console.log.display()
                ))
            })?
        };
        let reader = match spec.console.input {
            ConsoleInput::Terminal => NSFileHandle::fileHandleWithStandardInput(),
            ConsoleInput::Null => NSFileHandle::fileHandleWithNullDevice(),
        };

        let attachment = VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
            VZFileHandleSerialPortAttachment::alloc(),
            Some(&reader),
            Some(&writer),
        );
        let port = VZVirtioConsoleDeviceSerialPortConfiguration::new();
        port.setAttachment(Some(&Retained::into_super(attachment)));
        Ok(Retained::into_super(port))
    }
}

fn share_device(share: &DirectoryShare) -> Result<Retained<VZDirectorySharingDeviceConfiguration>> {
    unsafe {
        let device = VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(&share.tag),
        );

        match &share.source {
            ShareSource::Host { path, read_only } => {
                if !path.is_dir() {
                    return Err(Error::SharedDirectory(format!(
                        "{} is not a directory",
                        path.display()
                    )));
                }
                let directory = VZSharedDirectory::initWithURL_readOnly(
                    VZSharedDirectory::alloc(),
                    &file_url(path),
                    *read_only,
                );
                let single = VZSingleDirectoryShare::initWithDirectory(
                    VZSingleDirectoryShare::alloc(),
                    &directory,
                );
                device.setShare(Some(&Retained::into_super(single)));
            }
            ShareSource::Rosetta => {
                let rosetta = VZLinuxRosettaDirectoryShare::initWithError(
                    VZLinuxRosettaDirectoryShare::alloc(),
                )
                .map_err(|e| Error::RosettaUnavailable(e.localizedDescription().to_string()))?;
                device.setShare(Some(&Retained::into_super(rosetta)));
            }
        }

        Ok(Retained::into_super(device))
    }
}

fn path_string(path: &Path) -> Retained<NSString> {
    NSString::from_str(&path.to_string_lossy())
}

fn file_url(path: &Path) -> Retained<NSURL> {
    NSURL::initFileURLWithPath(NSURL::alloc(), &path_string(path))
}
