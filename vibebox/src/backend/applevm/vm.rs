//! One virtual machine lifecycle over the Virtualization framework.
//!
//! `VZVirtualMachine` is affine to the dispatch queue it was created with,
//! and none of the framework objects are `Send`. The whole object graph is
//! therefore confined to a dedicated OS thread that owns the machine and
//! services a typed command channel; framework calls are marshalled onto
//! the machine's serial queue from there.

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use block2::RcBlock;
use dispatch2::DispatchQueue;
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::AnyThread;
use objc2_foundation::{
    NSArray, NSError, NSFileHandle, NSMutableDictionary, NSOperatingSystemVersion, NSProcessInfo,
    NSString, NSURL,
};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEFIBootLoader, VZEFIVariableStore,
    VZEFIVariableStoreInitializationOptions, VZFileHandleSerialPortAttachment, VZMACAddress,
    VZMultipleDirectoryShare, VZNATNetworkDeviceAttachment, VZSharedDirectory,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioFileSystemDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
    VZVirtualMachineState,
};

use super::console::Console;
use super::framing;
use super::shell::{self, shell_quote, SHARE_TAG};
use super::{
    build_shares, workspace_guest_from_spec, HostShare, ShareBinding, BOOT_TIMEOUT,
    DEFAULT_EXEC_TIMEOUT, LOGIN_TIMEOUT, PROMPT_TIMEOUT, SHELL_PROMPT_HINTS, STOP_TIMEOUT,
};
use crate::backend::{ExecRequest, ExecResult, IoStreams, RuntimeSpec};
use crate::errors::{VibeboxError, VibeboxResult, VmError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Quick capability check used by the probe: the framework must be able to
/// construct an EFI boot loader at all.
pub(crate) fn probe_framework() -> Result<(), String> {
    let required = NSOperatingSystemVersion {
        majorVersion: 13,
        minorVersion: 0,
        patchVersion: 0,
    };
    let supported =
        unsafe { NSProcessInfo::processInfo().isOperatingSystemAtLeastVersion(required) };
    if !supported {
        return Err("apple-vm requires macOS 13+ for EFI boot support".into());
    }

    objc2::exception::catch(|| {
        let _ = unsafe { VZEFIBootLoader::new() };
    })
    .map_err(|e| format!("failed to initialize virtualization framework: {:?}", e))
}

/// Coarse machine state reported across the thread boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MachineState {
    Stopped,
    Running,
    Starting,
    Stopping,
    Error,
    Other,
}

impl MachineState {
    fn name(&self) -> &'static str {
        match self {
            MachineState::Stopped => "stopped",
            MachineState::Running => "running",
            MachineState::Starting => "starting",
            MachineState::Stopping => "stopping",
            MachineState::Error => "error",
            MachineState::Other => "other",
        }
    }
}

enum VmCommand {
    Start(mpsc::Sender<Result<(), String>>),
    State(mpsc::Sender<MachineState>),
    RequestStop(mpsc::Sender<Result<(), String>>),
    ForceStop(mpsc::Sender<Result<(), String>>),
}

/// Plain-data machine description shipped to the owning thread.
struct VmSetup {
    instance_raw: PathBuf,
    varstore_path: PathBuf,
    cpus: u32,
    ram_mb: u64,
    shares: Vec<HostShare>,
    /// Read end of the host→guest pipe; the framework reads guest input
    /// from it.
    serial_in: OwnedFd,
    /// Write end of the guest→host pipe; the framework writes guest
    /// output to it.
    serial_out: OwnedFd,
}

/// Host-side handle for one VM lifecycle.
pub(crate) struct VmRuntime {
    cmd_tx: mpsc::Sender<VmCommand>,
    console: Console,
    input: Mutex<std::fs::File>,
    bindings: Vec<ShareBinding>,
}

impl VmRuntime {
    pub(crate) fn new(
        spec: &RuntimeSpec,
        tee: Option<Box<dyn Write + Send>>,
    ) -> VibeboxResult<Self> {
        let (shares, bindings) = build_shares(spec)?;

        let (in_read, in_write) =
            nix::unistd::pipe().map_err(|e| VmError::ConfigBuild(format!("serial pipe: {e}")))?;
        let (out_read, out_write) =
            nix::unistd::pipe().map_err(|e| VmError::ConfigBuild(format!("serial pipe: {e}")))?;

        let varstore_path = spec
            .instance_raw_path
            .parent()
            .map(|dir| dir.join("efi.varstore"))
            .ok_or_else(|| VmError::ConfigBuild("instance disk has no parent directory".into()))?;
        if let Some(parent) = varstore_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let setup = VmSetup {
            instance_raw: spec.instance_raw_path.clone(),
            varstore_path,
            cpus: spec.config.vm.cpus,
            ram_mb: spec.config.vm.ram_mb,
            shares,
            serial_in: in_read,
            serial_out: out_write,
        };

        let (ready_tx, ready_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("vibebox-vm".into())
            .spawn(move || vm_thread(setup, ready_tx, cmd_rx))
            .map_err(|e| VmError::ConfigBuild(format!("spawn vm thread: {e}")))?;
        ready_rx
            .recv()
            .map_err(|_| VmError::ConfigBuild("vm thread exited before ready".into()))?
            .map_err(VmError::ConfigBuild)?;

        let console = Console::spawn(std::fs::File::from(out_read), tee);
        Ok(Self {
            cmd_tx,
            console,
            input: Mutex::new(std::fs::File::from(in_write)),
            bindings,
        })
    }

    fn command<T>(&self, build: impl FnOnce(mpsc::Sender<T>) -> VmCommand) -> VibeboxResult<T> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| VibeboxError::Internal("vm thread is gone".into()))?;
        rx.recv()
            .map_err(|_| VibeboxError::Internal("vm thread dropped reply".into()))
    }

    pub(crate) fn state(&self) -> VibeboxResult<MachineState> {
        self.command(VmCommand::State)
    }

    /// Start the machine and wait for the running state.
    pub(crate) fn start(&self) -> VibeboxResult<()> {
        self.command(VmCommand::Start)?
            .map_err(|e| VmError::Boot(e).into())
            .and_then(|()| self.wait_for_state(MachineState::Running, BOOT_TIMEOUT))
    }

    /// Poll the machine state at 100 ms granularity. A zero timeout waits
    /// forever; the error state is terminal.
    pub(crate) fn wait_for_state(
        &self,
        want: MachineState,
        timeout: Duration,
    ) -> VibeboxResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.state()?;
            if current == want {
                return Ok(());
            }
            if current == MachineState::Error {
                return Err(VmError::Boot("VM entered error state".into()).into());
            }
            if !timeout.is_zero() && Instant::now() >= deadline {
                return Err(VmError::StateTimeout {
                    want: want.name().into(),
                    current: current.name().into(),
                }
                .into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drive the guest from first console output to a usable shell with
    /// the shares mounted: optional `root` login, then the virtiofs mount
    /// compound command.
    pub(crate) fn bootstrap(&self) -> VibeboxResult<()> {
        let mut needles: Vec<&str> = vec!["login: "];
        needles.extend_from_slice(SHELL_PROMPT_HINTS);
        let matched = self.console.wait_for_any(&needles, LOGIN_TIMEOUT)?;

        if matched == "login: " {
            self.send_line("root")?;
            self.console.wait_for_any(SHELL_PROMPT_HINTS, PROMPT_TIMEOUT)?;
        }

        let mount_cmd = shell::build_guest_mount_command(&self.bindings);
        self.send_line(&mount_cmd)?;
        self.console.wait_for_any(SHELL_PROMPT_HINTS, PROMPT_TIMEOUT)?;
        Ok(())
    }

    pub(crate) fn send_line(&self, line: &str) -> VibeboxResult<()> {
        let mut input = self
            .input
            .lock()
            .map_err(|_| VibeboxError::Internal("serial input lock poisoned".into()))?;
        input.write_all(line.as_bytes())?;
        input.write_all(b"\n")?;
        input.flush()?;
        Ok(())
    }

    pub(crate) fn input_clone(&self) -> VibeboxResult<std::fs::File> {
        let input = self
            .input
            .lock()
            .map_err(|_| VibeboxError::Internal("serial input lock poisoned".into()))?;
        Ok(input.try_clone()?)
    }

    pub(crate) fn wait_for_output(&self, needle: &str, timeout: Duration) -> VibeboxResult<()> {
        self.console.wait_for_contains(needle, timeout)
    }

    pub(crate) fn wait_for_prompt(&self, timeout: Duration) -> VibeboxResult<()> {
        self.console.wait_for_any(SHELL_PROMPT_HINTS, timeout)?;
        Ok(())
    }

    pub(crate) fn output(&self) -> Vec<u8> {
        self.console.output()
    }

    /// Graceful stop, then hard stop, tolerating failures beyond that.
    pub(crate) fn try_stop(&self) {
        if matches!(self.state(), Ok(MachineState::Stopped)) {
            return;
        }
        if let Ok(result) = self.command(VmCommand::RequestStop) {
            if let Err(e) = result {
                tracing::debug!(error = %e, "graceful stop request failed");
            }
        }
        if self.wait_for_state(MachineState::Stopped, STOP_TIMEOUT).is_ok() {
            return;
        }
        if let Ok(Err(e)) = self.command(VmCommand::ForceStop) {
            tracing::warn!(error = %e, "hard stop failed");
            return;
        }
        let _ = self.wait_for_state(MachineState::Stopped, STOP_TIMEOUT);
    }
}

/// Non-interactive exec: boot, bootstrap, send one framed command, wait
/// for the exit marker, collect the buffer after shutdown.
pub(crate) fn run_exec(
    spec: &RuntimeSpec,
    guest_cwd: &str,
    req: ExecRequest,
) -> VibeboxResult<ExecResult> {
    let _disk_lock = super::lock::InstanceLock::acquire(&spec.instance_raw_path)?;
    let vm = VmRuntime::new(spec, None)?;
    vm.start()?;
    if let Err(e) = vm.bootstrap() {
        vm.try_stop();
        return Err(e);
    }

    let script = framing::build_exec_script(guest_cwd, &req.command, &req.env);
    if let Err(e) = vm.send_line(&script) {
        vm.try_stop();
        return Err(e);
    }

    let wait = if req.timeout.is_zero() {
        DEFAULT_EXEC_TIMEOUT
    } else {
        req.timeout
    };
    if let Err(e) = vm.wait_for_output(framing::EXIT_CODE_MARKER, wait) {
        vm.try_stop();
        return Err(e);
    }

    // The framed command powers the guest off after the marker.
    if vm
        .wait_for_state(MachineState::Stopped, STOP_TIMEOUT)
        .is_err()
    {
        vm.try_stop();
    }

    let output = vm.output();
    if let Some((stdout, stderr, exit_code)) = framing::parse_structured_output(&output) {
        return Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
        });
    }

    let text = String::from_utf8_lossy(&output);
    if let Some(exit_code) = framing::parse_exit_marker(&output) {
        return Ok(ExecResult {
            stdout: framing::strip_exit_marker_lines(&text),
            stderr: String::new(),
            exit_code,
        });
    }

    Err(VmError::MarkerMissing(framing::output_tail(&text, 512)).into())
}

/// Interactive session: bootstrap, cd into the workspace, then pipe host
/// stdin to the serial input while the tee writer mirrors guest output.
/// Host stdin EOF sends `exit`; the loop ends when the machine stops.
pub(crate) fn run_interactive(spec: &RuntimeSpec, io: IoStreams) -> VibeboxResult<()> {
    let IoStreams { stdin, stdout, .. } = io;
    let tee: Box<dyn Write + Send> = stdout.unwrap_or_else(|| Box::new(std::io::stdout()));
    let mut reader: Box<dyn std::io::Read + Send> =
        stdin.unwrap_or_else(|| Box::new(std::io::stdin()));

    let _disk_lock = super::lock::InstanceLock::acquire(&spec.instance_raw_path)?;
    let vm = VmRuntime::new(spec, Some(tee))?;
    vm.start()?;
    if let Err(e) = vm.bootstrap() {
        vm.try_stop();
        return Err(e);
    }

    let workspace_guest = workspace_guest_from_spec(spec);
    if let Err(e) = vm.send_line(&format!("cd {}", shell_quote(&workspace_guest))) {
        vm.try_stop();
        return Err(e);
    }
    if let Err(e) = vm.wait_for_prompt(PROMPT_TIMEOUT) {
        vm.try_stop();
        return Err(e);
    }

    let mut serial_in = vm.input_clone()?;
    let (eof_tx, eof_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = std::io::copy(&mut reader, &mut serial_in);
        let _ = eof_tx.send(());
    });

    let mut exit_sent = false;
    loop {
        if vm.state()? == MachineState::Stopped {
            return Ok(());
        }
        if !exit_sent && eof_rx.try_recv().is_ok() {
            // Host stdin ended; terminate the guest shell session.
            let _ = vm.send_line("exit");
            exit_sent = true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

// ============================================================================
// MACHINE THREAD
// ============================================================================

/// Pointer smuggled into queue closures. Safe because the pointee is only
/// dereferenced on the machine's own dispatch queue.
struct VmPtr(*const VZVirtualMachine);
unsafe impl Send for VmPtr {}

fn vm_thread(
    setup: VmSetup,
    ready_tx: mpsc::Sender<Result<(), String>>,
    cmd_rx: mpsc::Receiver<VmCommand>,
) {
    let (vm, queue) = match build_machine(setup) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while let Ok(cmd) = cmd_rx.recv() {
        let ptr = VmPtr(Retained::as_ptr(&vm));
        match cmd {
            VmCommand::State(reply) => {
                let state = queue.exec_sync(move || {
                    let vm = unsafe { &*ptr.0 };
                    map_state(unsafe { vm.state() })
                });
                let _ = reply.send(state);
            }
            VmCommand::Start(reply) => {
                let (done_tx, done_rx) = mpsc::channel::<Result<(), String>>();
                queue.exec_sync(move || {
                    let vm = unsafe { &*ptr.0 };
                    if !unsafe { vm.canStart() } {
                        let _ = done_tx.send(Err(format!(
                            "virtual machine cannot start in current state: {}",
                            map_state(unsafe { vm.state() }).name()
                        )));
                        return;
                    }
                    let completion = RcBlock::new(move |error: *mut NSError| {
                        let result = if error.is_null() {
                            Ok(())
                        } else {
                            Err(unsafe { &*error }.localizedDescription().to_string())
                        };
                        let _ = done_tx.send(result);
                    });
                    unsafe { vm.startWithCompletionHandler(&completion) };
                });
                let result = done_rx
                    .recv()
                    .unwrap_or_else(|_| Err("start completion never fired".into()));
                let _ = reply.send(result);
            }
            VmCommand::RequestStop(reply) => {
                let result = queue.exec_sync(move || {
                    let vm = unsafe { &*ptr.0 };
                    if !unsafe { vm.canRequestStop() } {
                        return Ok(());
                    }
                    unsafe { vm.requestStopWithError() }
                        .map_err(|e| e.localizedDescription().to_string())
                });
                let _ = reply.send(result);
            }
            VmCommand::ForceStop(reply) => {
                let (done_tx, done_rx) = mpsc::channel::<Result<(), String>>();
                queue.exec_sync(move || {
                    let vm = unsafe { &*ptr.0 };
                    if !unsafe { vm.canStop() } {
                        let _ = done_tx.send(Ok(()));
                        return;
                    }
                    let completion = RcBlock::new(move |error: *mut NSError| {
                        let result = if error.is_null() {
                            Ok(())
                        } else {
                            Err(unsafe { &*error }.localizedDescription().to_string())
                        };
                        let _ = done_tx.send(result);
                    });
                    unsafe { vm.stopWithCompletionHandler(&completion) };
                });
                let result = done_rx
                    .recv()
                    .unwrap_or_else(|_| Err("stop completion never fired".into()));
                let _ = reply.send(result);
            }
        }
    }
    // Channel closed: the handle is gone. Dropping the machine here closes
    // the serial handles, which ends the host console pump.
}

fn map_state(state: VZVirtualMachineState) -> MachineState {
    match state {
        VZVirtualMachineState::Stopped => MachineState::Stopped,
        VZVirtualMachineState::Running => MachineState::Running,
        VZVirtualMachineState::Starting => MachineState::Starting,
        VZVirtualMachineState::Stopping => MachineState::Stopping,
        VZVirtualMachineState::Error => MachineState::Error,
        _ => MachineState::Other,
    }
}

fn file_url(path: &Path) -> Retained<NSURL> {
    unsafe { NSURL::fileURLWithPath(&NSString::from_str(&path.to_string_lossy())) }
}

fn new_or_load_varstore(path: &Path) -> Result<Retained<VZEFIVariableStore>, String> {
    let url = file_url(path);
    if path.exists() {
        return Ok(unsafe { VZEFIVariableStore::initWithURL(VZEFIVariableStore::alloc(), &url) });
    }
    unsafe {
        VZEFIVariableStore::initCreatingVariableStoreAtURL_options_error(
            VZEFIVariableStore::alloc(),
            &url,
            VZEFIVariableStoreInitializationOptions(0),
        )
    }
    .map_err(|e| format!("init EFI variable store: {}", e.localizedDescription()))
}

/// Assemble the full device graph and create the machine on its own serial
/// queue. Must run on the thread that will own the machine.
#[allow(non_snake_case)]
fn build_machine(
    setup: VmSetup,
) -> Result<
    (
        Retained<VZVirtualMachine>,
        dispatch2::DispatchRetained<DispatchQueue>,
    ),
    String,
> {
    // EFI boot loader backed by the per-project variable store.
    let varstore = new_or_load_varstore(&setup.varstore_path)?;
    let boot_loader = unsafe { VZEFIBootLoader::new() };
    unsafe { boot_loader.setVariableStore(Some(&varstore)) };

    let config = unsafe { VZVirtualMachineConfiguration::new() };
    unsafe {
        config.setBootLoader(Some(&boot_loader));
        config.setCPUCount(setup.cpus as usize);
        config.setMemorySize(setup.ram_mb * 1024 * 1024);
    }

    // NAT network with a random locally-administered MAC.
    let nat = unsafe { VZNATNetworkDeviceAttachment::new() };
    let net = unsafe { VZVirtioNetworkDeviceConfiguration::new() };
    unsafe {
        net.setAttachment(Some(&nat));
        net.setMACAddress(&VZMACAddress::randomLocallyAdministeredAddress());
        config.setNetworkDevices(&NSArray::from_retained_slice(&[Retained::into_super(net)]));
    }

    // Entropy.
    let entropy = unsafe { VZVirtioEntropyDeviceConfiguration::new() };
    unsafe {
        config.setEntropyDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            entropy,
        )]));
    }

    // Instance disk as a read-write virtio block device.
    let disk_url = file_url(&setup.instance_raw);
    let disk_attachment = unsafe {
        VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &disk_url,
            false,
        )
    }
    .map_err(|e| format!("attach instance disk: {}", e.localizedDescription()))?;
    let block = unsafe {
        VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &disk_attachment,
        )
    };
    unsafe {
        config.setStorageDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            Retained::into_super(block),
        )]));
    }

    // Virtiofs share map under a single device tag.
    let directories = NSMutableDictionary::<NSString, VZSharedDirectory>::new();
    for share in &setup.shares {
        let key = NSString::from_str(&share.name);
        let shared = unsafe {
            VZSharedDirectory::initWithURL_readOnly(
                VZSharedDirectory::alloc(),
                &file_url(&share.host_path),
                share.read_only,
            )
        };
        unsafe { directories.setObject_forKey(&shared, ProtocolObject::from_ref(&*key)) };
    }
    let multi_share = unsafe {
        VZMultipleDirectoryShare::initWithDirectories(VZMultipleDirectoryShare::alloc(), &directories)
    };
    let fs_device = unsafe {
        VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(SHARE_TAG),
        )
    };
    unsafe {
        fs_device.setShare(Some(&multi_share));
        config.setDirectorySharingDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            fs_device,
        )]));
    }

    // Serial console over the host pipes.
    let read_handle = unsafe {
        NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            setup.serial_in.into_raw_fd(),
            true,
        )
    };
    let write_handle = unsafe {
        NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            setup.serial_out.into_raw_fd(),
            true,
        )
    };
    let serial_attachment = unsafe {
        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
            VZFileHandleSerialPortAttachment::alloc(),
            Some(&read_handle),
            Some(&write_handle),
        )
    };
    let console_port = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
    unsafe {
        console_port.setAttachment(Some(&serial_attachment));
        config.setSerialPorts(&NSArray::from_retained_slice(&[Retained::into_super(
            console_port,
        )]));
    }

    unsafe { config.validateWithError() }
        .map_err(|e| format!("validate VM configuration: {}", e.localizedDescription()))?;

    let queue = DispatchQueue::new("com.vibebox.vm", None);
    let machine = unsafe {
        VZVirtualMachine::initWithConfiguration_queue(VZVirtualMachine::alloc(), &config, &queue)
    };
    tracing::debug!(disk = %setup.instance_raw.display(), "virtual machine configured");
    Ok((machine, queue))
}
