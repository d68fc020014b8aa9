//! ConPTY implementation for Windows
//!
//! The pseudo-console is fed through two anonymous pipes: we write the
//! child's input into one and read its rendered output from the other.
//! ConPTY keeps the output pipe open after the child exits, so the session
//! ends when the pseudo-console is closed by [`PtyBackend::release`].

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use windows::core::{s, w, HRESULT, PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows::Win32::System::Console::{
    AttachConsole, ClosePseudoConsole, CreatePseudoConsole, FreeConsole, GetConsoleProcessList,
    ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, OpenProcess, QueryFullProcessImageNameW,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject,
    CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, STARTUPINFOEXW,
};

use super::{LaunchSpec, PtyBackend, ReadOutcome};
use crate::console_list::ConsoleListAgent;
use crate::error::{PtyError, PtyResult};
use crate::events::ExitResult;
use crate::resolve::args_to_command_line;
use crate::size::WindowSize;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;
const PSEUDOCONSOLE_INHERIT_CURSOR: u32 = 0x1;

/// Granularity of the output poll
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

type ClearPseudoConsoleFn = unsafe extern "system" fn(HPCON) -> HRESULT;

/// A kernel handle closed on drop
struct OwnedHandle(HANDLE);

// Safety: kernel handles may be used from any thread
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// A pseudo-console host and our ends of its pipes
pub struct PseudoConsole {
    hpc: Mutex<Option<HPCON>>,
    /// We write, the console reads
    input: OwnedHandle,
    /// The console writes, we read
    output: OwnedHandle,
}

// Safety: HPCON is an opaque handle and access is serialized by the mutex
unsafe impl Send for PseudoConsole {}
unsafe impl Sync for PseudoConsole {}

impl PseudoConsole {
    /// Create a pseudo-console of the given size
    pub fn create(size: WindowSize, inherit_cursor: bool) -> PtyResult<Self> {
        size.validate()?;
        unsafe {
            let mut console_input_read = HANDLE::default();
            let mut input_write = HANDLE::default();
            let mut output_read = HANDLE::default();
            let mut console_output_write = HANDLE::default();

            CreatePipe(&mut console_input_read, &mut input_write, None, 0)
                .map_err(|e| PtyError::creation(format!("input pipe: {}", e)))?;
            let console_input_read = OwnedHandle(console_input_read);
            let input = OwnedHandle(input_write);

            CreatePipe(&mut output_read, &mut console_output_write, None, 0)
                .map_err(|e| PtyError::creation(format!("output pipe: {}", e)))?;
            let output = OwnedHandle(output_read);
            let console_output_write = OwnedHandle(console_output_write);

            let flags = if inherit_cursor {
                PSEUDOCONSOLE_INHERIT_CURSOR
            } else {
                0
            };
            let hpc = CreatePseudoConsole(
                coord(size),
                console_input_read.0,
                console_output_write.0,
                flags,
            )
            .map_err(|e| PtyError::creation(format!("CreatePseudoConsole: {}", e)))?;

            // The console holds its own references to its pipe ends
            drop(console_input_read);
            drop(console_output_write);

            Ok(Self {
                hpc: Mutex::new(Some(hpc)),
                input,
                output,
            })
        }
    }

    fn handle(&self) -> MutexGuard<'_, Option<HPCON>> {
        self.hpc.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        let guard = self.handle();
        let Some(hpc) = *guard else {
            return Ok(());
        };
        unsafe { ResizePseudoConsole(hpc, coord(size)) }.map_err(win_error)
    }

    /// Reset the console's screen buffer; a no-op where the OS lacks the call
    pub fn clear(&self) -> PtyResult<()> {
        let guard = self.handle();
        let Some(hpc) = *guard else {
            return Ok(());
        };
        let Some(clear) = clear_pseudo_console() else {
            tracing::debug!("ClearPseudoConsole is not available on this system");
            return Ok(());
        };
        let hr = unsafe { clear(hpc) };
        hr.ok().map_err(win_error)
    }

    /// Close the console; the attached processes lose their terminal
    pub fn close(&self) {
        if let Some(hpc) = self.handle().take() {
            unsafe { ClosePseudoConsole(hpc) };
        }
    }

    fn is_open(&self) -> bool {
        self.handle().is_some()
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        self.close();
    }
}

fn coord(size: WindowSize) -> COORD {
    COORD {
        X: size.cols as i16,
        Y: size.rows as i16,
    }
}

/// Look up `ClearPseudoConsole`, which older systems do not export
fn clear_pseudo_console() -> Option<ClearPseudoConsoleFn> {
    unsafe {
        let kernel32 = GetModuleHandleW(w!("kernel32.dll")).ok()?;
        let proc = GetProcAddress(kernel32, s!("ClearPseudoConsole"))?;
        Some(std::mem::transmute::<_, ClearPseudoConsoleFn>(proc))
    }
}

/// A child process attached to a pseudo-console
pub struct ConptyBackend {
    console: PseudoConsole,
    process: OwnedHandle,
    pid: u32,
    exited: AtomicBool,
}

impl ConptyBackend {
    pub fn spawn(spec: &LaunchSpec) -> PtyResult<Self> {
        let console = PseudoConsole::create(spec.size, spec.inherit_cursor)?;

        let program = spec.program.to_string_lossy();
        let command_line = args_to_command_line(&program, &spec.args);
        let mut command_line = wide(OsStr::new(&command_line));
        let application = wide(spec.program.as_os_str());
        let cwd = wide(spec.cwd.as_os_str());
        let env = environment_block(&spec.env);

        let process_info = {
            let guard = console.handle();
            let hpc = (*guard).ok_or_else(|| PtyError::creation("pseudo-console closed"))?;
            unsafe { create_process(hpc, &application, &mut command_line, &env, &cwd) }
                .map_err(|e| {
                    if e.code() == windows::Win32::Foundation::ERROR_FILE_NOT_FOUND.to_hresult() {
                        PtyError::not_found(spec.file.clone())
                    } else {
                        PtyError::creation(format!("CreateProcessW {}: {}", spec.file, e))
                    }
                })?
        };

        drop(OwnedHandle(process_info.hThread));
        tracing::debug!(pid = process_info.dwProcessId, "spawned {}", spec.file);

        Ok(Self {
            console,
            process: OwnedHandle(process_info.hProcess),
            pid: process_info.dwProcessId,
            exited: AtomicBool::new(false),
        })
    }

    pub fn console(&self) -> &PseudoConsole {
        &self.console
    }
}

unsafe fn create_process(
    hpc: HPCON,
    application: &[u16],
    command_line: &mut [u16],
    env: &[u16],
    cwd: &[u16],
) -> windows::core::Result<PROCESS_INFORMATION> {
    let mut attr_list_size: usize = 0;
    let _ = InitializeProcThreadAttributeList(
        LPPROC_THREAD_ATTRIBUTE_LIST::default(),
        1,
        0,
        &mut attr_list_size,
    );

    let mut attr_list_buffer = vec![0u8; attr_list_size];
    let attr_list = LPPROC_THREAD_ATTRIBUTE_LIST(attr_list_buffer.as_mut_ptr() as *mut _);
    InitializeProcThreadAttributeList(attr_list, 1, 0, &mut attr_list_size)?;

    let result = (|| -> windows::core::Result<PROCESS_INFORMATION> {
        UpdateProcThreadAttribute(
            attr_list,
            0,
            PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
            Some(hpc.0 as *const _),
            std::mem::size_of::<HPCON>(),
            None,
            None,
        )?;

        let mut startup_info = STARTUPINFOEXW {
            StartupInfo: std::mem::zeroed(),
            lpAttributeList: attr_list,
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut process_info = PROCESS_INFORMATION::default();
        CreateProcessW(
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            Some(env.as_ptr() as *const _),
            PCWSTR(cwd.as_ptr()),
            &startup_info.StartupInfo,
            &mut process_info,
        )?;
        Ok(process_info)
    })();

    DeleteProcThreadAttributeList(attr_list);
    result
}

impl PtyBackend for ConptyBackend {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> PtyResult<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut available: u32 = 0;
            let peeked = unsafe {
                PeekNamedPipe(self.console.output.0, None, 0, None, Some(&mut available), None)
            };
            if peeked.is_err() {
                // Broken pipe: the console has been closed
                return Ok(ReadOutcome::Closed);
            }
            if available > 0 {
                let to_read = (available as usize).min(buf.len());
                let mut read: u32 = 0;
                return match unsafe {
                    ReadFile(self.console.output.0, Some(&mut buf[..to_read]), Some(&mut read), None)
                } {
                    Ok(()) if read == 0 => Ok(ReadOutcome::Closed),
                    Ok(()) => Ok(ReadOutcome::Data(read as usize)),
                    Err(_) => Ok(ReadOutcome::Closed),
                };
            }
            if Instant::now() >= deadline {
                return Ok(ReadOutcome::Idle);
            }
            std::thread::sleep(PEEK_INTERVAL);
        }
    }

    fn write(&self, data: &[u8]) -> PtyResult<usize> {
        let mut written: u32 = 0;
        unsafe { WriteFile(self.console.input.0, Some(data), Some(&mut written), None) }
            .map_err(win_error)?;
        Ok(written as usize)
    }

    fn wait_writable(&self, _timeout: Duration) -> PtyResult<bool> {
        Ok(self.console.is_open())
    }

    fn resize(&self, size: WindowSize) -> PtyResult<()> {
        self.console.resize(size)
    }

    fn clear(&self) -> PtyResult<()> {
        self.console.clear()
    }

    fn kill(&self, signal: Option<&str>) -> PtyResult<()> {
        if signal.is_some() {
            return Err(PtyError::unsupported("kill with a signal"));
        }
        if self.exited.load(Ordering::Acquire) {
            self.console.close();
            return Ok(());
        }

        // Everything attached to the console, not just the direct child
        let attached = ConsoleListAgent::locate()
            .and_then(|agent| agent.query(self.pid))
            .map(|reply| reply.console_process_list)
            .unwrap_or_else(|e| {
                tracing::debug!(pid = self.pid, "console list unavailable: {}", e);
                Vec::new()
            });
        for pid in attached.into_iter().filter(|&p| p != self.pid) {
            terminate_pid(pid);
        }
        unsafe {
            let _ = TerminateProcess(self.process.0, 1);
        }
        self.console.close();
        Ok(())
    }

    fn wait(&self) -> PtyResult<ExitResult> {
        unsafe {
            let event = WaitForSingleObject(self.process.0, INFINITE);
            if event != WAIT_OBJECT_0 {
                return Err(PtyError::Io(std::io::Error::last_os_error()));
            }
            let mut code: u32 = 0;
            GetExitCodeProcess(self.process.0, &mut code)
                .map_err(win_error)?;
            self.exited.store(true, Ordering::Release);
            Ok(ExitResult::code(code as i32))
        }
    }

    fn foreground_process(&self) -> Option<String> {
        ConsoleListAgent::locate()
            .and_then(|agent| agent.foreground_process_name(self.pid))
            .map_err(|e| tracing::debug!(pid = self.pid, "foreground query failed: {}", e))
            .ok()
    }

    fn release(&self) {
        self.console.close();
    }
}

fn terminate_pid(pid: u32) {
    unsafe {
        if let Ok(handle) = OpenProcess(PROCESS_TERMINATE, false, pid) {
            let handle = OwnedHandle(handle);
            let _ = TerminateProcess(handle.0, 1);
        }
    }
}

/// Processes attached to the console that `pid` belongs to
///
/// Detaches the calling process from its own console; only call this from
/// the helper process.
pub fn console_process_list(pid: u32) -> PtyResult<Vec<u32>> {
    unsafe {
        let _ = FreeConsole();
        AttachConsole(pid)
            .map_err(|e| PtyError::ConsoleQuery(format!("AttachConsole({}) failed: {}", pid, e)))?;

        let mut list = vec![0u32; 64];
        let mut count = GetConsoleProcessList(&mut list) as usize;
        if count > list.len() {
            list.resize(count, 0);
            count = GetConsoleProcessList(&mut list) as usize;
        }
        let _ = FreeConsole();

        if count == 0 {
            return Err(PtyError::ConsoleQuery(format!(
                "GetConsoleProcessList failed for {}",
                pid
            )));
        }
        list.truncate(count);
        Ok(list)
    }
}

/// Executable file name of a running process
pub fn process_image_name(pid: u32) -> Option<String> {
    unsafe {
        let handle = OwnedHandle(OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?);
        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        QueryFullProcessImageNameW(handle.0, PROCESS_NAME_WIN32, PWSTR(buf.as_mut_ptr()), &mut len)
            .ok()?;
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        let name = path.rsplit('\\').next().unwrap_or(&path);
        Some(name.to_string())
    }
}

fn win_error(e: windows::core::Error) -> PtyError {
    PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// `KEY=VALUE\0...\0\0`, sorted case-insensitively as CreateProcessW expects
fn environment_block(env: &[(String, String)]) -> Vec<u16> {
    let mut vars: Vec<&(String, String)> = env.iter().collect();
    vars.sort_by_key(|(k, _)| k.to_uppercase());
    let mut block = Vec::new();
    for (k, v) in vars {
        block.extend(format!("{}={}", k, v).encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}
